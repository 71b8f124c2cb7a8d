//! Per-user orchestration: one `Session` per signed-in user, composing the
//! presence tracker, conversation directory, message channel, and
//! read-receipt tracker, and publishing state snapshots to the presentation
//! layer as [`SessionEvent`]s.
//!
//! Every failure is converted at this boundary into either a user-visible
//! event or a silent no-op; nothing propagates further up.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::auth::SessionIdentity;
use crate::channel::MessageChannel;
use crate::conversation;
use crate::directory::{ConversationDirectory, ConversationEntry, ProfileCache};
use crate::presence::{PresenceSnapshot, PresenceTable, PresenceTracker};
use crate::receipts::ReadReceiptTracker;
use crate::storage::{ConversationRow, MessageRow, Storage, StorageError};
use crate::subscription::Subscription;
use crate::{flog, logging};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Snapshot events toward the presentation layer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ConversationList {
        conversations: Vec<ConversationEntry>,
    },
    Messages {
        conversation_id: String,
        messages: Vec<MessageRow>,
    },
    Presence {
        users: PresenceSnapshot,
    },
    SendFailed {
        conversation_id: String,
        detail: String,
    },
}

struct ActiveConversation {
    conversation_id: String,
    _messages: Subscription,
    _receipts: Subscription,
}

pub struct Session {
    storage: Storage,
    user_id: String,
    events: broadcast::Sender<SessionEvent>,
    directory: ConversationDirectory,
    channel: MessageChannel,
    receipts: ReadReceiptTracker,
    tracker: PresenceTracker,
    active: Mutex<Option<ActiveConversation>>,
    _directory_sub: Subscription,
    _presence_sub: Subscription,
}

impl Session {
    /// Start a session for a signed-in identity: provision the profile on
    /// first sign-in, mark the user online (with the store-side offline
    /// fallback armed), and attach the directory and presence
    /// subscriptions.
    pub fn sign_in(
        storage: Storage,
        presence: &PresenceTable,
        identity: SessionIdentity,
    ) -> Result<Self, StorageError> {
        if identity.ensure_profile(&storage)? {
            flog!(
                "session: first sign-in, profile created for {}",
                logging::user_id(&identity.user_id)
            );
        }
        let user_id = identity.user_id;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let cache = Arc::new(ProfileCache::new());
        let directory = ConversationDirectory::new(storage.clone(), cache);
        let channel = MessageChannel::new(storage.clone());
        let receipts = ReadReceiptTracker::new(storage.clone());
        let tracker = PresenceTracker::new(presence);
        tracker.set_online(&user_id);

        let directory_events = events.clone();
        let directory_sub = directory.subscribe_conversations(
            &user_id,
            move |conversations: Vec<ConversationEntry>| {
                let _ = directory_events.send(SessionEvent::ConversationList { conversations });
            },
        );

        let presence_events = events.clone();
        let presence_sub = tracker.subscribe_all(move |users: PresenceSnapshot| {
            let _ = presence_events.send(SessionEvent::Presence { users });
        });

        flog!("session: {} signed in", logging::user_id(&user_id));
        Ok(Self {
            storage,
            user_id,
            events,
            directory,
            channel,
            receipts,
            tracker,
            active: Mutex::new(None),
            _directory_sub: directory_sub,
            _presence_sub: presence_sub,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Subscribe to the session's event stream. Only events published after
    /// this call are delivered.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.conversation_id.clone())
    }

    /// Open (or create) the conversation with a counterpart and make it the
    /// active one: the previous message subscription is detached, a new one
    /// is attached, and the read-receipt reaction starts running against
    /// the new conversation.
    pub fn open_conversation(
        &self,
        counterpart_id: &str,
    ) -> Result<ConversationRow, StorageError> {
        let row =
            conversation::start_or_get_conversation(&self.storage, &self.user_id, counterpart_id)?;
        let conversation_id = row.conversation_id.clone();

        let message_events = self.events.clone();
        let event_conversation = conversation_id.clone();
        let messages = self
            .channel
            .subscribe_messages(&conversation_id, move |messages: Vec<MessageRow>| {
                let _ = message_events.send(SessionEvent::Messages {
                    conversation_id: event_conversation.clone(),
                    messages,
                });
            });
        let receipts = self.receipts.attach(&conversation_id, &self.user_id);

        let mut active = self.active.lock().unwrap();
        // Detach the previous subscriptions before storing the replacement.
        active.take();
        *active = Some(ActiveConversation {
            conversation_id: conversation_id.clone(),
            _messages: messages,
            _receipts: receipts,
        });
        flog!(
            "session: {} opened {}",
            logging::user_id(&self.user_id),
            logging::conv_id(&conversation_id)
        );
        Ok(row)
    }

    /// Leave the active conversation, detaching its subscriptions.
    pub fn close_conversation(&self) {
        self.active.lock().unwrap().take();
    }

    /// Send text into the active conversation.
    ///
    /// With no active conversation, or text that trims to empty, this is a
    /// silent no-op. A store failure fires a [`SessionEvent::SendFailed`]
    /// and is not retried; the caller's compose box has already been
    /// cleared by then.
    pub fn send(&self, text: &str) {
        let Some(conversation_id) = self.active_conversation() else {
            return;
        };
        if let Err(e) = self.channel.send(&conversation_id, &self.user_id, text) {
            flog!(
                "session: send into {} failed: {e}",
                logging::conv_id(&conversation_id)
            );
            let _ = self.events.send(SessionEvent::SendFailed {
                conversation_id,
                detail: e.to_string(),
            });
        }
    }

    /// Delete a conversation and its messages. Closes it first if it is the
    /// active one.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), StorageError> {
        {
            let mut active = self.active.lock().unwrap();
            if active
                .as_ref()
                .is_some_and(|a| a.conversation_id == conversation_id)
            {
                active.take();
            }
        }
        conversation::delete_conversation(&self.storage, conversation_id)
    }

    /// End the session: detach everything and commit the offline fallback
    /// immediately instead of waiting for the connection to drop.
    pub fn sign_out(self) {
        self.tracker.disconnect();
        flog!("session: {} signed out", logging::user_id(&self.user_id));
    }
}
