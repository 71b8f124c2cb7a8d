//! Message channel: the live message history of one conversation, and the
//! send path.

use tokio::sync::broadcast;

use crate::flog;
use crate::logging;
use crate::storage::{Change, MessageRow, Storage, StorageError};
use crate::subscription::{SnapshotSink, Subscription};

pub struct MessageChannel {
    storage: Storage,
}

impl MessageChannel {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Live message history for one conversation, ascending by timestamp.
    ///
    /// The sink receives the current history immediately, then the full
    /// list again on every change — each delivery replaces the previous
    /// snapshot.
    pub fn subscribe_messages<S>(&self, conversation_id: &str, sink: S) -> Subscription
    where
        S: SnapshotSink<Vec<MessageRow>> + 'static,
    {
        let storage = self.storage.clone();
        let conversation_id = conversation_id.to_string();
        let mut rx = self.storage.subscribe_changes();
        let handle = tokio::spawn(async move {
            publish_messages(&storage, &conversation_id, &sink);
            loop {
                match rx.recv().await {
                    Ok(Change::Messages {
                        conversation_id: changed,
                    }) if changed == conversation_id => {
                        publish_messages(&storage, &conversation_id, &sink);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        publish_messages(&storage, &conversation_id, &sink);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(handle)
    }

    /// Send a text message into a conversation.
    ///
    /// Precondition violations are silent no-ops returning `Ok(None)`: text
    /// that trims to empty, an unknown conversation, or a sender who is not
    /// a participant. A store failure during the write comes back as an
    /// error for the caller to surface; nothing is retried and no partial
    /// state is left behind.
    pub fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<Option<MessageRow>, StorageError> {
        let body = text.trim();
        if body.is_empty() {
            return Ok(None);
        }
        match self.storage.append_message(conversation_id, sender_id, body) {
            Ok(message) => {
                flog!(
                    "send: {} -> {}",
                    logging::user_id(sender_id),
                    logging::conv_id(conversation_id)
                );
                Ok(Some(message))
            }
            Err(StorageError::NotFound(_)) | Err(StorageError::Precondition(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn publish_messages<S>(storage: &Storage, conversation_id: &str, sink: &S)
where
    S: SnapshotSink<Vec<MessageRow>>,
{
    match storage.list_messages(conversation_id) {
        Ok(messages) => sink.publish(messages),
        // Refresh failures leave the previous snapshot standing; the next
        // change triggers another attempt.
        Err(e) => flog!("channel: refresh failed for {conversation_id}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::start_or_get_conversation;

    fn channel() -> (Storage, MessageChannel) {
        let storage = Storage::open_in_memory().unwrap();
        (storage.clone(), MessageChannel::new(storage))
    }

    #[test]
    fn empty_text_is_silently_dropped() {
        let (storage, channel) = channel();
        start_or_get_conversation(&storage, "uma", "ravi").unwrap();
        assert!(channel.send("ravi_uma", "uma", "   ").unwrap().is_none());
        assert!(channel.send("ravi_uma", "uma", "").unwrap().is_none());
        assert!(storage.list_messages("ravi_uma").unwrap().is_empty());
    }

    #[test]
    fn outsider_and_unknown_conversation_are_silent() {
        let (storage, channel) = channel();
        start_or_get_conversation(&storage, "uma", "ravi").unwrap();
        assert!(channel.send("ravi_uma", "mallory", "hi").unwrap().is_none());
        assert!(channel.send("ghost", "uma", "hi").unwrap().is_none());
    }

    #[test]
    fn sent_text_is_trimmed() {
        let (storage, channel) = channel();
        start_or_get_conversation(&storage, "uma", "ravi").unwrap();
        let sent = channel.send("ravi_uma", "uma", "  salut  ").unwrap().unwrap();
        assert_eq!(sent.body, "salut");
        let listed = storage.list_messages("ravi_uma").unwrap();
        assert_eq!(listed[0].body, "salut");
    }
}
