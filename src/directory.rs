//! Conversation directory: the live, last-update-ordered conversation list
//! for one user, with participant identities resolved through a shared
//! profile cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::flog;
use crate::storage::{Change, ConversationRow, ProfileRow, Storage, StorageError};
use crate::subscription::{SnapshotSink, Subscription};

/// Insert-only profile cache shared between subscribers.
///
/// Entries are merged in and never evicted; the working set is a user's
/// direct contacts, which stays small. Not a singleton — callers hold an
/// `Arc` and pass it where it is needed.
#[derive(Default)]
pub struct ProfileCache {
    entries: Mutex<HashMap<String, ProfileRow>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<ProfileRow> {
        self.entries.lock().unwrap().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(user_id)
    }

    /// Merge fetched profiles into the cache. Keys only ever accumulate.
    pub fn merge(&self, profiles: Vec<ProfileRow>) {
        let mut entries = self.entries.lock().unwrap();
        for profile in profiles {
            entries.insert(profile.user_id.clone(), profile);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// One directory row: a conversation plus the resolved counterpart profile.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub conversation: ConversationRow,
    pub counterpart: ProfileRow,
}

pub struct ConversationDirectory {
    storage: Storage,
    cache: Arc<ProfileCache>,
}

impl ConversationDirectory {
    pub fn new(storage: Storage, cache: Arc<ProfileCache>) -> Self {
        Self { storage, cache }
    }

    pub fn cache(&self) -> &Arc<ProfileCache> {
        &self.cache
    }

    /// Resolve a list of identities to profiles.
    ///
    /// Identities are deduplicated; anything already cached is not fetched
    /// again. Fetched profiles merge into the shared cache. Identities with
    /// no stored profile are omitted from the result.
    pub fn resolve_participants(
        &self,
        user_ids: &[String],
    ) -> Result<Vec<ProfileRow>, StorageError> {
        let wanted: Vec<String> = user_ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| !self.cache.contains(id))
            .cloned()
            .collect();
        if !wanted.is_empty() {
            let fetched = self.storage.get_profiles(&wanted)?;
            self.cache.merge(fetched);
        }

        let mut seen = BTreeSet::new();
        Ok(user_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| self.cache.get(id))
            .collect())
    }

    /// Live conversation list for one user, descending by last update.
    ///
    /// The sink receives the current list immediately, then a full snapshot
    /// whenever a relevant conversation or profile changes. A conversation
    /// whose counterpart profile has not resolved yet is left out entirely
    /// rather than shown half-filled.
    pub fn subscribe_conversations<S>(&self, user_id: &str, sink: S) -> Subscription
    where
        S: SnapshotSink<Vec<ConversationEntry>> + 'static,
    {
        let storage = self.storage.clone();
        let cache = Arc::clone(&self.cache);
        let user_id = user_id.to_string();
        let mut rx = self.storage.subscribe_changes();
        let handle = tokio::spawn(async move {
            publish_entries(&storage, &cache, &user_id, &sink);
            loop {
                match rx.recv().await {
                    Ok(Change::Conversations { participants })
                        if participants.iter().any(|p| p == &user_id) =>
                    {
                        publish_entries(&storage, &cache, &user_id, &sink);
                    }
                    Ok(Change::Profiles { .. }) => {
                        // A profile landing can unhide a conversation.
                        publish_entries(&storage, &cache, &user_id, &sink);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        publish_entries(&storage, &cache, &user_id, &sink);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(handle)
    }
}

fn publish_entries<S>(storage: &Storage, cache: &ProfileCache, user_id: &str, sink: &S)
where
    S: SnapshotSink<Vec<ConversationEntry>>,
{
    match build_entries(storage, cache, user_id) {
        Ok(entries) => sink.publish(entries),
        // Refresh failures leave the previous snapshot standing; the next
        // change triggers another attempt.
        Err(e) => flog!("directory: refresh failed for {user_id}: {e}"),
    }
}

fn build_entries(
    storage: &Storage,
    cache: &ProfileCache,
    user_id: &str,
) -> Result<Vec<ConversationEntry>, StorageError> {
    let conversations = storage.list_conversations_for(user_id)?;

    let counterparts: Vec<String> = conversations
        .iter()
        .filter_map(|c| c.counterpart_of(user_id))
        .map(str::to_string)
        .collect();
    let wanted: Vec<String> = counterparts
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|id| !cache.contains(id))
        .cloned()
        .collect();
    if !wanted.is_empty() {
        cache.merge(storage.get_profiles(&wanted)?);
    }

    Ok(conversations
        .into_iter()
        .filter_map(|conversation| {
            let counterpart = conversation
                .counterpart_of(user_id)
                .and_then(|id| cache.get(id))?;
            Some(ConversationEntry {
                conversation,
                counterpart,
            })
        })
        .collect())
}
