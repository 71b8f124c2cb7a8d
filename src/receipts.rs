//! Read-receipt tracking: the reaction that marks incoming messages read
//! while their conversation is the active one.

use tokio::sync::broadcast;

use crate::flog;
use crate::logging;
use crate::storage::{Change, Storage, StorageError};
use crate::subscription::Subscription;

pub struct ReadReceiptTracker {
    storage: Storage,
}

impl ReadReceiptTracker {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Run one read pass: every incoming message the reader has not seen
    /// gets them added to its read-set, and the reader's unread counter is
    /// zeroed — one atomic batch. Returns how many messages were marked;
    /// zero means nothing was written.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<usize, StorageError> {
        let marked = self
            .storage
            .mark_conversation_read(conversation_id, reader_id)?;
        if marked > 0 {
            flog!(
                "read: {} marked {marked} message(s) in {}",
                logging::user_id(reader_id),
                logging::conv_id(conversation_id)
            );
        }
        Ok(marked)
    }

    /// Attach the read reaction to a conversation for as long as the reader
    /// keeps it open: one pass immediately, then one after every message
    /// change. A pass that finds nothing writes nothing, so the reaction
    /// settles instead of feeding itself.
    pub fn attach(&self, conversation_id: &str, reader_id: &str) -> Subscription {
        let storage = self.storage.clone();
        let conversation_id = conversation_id.to_string();
        let reader_id = reader_id.to_string();
        let mut rx = self.storage.subscribe_changes();
        let handle = tokio::spawn(async move {
            let tracker = ReadReceiptTracker { storage };
            tracker.run_pass(&conversation_id, &reader_id);
            loop {
                match rx.recv().await {
                    Ok(Change::Messages {
                        conversation_id: changed,
                    }) if changed == conversation_id => {
                        tracker.run_pass(&conversation_id, &reader_id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        tracker.run_pass(&conversation_id, &reader_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(handle)
    }

    fn run_pass(&self, conversation_id: &str, reader_id: &str) {
        // A failed pass leaves state untouched; the next change retriggers.
        if let Err(e) = self.mark_conversation_read(conversation_id, reader_id) {
            flog!(
                "read: pass failed for {} in {}: {e}",
                logging::user_id(reader_id),
                logging::conv_id(conversation_id)
            );
        }
    }
}
