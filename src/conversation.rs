//! Conversation lifecycle: deterministic pair keys, get-or-create, and the
//! two-step delete.

use crate::flog;
use crate::logging;
use crate::storage::{ConversationRow, Storage, StorageError};

/// Deterministic conversation key for a pair of users: the sorted pair
/// joined with an underscore. Both orderings of the same pair produce the
/// same key, so at most one conversation exists per pair.
pub fn conversation_key(user_a: &str, user_b: &str) -> String {
    let (lo, hi) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("{lo}_{hi}")
}

/// Get-or-create the conversation between two users.
///
/// A fresh conversation starts with zeroed counters and no last-message
/// summary. There is no guard beyond the store's own arbitration on
/// concurrent creates; both first-contacts may attempt the insert and the
/// store keeps one.
pub fn start_or_get_conversation(
    storage: &Storage,
    user_a: &str,
    user_b: &str,
) -> Result<ConversationRow, StorageError> {
    if user_a == user_b {
        return Err(StorageError::Precondition(
            "a conversation needs two distinct participants".to_string(),
        ));
    }
    let key = conversation_key(user_a, user_b);
    storage.create_conversation_if_absent(&key, user_a, user_b)
}

/// Delete a conversation: all message documents first, then the parent
/// document, in two separate commits.
///
/// There is no atomicity across the two steps. A crash in between leaves an
/// empty conversation shell — never orphaned-but-visible messages, which is
/// why the messages go first.
pub fn delete_conversation(storage: &Storage, conversation_id: &str) -> Result<(), StorageError> {
    let deleted = storage.delete_conversation_messages(conversation_id)?;
    storage.delete_conversation_record(conversation_id)?;
    flog!(
        "delete: {} ({deleted} message(s) removed)",
        logging::conv_id(conversation_id)
    );
    Ok(())
}
