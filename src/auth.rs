//! The identity boundary toward the external authentication provider.
//!
//! The messaging core never talks to the provider itself; it only reads the
//! per-session identity the provider produced and provisions a profile for
//! it on first sign-in. Provider failures are mapped to a small fixed set
//! of user-facing messages; anything unrecognized falls back to a generic
//! message carrying whatever detail the provider supplied.

use crate::storage::{now_millis, ProfileRow, Storage, StorageError};

/// The stable identity of a signed-in user, as read from the provider.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub verified: bool,
}

impl SessionIdentity {
    /// Create the user's profile if this is their first sign-in. Existing
    /// profiles are never touched or deleted here. Returns whether a
    /// profile was created.
    pub fn ensure_profile(&self, storage: &Storage) -> Result<bool, StorageError> {
        storage.ensure_profile(&ProfileRow {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            photo_url: self.photo_url.clone(),
            verified: self.verified,
            visible: true,
            created_at: now_millis(),
        })
    }
}

/// Sign-in failures, reduced to the cases a user can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    BadCredential,
    EmailAlreadyRegistered,
    WeakCredential,
    PopupDismissed,
    Provider(String),
}

impl AuthError {
    /// Map a provider error code to the taxonomy. Unrecognized codes keep
    /// the provider's own detail string.
    pub fn from_provider_code(code: &str, detail: &str) -> Self {
        match code {
            "invalid-credential" | "wrong-password" | "user-not-found" => {
                AuthError::BadCredential
            }
            "email-already-registered" | "email-already-in-use" => {
                AuthError::EmailAlreadyRegistered
            }
            "weak-credential" | "weak-password" => AuthError::WeakCredential,
            "popup-dismissed" | "popup-closed-by-user" => AuthError::PopupDismissed,
            _ => AuthError::Provider(detail.to_string()),
        }
    }

    /// The message shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::BadCredential => "Incorrect email or password.".to_string(),
            AuthError::EmailAlreadyRegistered => {
                "An account with this email already exists.".to_string()
            }
            AuthError::WeakCredential => "Please pick a stronger password.".to_string(),
            AuthError::PopupDismissed => "Sign-in was cancelled.".to_string(),
            AuthError::Provider(detail) => format!("Sign-in failed: {detail}"),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AuthError {}
