//! Error types for the presence tracker.

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The session id was never issued. The client must start a new session.
    #[error("session {0} not found")]
    NotFound(i64),
    /// Storage failures pass through untouched.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PresenceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PresenceError::NotFound(_))
    }
}
