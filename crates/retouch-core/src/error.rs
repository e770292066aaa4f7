use thiserror::Error;

/// Expected, recoverable domain conditions. Handlers map these to specific
/// user-facing messages; none of them should ever crash a request handler.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("a task is already being processed, about {remaining_minutes} minutes left")]
    TaskAlreadyActive { remaining_minutes: i64 },
    #[error("processing gateway unavailable: {0}")]
    VendorUnavailable(String),
    #[error("processing gateway is out of capacity")]
    VendorQuotaExhausted,
    #[error("no active task matches the callback")]
    UnknownTask,
    #[error("a user cannot be their own referrer")]
    SelfReferral,
    #[error("referrer is already set")]
    AlreadyLinked,
    #[error("referrer account not found")]
    ReferrerNotFound,
    #[error("referral link would form a cycle")]
    CyclicReferral,
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
