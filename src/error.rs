//! Error types for the escrow system
//!
//! The taxonomy separates caller-fixable failures (validation, guard
//! rejections) from transfer failures where a side effect may or may not
//! have reached the chain. Callers must re-query before retrying after a
//! `ConfirmationTimeout`; every other failure leaves the record untouched.

use thiserror::Error;
use uuid::Uuid;

/// Failure modes of a single fund-transfer attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    /// Signer callback refused or errored; nothing was submitted
    #[error("signature denied: {0}")]
    SignatureDenied(String),

    /// Network rejected the raw transaction; nothing reached the chain
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    /// Submitted but not confirmed within the polling bound. Unknown
    /// outcome: re-query before assuming funds did not move.
    #[error("confirmation timeout for transfer {reference}")]
    ConfirmationTimeout { reference: String },

    /// Confirmed on chain but the transfer itself reported an error
    #[error("on-chain execution error: {0}")]
    ExecutionError(String),
}

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input, caller-fixable, no side effect occurred
    #[error("validation error: {0}")]
    Validation(String),

    /// Balance preflight failed, no transfer was attempted
    #[error(
        "insufficient balance in {wallet}: required {required}, available {available:?}"
    )]
    InsufficientBalance {
        wallet: String,
        required: u64,
        available: Option<u64>,
    },

    /// State machine guard rejected the (state, event) pair
    #[error("invalid transition: cannot apply {event} from {from}")]
    InvalidTransition { from: String, event: String },

    /// Idempotency guard: escrow was already funded
    #[error("escrow {0} is already funded")]
    AlreadyFunded(Uuid),

    /// Idempotency guard: escrow was already released
    #[error("escrow {0} is already released")]
    AlreadyReleased(Uuid),

    /// Unknown escrow or stream id
    #[error("not found: {0}")]
    NotFound(String),

    /// Transfer orchestration failed; see [`TransferFailure`]
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferFailure),

    /// Ledger store errors
    #[error("store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-transition error
    pub fn invalid_transition<S: Into<String>>(from: S, event: S) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            event: event.into(),
        }
    }
}
