use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Database unavailable, corrupt, or opened at an older version
    #[error("Open failed: {0}")]
    Open(String),

    /// Schema creation failed; the prior version is left intact
    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    /// Record failed structural validation or a unique index check
    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    /// Operation issued against a transaction that is not active
    #[error("Transaction inactive: {0}")]
    TransactionInactive(String),

    /// Operation discarded because its transaction aborted
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Write attempted in read-only transaction: {0}")]
    ReadOnly(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Open(_) => "OPEN_ERROR",
            Error::Upgrade(_) => "UPGRADE_ERROR",
            Error::Constraint(_) => "CONSTRAINT_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::TransactionInactive(_) => "TRANSACTION_INACTIVE",
            Error::TransactionAborted(_) => "TRANSACTION_ABORTED",
            Error::ReadOnly(_) => "READ_ONLY",
            Error::Corruption(_) => "CORRUPTION",
            Error::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// An aborted transaction can be replayed from scratch; logical errors
    /// like a constraint violation will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::TransactionAborted(_) => true,

            Error::Open(_) => false,
            Error::Upgrade(_) => false,
            Error::Constraint(_) => false,
            Error::NotFound(_) => false,
            Error::TransactionInactive(_) => false,
            Error::ReadOnly(_) => false,
            Error::Corruption(_) => false,
            Error::ChecksumMismatch => false,
            Error::InvalidArgument(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Produce an equivalent error value.
    ///
    /// `io::Error` is not `Clone`, so IO failures keep their kind and message only.
    /// Used where one failure has to be reported to several listeners.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Open(m) => Error::Open(m.clone()),
            Error::Upgrade(m) => Error::Upgrade(m.clone()),
            Error::Constraint(m) => Error::Constraint(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::TransactionInactive(m) => Error::TransactionInactive(m.clone()),
            Error::TransactionAborted(m) => Error::TransactionAborted(m.clone()),
            Error::ReadOnly(m) => Error::ReadOnly(m.clone()),
            Error::Corruption(m) => Error::Corruption(m.clone()),
            Error::ChecksumMismatch => Error::ChecksumMismatch,
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
            Error::Internal(m) => Error::Internal(m.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
