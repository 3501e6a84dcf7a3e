use std::fmt;

use crate::sanitizer::lint::LintCode;

/// The single error type for the execution core.
///
/// Every error kind named in the design (lint violations, missing
/// contracts, metering failures, encoder failures, merge conflicts, ...)
/// is a variant here rather than a family of distinct types, matching the
/// flat-enum-with-`Display` shape the rest of this codebase uses for its
/// errors (see `encoding::EncodingError`).
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Lint found one or more disallowed constructs; submission must be
    /// refused wholesale, see codes collected in the vector.
    LintViolation(Vec<LintCode>),

    /// A contract import named a contract that doesn't exist in the store.
    ContractNotFound(String),

    /// Pre-flight metering check failed: sender's balance can't cover the
    /// requested stamp budget.
    InsufficientStamps { balance: i128, stamps_requested: u64 },

    /// Mid-flight metering failure: the tracer's accumulated cost exceeded
    /// the stamp budget for this call.
    OutOfStamps,

    /// A contract-level `assert` failed.
    RevertRequested(String),

    /// The requested backing-store kind isn't configured/available.
    DriverNotFound(String),

    /// A stored value's bytes could not be decoded, or a value could not
    /// be encoded (e.g. a float literal, which the encoder never produces).
    EncoderError(String),

    /// CRCache detected a write at merge time that disagrees with the
    /// value the writer originally observed.
    MergeConflict { key: Vec<u8>, expected: Option<Vec<u8>>, found: Option<Vec<u8>> },

    /// Call-stack depth exceeded `Config::recursion_limit`.
    RecursionLimit,

    /// A contract attempted to (transitively) import itself.
    ImportCycle(String),

    /// `CRCache::set_bag` was called while the pending-bag queue was at
    /// `Config::max_queue`.
    QueueFull,

    /// A `Config` value is internally inconsistent (e.g. an empty index
    /// separator) or required at configuration time but absent.
    Configuration(String),

    /// Wraps an underlying store I/O failure (disk error, connection
    /// refused, protocol error, ...).
    Store(String),

    /// Anything else raised by interpreted contract code (a caught
    /// exception-equivalent that isn't an `assert` failure).
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LintViolation(codes) => {
                write!(f, "lint violation(s): ")?;
                for (i, c) in codes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{c}")?;
                }
                Ok(())
            }
            Error::ContractNotFound(name) => write!(f, "contract not found: {name}"),
            Error::InsufficientStamps { balance, stamps_requested } => write!(
                f,
                "sender does not have enough stamps for the transaction: balance {balance} cannot cover {stamps_requested} stamps"
            ),
            Error::OutOfStamps => write!(f, "out of stamps"),
            Error::RevertRequested(msg) => write!(f, "assertion failed: {msg}"),
            Error::DriverNotFound(kind) => write!(f, "no driver registered for store kind: {kind}"),
            Error::EncoderError(msg) => write!(f, "encoder error: {msg}"),
            Error::MergeConflict { key, .. } => {
                write!(f, "merge conflict at key {}", String::from_utf8_lossy(key))
            }
            Error::RecursionLimit => write!(f, "recursion limit exceeded"),
            Error::ImportCycle(name) => write!(f, "import cycle detected at contract: {name}"),
            Error::QueueFull => write!(f, "sub-block bag queue is full"),
            Error::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Error::Store(msg) => write!(f, "store error: {msg}"),
            Error::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::EncoderError(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result alias used throughout the crate, matching the teacher's `CResult`.
pub type CResult<T> = Result<T, Error>;
