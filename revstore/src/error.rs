use std::fmt::{self, Display};

/// Result alias used throughout the crate.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced by the store. Each variant is a distinguished kind so
/// that callers can react to lock contention or out-of-date transactions
/// without string matching.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The transaction's base revision is no longer the head revision.
    TxnOutOfDate,

    /// The proto-rev file of a transaction is already locked for writing,
    /// either by this process or by another one. Callers may retry.
    RepBeingWritten(String),

    /// An on-disk invariant was violated.
    Corrupt(String),

    /// A transaction directory with the given name does not exist.
    NoSuchTransaction(String),

    /// The legacy transaction directory probe ran out of candidate names.
    UniqueNamesExhausted(String),

    /// A wire format could not be parsed.
    Parse(String),

    /// An unexpected internal condition, including I/O failures.
    Internal(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TxnOutOfDate => write!(f, "transaction out of date"),
            Error::RepBeingWritten(s) => write!(f, "{}", s),
            Error::Corrupt(s) => write!(f, "corrupt store: {}", s),
            Error::NoSuchTransaction(s) => write!(f, "no such transaction '{}'", s),
            Error::UniqueNamesExhausted(s) => write!(f, "{}", s),
            Error::Parse(s) => write!(f, "parse error: {}", s),
            Error::Internal(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}
