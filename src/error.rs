use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// CinderDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The key has no live record in the index or cache.
    NotFound,
    /// A read's offset + size exceeds the stored payload.
    Range,
    /// An IO error. Partially written bytes are left unreachable in the
    /// stream; the stream offset is not advanced.
    IO(String),
    /// Buffer allocation or the history rewrite hook failed.
    Resource(String),
    /// The operation is not supported by this component.
    Unsupported,
    /// Invalid or missing configuration.
    Config(String),
    /// Invalid on-disk or wire data, typically decoding errors or corruption.
    InvalidData(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "record not found"),
            Error::Range => write!(f, "offset/size out of range"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Resource(msg) => write!(f, "resource failure: {msg}"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl Error {
    /// Negative errno for the dispatch layer, which surfaces errors as
    /// protocol-level status integers.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound => -libc::ENOENT,
            Error::Range => -libc::EINVAL,
            Error::IO(_) => -libc::EIO,
            Error::Resource(_) => -libc::ENOMEM,
            Error::Unsupported => -libc::ENOTSUP,
            Error::Config(_) => -libc::EINVAL,
            Error::InvalidData(_) => -libc::EINVAL,
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::Config for the given format string.
#[macro_export]
macro_rules! errconfig {
    ($($args:tt)*) => { $crate::error::Error::Config(format!($($args)*)).into() };
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
