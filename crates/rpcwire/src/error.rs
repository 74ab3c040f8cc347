//! # Error Definitions
//!
//! Failures while building or parsing frames. These are protocol failures;
//! what the remote function reported travels inside the reply as a
//! `TeErrno` and never shows up here.

use rpcpack::Error as PackError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying rpcpack serialization failed.
    Codec(PackError),
    /// A frame lacked a header field that has no default.
    MissingField(&'static str),
    /// An unknown top-level frame kind or flag name was encountered.
    UnknownVariant(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "codec: {}", e),
            Error::MissingField(name) => write!(f, "missing header field '{}'", name),
            Error::UnknownVariant(name) => write!(f, "unknown variant '{}'", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Codec(e) }
}

/// A specialized Result type for frame operations.
pub type Result<T> = std::result::Result<T, Error>;
