//! Call-related error types.

use jingle_core::types::ResultCode;
use thiserror::Error;

use super::media::MediaError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("no stream: {0}")]
    NoStream(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::request::InvalidTransition),

    #[error("call already exists: {0}")]
    AlreadyExists(String),

    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("invalid signaling type: {0}")]
    InvalidSignalingType(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("stats unavailable: {0}")]
    NoStats(String),

    #[error("call engine is not running")]
    EngineStopped,
}

impl CallError {
    /// Numeric code reported across the facade boundary.
    pub fn code(&self) -> ResultCode {
        match self {
            CallError::InvalidArgument(_) => ResultCode::InvalidArgument,
            CallError::NotFound(_) => ResultCode::NotFound,
            CallError::NoStream(_) => ResultCode::NoStream,
            _ => ResultCode::Unknown,
        }
    }
}

impl From<jingle_core::stanza::BinaryError> for CallError {
    fn from(err: jingle_core::stanza::BinaryError) -> Self {
        CallError::Parse(err.to_string())
    }
}
