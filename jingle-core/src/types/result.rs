use std::fmt;

/// Numeric result codes returned across the facade boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok = 0,
    InvalidArgument = -1,
    Unknown = -2,
    NotFound = -3,
    NoStream = -4,
    AlreadyCanceled = -5,
}

impl ResultCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            -1 => Self::InvalidArgument,
            -3 => Self::NotFound,
            -4 => Self::NoStream,
            -5 => Self::AlreadyCanceled,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid argument",
            Self::Unknown => "unknown error",
            Self::NotFound => "not found",
            Self::NoStream => "no stream",
            Self::AlreadyCanceled => "already canceled",
        };
        write!(f, "{}: {}", self.code(), msg)
    }
}

/// Failure of an answer attempt on an incoming call handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnswerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("call request is no longer valid")]
    AlreadyCanceled,
    #[error("call engine is not running")]
    EngineStopped,
}

impl AnswerError {
    pub fn code(&self) -> ResultCode {
        match self {
            AnswerError::InvalidArgument(_) => ResultCode::InvalidArgument,
            AnswerError::AlreadyCanceled => ResultCode::AlreadyCanceled,
            AnswerError::EngineStopped => ResultCode::Unknown,
        }
    }
}
