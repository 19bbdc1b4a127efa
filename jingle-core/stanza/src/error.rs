use std::fmt;

use crate::jid::JidError;

#[derive(Debug, Clone)]
pub enum BinaryError {
    AttrParse(String),
    MissingAttr(String),
    Jid(JidError),
    AttrList(Vec<BinaryError>),
}

impl fmt::Display for BinaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryError::AttrParse(s) => write!(f, "Attribute parsing failed: {s}"),
            BinaryError::MissingAttr(s) => write!(f, "Missing required attribute: {s}"),
            BinaryError::Jid(e) => write!(f, "JID parsing error: {e}"),
            BinaryError::AttrList(list) => write!(f, "Multiple attribute parsing errors: {list:?}"),
        }
    }
}

impl std::error::Error for BinaryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BinaryError::Jid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<JidError> for BinaryError {
    fn from(err: JidError) -> Self {
        BinaryError::Jid(err)
    }
}

pub type Result<T> = std::result::Result<T, BinaryError>;
