use serde::Serialize;

/// Which registry collection an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Outgoing invitation waiting for the peer.
    Request,
    /// Incoming invitation, ringing or accepted and waiting for session start.
    Incoming,
    Session,
}

/// Hangup filter on the kind of call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallType {
    #[default]
    Any,
    Media,
    /// File transfer.
    Data,
}

impl CallType {
    pub fn matches(&self, is_data_call: bool) -> bool {
        match self {
            CallType::Any => true,
            CallType::Media => !is_data_call,
            CallType::Data => is_data_call,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_type_filter() {
        assert!(CallType::Any.matches(true));
        assert!(CallType::Media.matches(false));
        assert!(!CallType::Media.matches(true));
        assert!(CallType::Data.matches(true));
    }
}
