//! Signaling message types exchanged during call negotiation.

use std::fmt;

/// Call signaling messages, carried in the `type` attribute of a
/// `<message>` stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingType {
    /// Sent by the caller to one device (full JID) or all devices (bare JID).
    Invite,
    /// Callee accepts; carries its own key material and full address.
    Answer,
    /// Callee rejects, with optional reason and free-text body.
    Decline,
    /// Caller withdraws the invitation before it was answered.
    Cancel,
    /// Caller tells the invitee's other devices who handled the call.
    CallHandled,
}

impl SignalingType {
    pub const ALL: [SignalingType; 5] = [
        Self::Invite,
        Self::Answer,
        Self::Decline,
        Self::Cancel,
        Self::CallHandled,
    ];

    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Invite => "call-invite",
            Self::Answer => "call-answer",
            Self::Decline => "call-decline",
            Self::Cancel => "call-cancel",
            Self::CallHandled => "call-handled",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag_name() == tag)
    }

    /// Messages that only the inviting side sends.
    pub fn is_from_caller(&self) -> bool {
        matches!(self, Self::Invite | Self::Cancel | Self::CallHandled)
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// Reason sent in a cancel notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Caller,
    AnswerTimeout,
}

impl CancelReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::AnswerTimeout => "answer-timeout",
        }
    }

    /// Unknown reasons are treated as a caller cancel.
    pub fn parse(s: &str) -> Self {
        match s {
            "answer-timeout" => Self::AnswerTimeout,
            _ => Self::Caller,
        }
    }
}
