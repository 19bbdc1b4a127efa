use serde::{Serialize, Serializer};
use std::fmt;

/// Closed set of reasons a call request or session can end.
///
/// Codes below [`TermCode::ERROR_BASE`] are normal endings, the rest are errors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermCode {
    UserHangup = 0,
    CallReqCancel = 1,
    AnsweredElsewhere = 2,
    RejectedElsewhere = 3,
    AnswerTimeout = 4,
    AppTerminating = 5,
    InitiateTimeout = 8,
    ApiTimeout = 9,
    FprVerifFail = 10,
    ProtoTimeout = 11,
    ProtoError = 12,
    InternalError = 13,
    NoMediaError = 14,
    MediaExchangeTimeout = 15,
    XmppDisconnError = 16,
}

impl TermCode {
    pub const ERROR_BASE: u8 = 8;
    /// Set on the wire/numeric form when the condition originated at the remote side.
    pub const PEER: u8 = 0x80;

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn is_error(&self) -> bool {
        self.code() >= Self::ERROR_BASE
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::UserHangup,
            1 => Self::CallReqCancel,
            2 => Self::AnsweredElsewhere,
            3 => Self::RejectedElsewhere,
            4 => Self::AnswerTimeout,
            5 => Self::AppTerminating,
            8 => Self::InitiateTimeout,
            9 => Self::ApiTimeout,
            10 => Self::FprVerifFail,
            11 => Self::ProtoTimeout,
            12 => Self::ProtoError,
            13 => Self::InternalError,
            14 => Self::NoMediaError,
            15 => Self::MediaExchangeTimeout,
            16 => Self::XmppDisconnError,
            _ => return None,
        })
    }

    /// Reason string carried in decline/cancel stanzas and stats.
    pub fn reason_str(&self) -> &'static str {
        match self {
            Self::UserHangup => "hangup",
            Self::CallReqCancel => "call-req-cancel",
            Self::AnsweredElsewhere => "answered-elsewhere",
            Self::RejectedElsewhere => "rejected-elsewhere",
            Self::AnswerTimeout => "answer-timeout",
            Self::AppTerminating => "app-terminating",
            Self::InitiateTimeout => "initiate-timeout",
            Self::ApiTimeout => "api-timeout",
            Self::FprVerifFail => "fpr-verify-failed",
            Self::ProtoTimeout => "protocol-timeout",
            Self::ProtoError => "protocol-error",
            Self::InternalError => "internal-error",
            Self::NoMediaError => "no-media",
            Self::MediaExchangeTimeout => "media-exchange-timeout",
            Self::XmppDisconnError => "xmpp-disconnect",
        }
    }

    pub fn from_reason_str(reason: &str) -> Option<Self> {
        [
            Self::UserHangup,
            Self::CallReqCancel,
            Self::AnsweredElsewhere,
            Self::RejectedElsewhere,
            Self::AnswerTimeout,
            Self::AppTerminating,
            Self::InitiateTimeout,
            Self::ApiTimeout,
            Self::FprVerifFail,
            Self::ProtoTimeout,
            Self::ProtoError,
            Self::InternalError,
            Self::NoMediaError,
            Self::MediaExchangeTimeout,
            Self::XmppDisconnError,
        ]
        .into_iter()
        .find(|code| code.reason_str() == reason)
    }
}

impl fmt::Display for TermCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_str())
    }
}

/// A [`TermCode`] together with which side caused it. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Termination {
    code: TermCode,
    by_peer: bool,
}

impl Termination {
    pub fn local(code: TermCode) -> Self {
        Self {
            code,
            by_peer: false,
        }
    }

    pub fn peer(code: TermCode) -> Self {
        Self {
            code,
            by_peer: true,
        }
    }

    pub fn code(&self) -> TermCode {
        self.code
    }

    pub fn by_peer(&self) -> bool {
        self.by_peer
    }

    pub fn is_error(&self) -> bool {
        self.code.is_error()
    }

    /// Numeric form with the peer bit applied.
    pub fn to_u8(&self) -> u8 {
        if self.by_peer {
            self.code.code() | TermCode::PEER
        } else {
            self.code.code()
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let code = TermCode::from_code(value & !TermCode::PEER)?;
        Some(Self {
            code,
            by_peer: value & TermCode::PEER != 0,
        })
    }
}

impl From<TermCode> for Termination {
    fn from(code: TermCode) -> Self {
        Termination::local(code)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.by_peer {
            write!(f, "peer-{}", self.code)
        } else {
            write!(f, "{}", self.code)
        }
    }
}

impl Serialize for Termination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_u8())
    }
}
