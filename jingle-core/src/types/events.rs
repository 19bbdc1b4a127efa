use async_trait::async_trait;
use jingle_stanza::Jid;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::stats::RtcStats;
use crate::types::{AnswerError, AvFlags, EntryKind, SessionId, Termination};

/// Handle given to the application for one incoming invitation.
///
/// `answer` may be called at most once with effect; later calls, or calls
/// after the caller canceled, fail with [`AnswerError::AlreadyCanceled`].
#[async_trait]
pub trait CallAnswer: Send + Sync + fmt::Debug {
    fn sid(&self) -> &SessionId;
    fn caller(&self) -> &Jid;
    /// Media the caller offered.
    fn peer_media(&self) -> AvFlags;
    /// Non-empty for file-transfer calls.
    fn files(&self) -> &[String];
    fn is_still_valid(&self) -> bool;
    async fn answer(
        &self,
        accept: bool,
        own_media: AvFlags,
        reason: Option<String>,
        text: Option<String>,
    ) -> Result<(), AnswerError>;
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

impl fmt::Debug for CoreEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("CoreEventBus")
            .field("handlers", &count)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingCallCreated {
    pub sid: SessionId,
    pub peer: Jid,
    pub media: AvFlags,
    pub is_data_call: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalMediaFail {
    pub sid: SessionId,
    pub error: String,
    /// Whether call setup goes on without local tracks.
    pub continued: bool,
}

#[derive(Debug, Clone)]
pub struct IncomingCallRequest {
    pub sid: SessionId,
    pub caller: Jid,
    pub media: AvFlags,
    pub files: Vec<String>,
    pub handle: Arc<dyn CallAnswer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallAnswered {
    pub sid: SessionId,
    pub peer: Jid,
    pub peer_media: AvFlags,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub sid: SessionId,
    pub peer: Jid,
    pub is_caller: bool,
    pub local_media: AvFlags,
    pub remote_media: AvFlags,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallDeclined {
    pub sid: SessionId,
    pub peer: Jid,
    pub reason: Option<String>,
    pub text: Option<String>,
    pub is_data_call: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallAnswerTimeout {
    pub sid: SessionId,
    pub peer: Jid,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaRecv {
    pub sid: SessionId,
    pub peer: Jid,
    pub stats_enabled: bool,
}

/// The single terminal event of a request, incoming call, or session.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub sid: SessionId,
    pub peer: Jid,
    pub kind: EntryKind,
    pub termination: Termination,
    pub text: Option<String>,
    pub stats: Arc<RtcStats>,
}

#[derive(Debug, Clone)]
pub enum Event {
    OutgoingCallCreated(OutgoingCallCreated),
    LocalMediaFail(LocalMediaFail),
    LocalVideoEnabled,
    LocalVideoDisabled,
    IncomingCallRequest(IncomingCallRequest),
    CallAnswered(CallAnswered),
    SessionCreated(SessionCreated),
    CallDeclined(CallDeclined),
    CallAnswerTimeout(CallAnswerTimeout),
    MediaRecv(MediaRecv),
    CallEnded(CallEnded),
}

impl Event {
    pub fn sid(&self) -> Option<&SessionId> {
        match self {
            Event::OutgoingCallCreated(e) => Some(&e.sid),
            Event::LocalMediaFail(e) => Some(&e.sid),
            Event::IncomingCallRequest(e) => Some(&e.sid),
            Event::CallAnswered(e) => Some(&e.sid),
            Event::SessionCreated(e) => Some(&e.sid),
            Event::CallDeclined(e) => Some(&e.sid),
            Event::CallAnswerTimeout(e) => Some(&e.sid),
            Event::MediaRecv(e) => Some(&e.sid),
            Event::CallEnded(e) => Some(&e.sid),
            Event::LocalVideoEnabled | Event::LocalVideoDisabled => None,
        }
    }
}
