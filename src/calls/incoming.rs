//! Callee side of call negotiation.

use async_trait::async_trait;
use jingle_core::stanza::Jid;
use jingle_core::types::events::CallAnswer;
use jingle_core::types::{AnswerError, AvFlags, SessionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};

use super::encryption::FprMacKey;
use super::engine::EngineCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    /// Application has not answered yet.
    Ringing,
    /// Accepted, local capture is being opened.
    AwaitingMedia,
    /// Answer sent, waiting for the caller to start the session.
    AwaitingSession,
}

/// Registry entry for one received invitation.
#[derive(Debug)]
pub struct IncomingCallEntry {
    pub sid: SessionId,
    pub caller: Jid,
    pub peer_media: AvFlags,
    pub files: Vec<String>,
    pub peer_key: FprMacKey,
    pub peer_anon_id: String,
    pub own_key: FprMacKey,
    /// Media we answer with, narrowed to what capture delivered.
    pub own_media: AvFlags,
    pub state: IncomingState,
    pub holds_media: Option<AvFlags>,
    valid: Arc<AtomicBool>,
}

impl IncomingCallEntry {
    pub fn new(
        sid: SessionId,
        caller: Jid,
        peer_media: AvFlags,
        files: Vec<String>,
        peer_key: FprMacKey,
        peer_anon_id: String,
        own_key: FprMacKey,
    ) -> Self {
        Self {
            sid,
            caller,
            peer_media,
            files,
            peer_key,
            peer_anon_id,
            own_key,
            own_media: AvFlags::NONE,
            state: IncomingState::Ringing,
            holds_media: None,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_data_call(&self) -> bool {
        !self.files.is_empty()
    }

    /// Flips the validity flag seen by the application's handle.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn handle(&self, commands: mpsc::Sender<EngineCommand>) -> IncomingCall {
        IncomingCall {
            sid: self.sid.clone(),
            caller: self.caller.clone(),
            peer_media: self.peer_media,
            files: self.files.clone(),
            valid: self.valid.clone(),
            commands,
        }
    }
}

/// The application's side of an incoming invitation.
pub struct IncomingCall {
    sid: SessionId,
    caller: Jid,
    peer_media: AvFlags,
    files: Vec<String>,
    valid: Arc<AtomicBool>,
    commands: mpsc::Sender<EngineCommand>,
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("sid", &self.sid)
            .field("caller", &self.caller)
            .field("peer_media", &self.peer_media)
            .field("files", &self.files.len())
            .field("valid", &self.is_still_valid())
            .finish()
    }
}

#[async_trait]
impl CallAnswer for IncomingCall {
    fn sid(&self) -> &SessionId {
        &self.sid
    }

    fn caller(&self) -> &Jid {
        &self.caller
    }

    fn peer_media(&self) -> AvFlags {
        self.peer_media
    }

    fn files(&self) -> &[String] {
        &self.files
    }

    fn is_still_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    async fn answer(
        &self,
        accept: bool,
        own_media: AvFlags,
        reason: Option<String>,
        text: Option<String>,
    ) -> Result<(), AnswerError> {
        if !self.is_still_valid() {
            return Err(AnswerError::AlreadyCanceled);
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Answer {
                sid: self.sid.clone(),
                accept,
                own_media,
                reason,
                text,
                resp: resp_tx,
            })
            .await
            .map_err(|_| AnswerError::EngineStopped)?;
        resp_rx.await.map_err(|_| AnswerError::EngineStopped)?
    }
}
