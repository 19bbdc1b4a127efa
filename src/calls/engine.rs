//! The call engine actor.
//!
//! One task owns the registries and the media reference counter and handles
//! [`EngineCommand`]s strictly one at a time. Timers and capture
//! acquisition run in their own tasks and report back through the same
//! queue, so every state change happens on this single writer.

use chrono::Utc;
use jingle_core::stanza::{Jid, Node};
use jingle_core::stats::{StatsOptions, StatsRecorder, StatsSample};
use jingle_core::types::events::{
    CallAnswerTimeout, CallAnswered, CallDeclined, CoreEventBus, Event, IncomingCallRequest,
    LocalMediaFail, MediaRecv, OutgoingCallCreated, SessionCreated,
};
use jingle_core::types::{
    AnswerError, AvFlags, CallType, EntryKind, SessionId, TermCode, Termination,
};
use log::{debug, error, info, warn};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::encryption::{CallCrypto, FprMacKey};
use super::error::CallError;
use super::incoming::{IncomingCallEntry, IncomingState};
use super::media::{
    LocalMediaStatus, MediaEngine, MediaError, MediaStreamRefCounter, SessionParams,
};
use super::registry::{CallEntry, SessionRegistry};
use super::request::{CallRequest, RequestState, RequestTransition};
use super::session::Session;
use super::signaling::{CancelReason, SignalingType};
use super::stanza::{CallStanzaBuilder, ParsedCallStanza, parse_presence_unavailable};
use super::termination::TerminationCoordinator;
use super::transport::StanzaSender;
use crate::config::RtcConfig;

/// Which entries a hangup applies to.
#[derive(Debug, Clone)]
pub enum HangupFilter {
    Sid(SessionId),
    /// Bare address: every device of the user. Full address: that device.
    Peer(Jid),
    All,
}

/// Selects an established session for media queries.
#[derive(Debug, Clone)]
pub enum MediaQuery {
    Sid(SessionId),
    Peer(Jid),
}

pub enum EngineCommand {
    StartCall {
        target: Jid,
        media: AvFlags,
        files: Vec<String>,
        own_jid: Option<Jid>,
        resp: oneshot::Sender<Result<SessionId, CallError>>,
    },
    CancelRequest {
        sid: SessionId,
        resp: oneshot::Sender<bool>,
    },
    Answer {
        sid: SessionId,
        accept: bool,
        own_media: AvFlags,
        reason: Option<String>,
        text: Option<String>,
        resp: oneshot::Sender<Result<(), AnswerError>>,
    },
    Stanza {
        node: Node,
        resp: oneshot::Sender<Result<(), CallError>>,
    },
    CaptureDone {
        result: Result<AvFlags, MediaError>,
    },
    AnswerTimeout {
        sid: SessionId,
    },
    Hangup {
        filter: HangupFilter,
        call_type: CallType,
        term: TermCode,
        text: Option<String>,
        resp: oneshot::Sender<usize>,
    },
    SessionInitiated {
        sid: SessionId,
        remote_media: AvFlags,
        resp: oneshot::Sender<Result<(), CallError>>,
    },
    RemoteStreamChanged {
        sid: SessionId,
        media: Option<AvFlags>,
        resp: oneshot::Sender<Result<(), CallError>>,
    },
    MediaStarted {
        sid: SessionId,
        options: StatsOptions,
        resp: oneshot::Sender<Result<(), CallError>>,
    },
    RecordStats {
        sid: SessionId,
        sample: StatsSample,
        resp: oneshot::Sender<Result<bool, CallError>>,
    },
    IsRelay {
        sid: SessionId,
        resp: oneshot::Sender<Result<bool, CallError>>,
    },
    SentMedia {
        query: MediaQuery,
        resp: oneshot::Sender<Result<AvFlags, CallError>>,
    },
    ReceivedMedia {
        query: MediaQuery,
        resp: oneshot::Sender<Result<AvFlags, CallError>>,
    },
    FingerprintMac {
        sid: SessionId,
        fingerprint: String,
        resp: oneshot::Sender<Result<String, CallError>>,
    },
    VerifyFingerprint {
        sid: SessionId,
        fingerprint: String,
        mac: String,
        resp: oneshot::Sender<Result<bool, CallError>>,
    },
    ConnectionLost {
        resp: oneshot::Sender<usize>,
    },
    LocalMediaStatus {
        resp: oneshot::Sender<LocalMediaStatus>,
    },
    Shutdown {
        resp: oneshot::Sender<usize>,
    },
}

/// Who is waiting for local capture to open.
#[derive(Debug, Clone)]
enum MediaWaiter {
    Outgoing(SessionId),
    Incoming(SessionId),
}

/// Collaborators the actor is built from.
pub struct ActorDeps {
    pub own_jid: Jid,
    pub sender: Arc<dyn StanzaSender>,
    pub media: Arc<dyn MediaEngine>,
    pub crypto: Arc<dyn CallCrypto>,
    pub events: CoreEventBus,
    pub coordinator: TerminationCoordinator,
}

pub struct EngineActor {
    config: RtcConfig,
    own_jid: Jid,
    registry: SessionRegistry,
    media: MediaStreamRefCounter,
    /// Waiters of the single in-flight capture acquisition.
    pending_capture: Option<Vec<(MediaWaiter, AvFlags)>>,
    coordinator: TerminationCoordinator,
    sender: Arc<dyn StanzaSender>,
    media_engine: Arc<dyn MediaEngine>,
    crypto: Arc<dyn CallCrypto>,
    events: CoreEventBus,
    commands: mpsc::Receiver<EngineCommand>,
    /// Weak so the queue closes once every external handle is gone.
    self_tx: mpsc::WeakSender<EngineCommand>,
    stopped: bool,
}

impl EngineActor {
    pub fn new(
        config: RtcConfig,
        deps: ActorDeps,
        commands: mpsc::Receiver<EngineCommand>,
        self_tx: mpsc::WeakSender<EngineCommand>,
    ) -> Self {
        Self {
            config,
            own_jid: deps.own_jid,
            registry: SessionRegistry::new(),
            media: MediaStreamRefCounter::new(deps.media.clone(), deps.events.clone()),
            pending_capture: None,
            coordinator: deps.coordinator,
            sender: deps.sender,
            media_engine: deps.media,
            crypto: deps.crypto,
            events: deps.events,
            commands,
            self_tx,
            stopped: false,
        }
    }

    pub async fn run(mut self) {
        info!(target: "Rtc/Engine", "Call engine started for {}", self.own_jid);
        while let Some(command) = self.commands.recv().await {
            if self.handle_command(command).await.is_break() {
                break;
            }
        }
        if !self.stopped {
            let count = self.shutdown().await;
            debug!(target: "Rtc/Engine", "All handles dropped, hung up {count} call(s)");
        }
        info!(target: "Rtc/Engine", "Call engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) -> ControlFlow<()> {
        match command {
            EngineCommand::StartCall {
                target,
                media,
                files,
                own_jid,
                resp,
            } => {
                let result = self.start_call(target, media, files, own_jid).await;
                let _ = resp.send(result);
            }
            EngineCommand::CancelRequest { sid, resp } => {
                let _ = resp.send(self.cancel_request(&sid).await);
            }
            EngineCommand::Answer {
                sid,
                accept,
                own_media,
                reason,
                text,
                resp,
            } => {
                let result = self.answer(&sid, accept, own_media, reason, text).await;
                let _ = resp.send(result);
            }
            EngineCommand::Stanza { node, resp } => {
                let _ = resp.send(self.handle_stanza(node).await);
            }
            EngineCommand::CaptureDone { result } => self.capture_done(result).await,
            EngineCommand::AnswerTimeout { sid } => self.answer_timeout(&sid).await,
            EngineCommand::Hangup {
                filter,
                call_type,
                term,
                text,
                resp,
            } => {
                let count = self
                    .hangup(&filter, call_type, Termination::local(term), text, true)
                    .await;
                let _ = resp.send(count);
            }
            EngineCommand::SessionInitiated {
                sid,
                remote_media,
                resp,
            } => {
                let _ = resp.send(self.session_initiated(&sid, remote_media).await);
            }
            EngineCommand::RemoteStreamChanged { sid, media, resp } => {
                let result = self.session_mut(&sid).map(|s| s.remote_stream = media);
                let _ = resp.send(result);
            }
            EngineCommand::MediaStarted { sid, options, resp } => {
                let _ = resp.send(self.media_started(&sid, options));
            }
            EngineCommand::RecordStats { sid, sample, resp } => {
                let result = self.session_mut(&sid).and_then(|s| {
                    s.stats
                        .as_mut()
                        .map(|rec| rec.record(sample))
                        .ok_or_else(|| CallError::NoStats(sid.to_string()))
                });
                let _ = resp.send(result);
            }
            EngineCommand::IsRelay { sid, resp } => {
                let result = self.session(&sid).and_then(|s| {
                    s.stats
                        .as_ref()
                        .and_then(|rec| rec.is_relay())
                        .ok_or_else(|| CallError::NoStats(sid.to_string()))
                });
                let _ = resp.send(result);
            }
            EngineCommand::SentMedia { query, resp } => {
                let _ = resp.send(self.find_session(&query).and_then(Session::sent_media));
            }
            EngineCommand::ReceivedMedia { query, resp } => {
                let _ = resp.send(self.find_session(&query).and_then(Session::received_media));
            }
            EngineCommand::FingerprintMac {
                sid,
                fingerprint,
                resp,
            } => {
                let result = self
                    .session(&sid)
                    .map(|s| s.own_key.sign_fingerprint(&fingerprint));
                let _ = resp.send(result);
            }
            EngineCommand::VerifyFingerprint {
                sid,
                fingerprint,
                mac,
                resp,
            } => {
                let _ = resp.send(self.verify_fingerprint(&sid, &fingerprint, &mac).await);
            }
            EngineCommand::ConnectionLost { resp } => {
                warn!(target: "Rtc/Engine", "Connection lost, terminating all calls");
                let count = self
                    .hangup(
                        &HangupFilter::All,
                        CallType::Any,
                        Termination::local(TermCode::XmppDisconnError),
                        None,
                        false,
                    )
                    .await;
                let _ = resp.send(count);
            }
            EngineCommand::LocalMediaStatus { resp } => {
                let _ = resp.send(self.media.status());
            }
            EngineCommand::Shutdown { resp } => {
                let count = self.shutdown().await;
                let _ = resp.send(count);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ---- outgoing calls ----

    async fn start_call(
        &mut self,
        target: Jid,
        media: AvFlags,
        files: Vec<String>,
        own_jid: Option<Jid>,
    ) -> Result<SessionId, CallError> {
        let own_jid = own_jid.unwrap_or_else(|| self.own_jid.clone());
        if target == own_jid {
            return Err(CallError::InvalidArgument(
                "cannot call our own device".to_string(),
            ));
        }

        let mut sid = SessionId::generate();
        while self.registry.contains(&sid) {
            sid = SessionId::generate();
        }

        let is_data = !files.is_empty();
        let media = if is_data { AvFlags::NONE } else { media };
        let request = CallRequest::new(
            sid.clone(),
            target.clone(),
            own_jid,
            media,
            files,
            self.crypto.generate_fpr_mac_key(),
        );
        self.registry.insert_request(request)?;

        info!(target: "Rtc/Call", "Outgoing call {sid} to {target} (media: {media}, data: {is_data})");
        self.events
            .dispatch(&Event::OutgoingCallCreated(OutgoingCallCreated {
                sid: sid.clone(),
                peer: target,
                media,
                is_data_call: is_data,
            }));

        if media.any() {
            self.request_local_media(MediaWaiter::Outgoing(sid.clone()), media)
                .await;
        } else {
            self.send_invite(&sid, AvFlags::NONE, None).await;
        }
        Ok(sid)
    }

    async fn outgoing_media_ready(
        &mut self,
        sid: &SessionId,
        wanted: AvFlags,
        outcome: Result<AvFlags, MediaError>,
    ) {
        match self.registry.request(sid).map(|r| r.state) {
            Some(RequestState::NotYetLocalMedia) => {}
            _ => {
                debug!(target: "Rtc/Call", "Request {sid} is gone, dropping its capture result");
                return;
            }
        }

        match outcome {
            Ok(used) => {
                if used != wanted {
                    warn!(
                        target: "Rtc/Call",
                        "Could not obtain all requested tracks for {sid}: wanted {wanted}, got {used}"
                    );
                }
                self.media.acquire(used.video);
                self.send_invite(sid, used, Some(used)).await;
            }
            Err(e) => {
                let continued = self.config.continue_without_local_media;
                warn!(target: "Rtc/Call", "Local media for {sid} failed: {e} (continue: {continued})");
                self.events.dispatch(&Event::LocalMediaFail(LocalMediaFail {
                    sid: sid.clone(),
                    error: e.to_string(),
                    continued,
                }));
                if continued {
                    self.send_invite(sid, AvFlags::NONE, None).await;
                } else if let Some(mut request) = self.registry.claim_request(sid) {
                    self.transition(&mut request, RequestTransition::MediaFailed);
                    self.finish(
                        CallEntry::Request(request),
                        Termination::local(TermCode::NoMediaError),
                        Some(e.to_string()),
                    );
                }
            }
        }
    }

    /// Moves the request to `GotMediaWaitingPeer`, sends the invite and arms
    /// the answer timer. `holds` is the media reference taken for it.
    async fn send_invite(&mut self, sid: &SessionId, used: AvFlags, holds: Option<AvFlags>) {
        let Some(request) = self.registry.request_mut(sid) else {
            if let Some(held) = holds {
                self.media.release(held.video);
            }
            return;
        };
        request.media = used;
        request.holds_media = holds;
        if let Err(e) = request.apply_transition(RequestTransition::MediaAcquired) {
            error!(target: "Rtc/Call", "BUG: {e}");
            return;
        }
        let target = request.target.clone();
        let own_jid = request.own_jid.clone();
        let own_key = request.own_key.clone();
        let files = request.files.clone();
        let is_data = request.is_data_call();
        let bare = target.to_bare();

        if let Err(e) = self.crypto.preload_keys(&bare).await {
            warn!(target: "Rtc/Call", "Key preload for {bare} failed: {e}");
            self.terminate_entry(
                EntryKind::Request,
                sid,
                Termination::local(TermCode::ApiTimeout),
                Some(e.to_string()),
                false,
            )
            .await;
            return;
        }

        let sealed = match self.crypto.encrypt_key_for(&own_key, &bare) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(target: "Rtc/Call", "Could not encrypt key material for {bare}: {e}");
                self.terminate_entry(
                    EntryKind::Request,
                    sid,
                    Termination::local(TermCode::InternalError),
                    Some(e.to_string()),
                    false,
                )
                .await;
                return;
            }
        };

        let invite = CallStanzaBuilder::new(SignalingType::Invite, sid, target.clone())
            .from(own_jid.clone())
            .fpr_mac_key(sealed)
            .anon_id(self.crypto.scramble_jid(&own_jid))
            .media(used)
            .files(&files)
            .build();
        if let Err(e) = self.sender.send_node(invite).await {
            warn!(target: "Rtc/Call", "Failed to send invite {sid}: {e}");
            self.terminate_entry(
                EntryKind::Request,
                sid,
                Termination::local(TermCode::ProtoError),
                Some(e.to_string()),
                false,
            )
            .await;
            return;
        }
        info!(target: "Rtc/Call", "Invite {sid} sent to {target}");

        if !is_data {
            let timer = self.arm_answer_timer(sid);
            match self.registry.request_mut(sid) {
                Some(request) => request.timer = Some(timer),
                None => timer.abort(),
            }
        }
    }

    fn arm_answer_timer(&self, sid: &SessionId) -> AbortHandle {
        let tx = self.self_tx.clone();
        let sid = sid.clone();
        let timeout = self.config.answer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(EngineCommand::AnswerTimeout { sid }).await;
            }
        })
        .abort_handle()
    }

    async fn answer_timeout(&mut self, sid: &SessionId) {
        match self.registry.request(sid).map(|r| r.state) {
            Some(RequestState::GotMediaWaitingPeer) => {}
            _ => {
                debug!(target: "Rtc/Call", "Answer timer for {sid} fired after the race was decided");
                return;
            }
        }
        let Some(mut request) = self.registry.claim_request(sid) else {
            return;
        };
        self.transition(&mut request, RequestTransition::AnswerTimedOut);
        request.cancel_timer();
        info!(target: "Rtc/Call", "Call {sid} to {} was not answered in time", request.target);

        self.send_cancel(&request, CancelReason::AnswerTimeout).await;
        self.events
            .dispatch(&Event::CallAnswerTimeout(CallAnswerTimeout {
                sid: sid.clone(),
                peer: request.target.clone(),
            }));
        self.finish(
            CallEntry::Request(request),
            Termination::local(TermCode::AnswerTimeout),
            None,
        );
    }

    async fn cancel_request(&mut self, sid: &SessionId) -> bool {
        if self.registry.request(sid).is_none() {
            debug!(target: "Rtc/Call", "Cancel of {sid} came too late");
            return false;
        }
        self.terminate_entry(
            EntryKind::Request,
            sid,
            Termination::local(TermCode::CallReqCancel),
            None,
            true,
        )
        .await
    }

    /// Look up the request a peer stanza refers to, checking the sender is
    /// the invited user and the invite is still out.
    fn claim_answerable_request(&mut self, st: &ParsedCallStanza) -> Option<CallRequest> {
        let request = self.registry.request(&st.sid)?;
        if !st.from.matches(&request.target) {
            warn!(
                target: "Rtc/Call",
                "Ignoring {} for {} from {}, call was placed to {}",
                st.signaling_type, st.sid, st.from, request.target
            );
            return None;
        }
        if request.state != RequestState::GotMediaWaitingPeer {
            debug!(target: "Rtc/Call", "Ignoring {} for {} in state {:?}", st.signaling_type, st.sid, request.state);
            return None;
        }
        self.registry.claim_request(&st.sid)
    }

    async fn on_peer_answer(&mut self, st: ParsedCallStanza) {
        let Some(mut request) = self.claim_answerable_request(&st) else {
            debug!(target: "Rtc/Call", "Answer for unknown or finished call {}", st.sid);
            return;
        };
        self.transition(&mut request, RequestTransition::PeerAnswered);
        request.cancel_timer();

        let peer_key = self.peer_key(&st);
        let peer_anon_id = st.anon_id.clone().unwrap_or_default();
        if peer_anon_id.is_empty() {
            error!(target: "Rtc/Call", "Answer for {} from {} carries no anonymous id", st.sid, st.from);
            self.finish(
                CallEntry::Request(request),
                Termination::local(TermCode::ProtoError),
                Some("answer without anonymous id".to_string()),
            );
            return;
        }

        if request.is_broadcast() {
            self.send_call_handled(&request, &st.from, true).await;
        }

        let session = Session {
            sid: st.sid.clone(),
            peer: st.from.clone(),
            is_caller: true,
            local_media: request.media,
            remote_media: st.media,
            remote_stream: None,
            own_key: request.own_key.clone(),
            peer_key,
            peer_anon_id,
            holds_media: request.holds_media.take(),
            is_data_call: request.is_data_call(),
            stats: None,
            started_at: Utc::now(),
        };
        drop(request);

        info!(target: "Rtc/Call", "Call {} answered by {}", st.sid, st.from);
        if !self.insert_session(session) {
            return;
        }
        self.events.dispatch(&Event::CallAnswered(CallAnswered {
            sid: st.sid.clone(),
            peer: st.from.clone(),
            peer_media: st.media,
        }));
        self.start_media_session(&st.sid).await;
    }

    async fn on_peer_decline(&mut self, st: ParsedCallStanza) {
        let Some(mut request) = self.claim_answerable_request(&st) else {
            debug!(target: "Rtc/Call", "Decline for unknown or finished call {}", st.sid);
            return;
        };
        self.transition(&mut request, RequestTransition::PeerDeclined);
        request.cancel_timer();
        info!(
            target: "Rtc/Call",
            "Call {} declined by {} (reason: {})",
            st.sid, st.from, st.reason.as_deref().unwrap_or("none")
        );

        if request.is_broadcast() {
            self.send_call_handled(&request, &st.from, false).await;
        }
        self.events.dispatch(&Event::CallDeclined(CallDeclined {
            sid: st.sid.clone(),
            peer: st.from.clone(),
            reason: st.reason.clone(),
            text: st.text.clone(),
            is_data_call: request.is_data_call(),
        }));
        self.finish(
            CallEntry::Request(request),
            Termination::peer(TermCode::CallReqCancel),
            st.text,
        );
    }

    async fn send_cancel(&self, request: &CallRequest, reason: CancelReason) {
        let node =
            CallStanzaBuilder::new(SignalingType::Cancel, &request.sid, request.target.to_bare())
                .from(request.own_jid.clone())
                .reason(reason.as_str())
                .build();
        self.send_best_effort(node, "cancel").await;
    }

    async fn send_call_handled(&self, request: &CallRequest, by: &Jid, accepted: bool) {
        let node = CallStanzaBuilder::new(
            SignalingType::CallHandled,
            &request.sid,
            request.target.to_bare(),
        )
        .from(request.own_jid.clone())
        .handled_by(by.clone(), accepted)
        .build();
        self.send_best_effort(node, "call-handled").await;
    }

    // ---- incoming calls ----

    async fn on_invite(&mut self, st: ParsedCallStanza) {
        if st.from == self.own_jid {
            debug!(target: "Rtc/Call", "Ignoring our own invite {}", st.sid);
            return;
        }
        if self.registry.contains(&st.sid) {
            warn!(target: "Rtc/Call", "Duplicate invite {} from {}, ignoring", st.sid, st.from);
            return;
        }
        let Some(commands) = self.self_tx.upgrade() else {
            return;
        };

        let peer_key = self.peer_key(&st);
        let entry = IncomingCallEntry::new(
            st.sid.clone(),
            st.from.clone(),
            st.media,
            st.files.clone(),
            peer_key,
            st.anon_id.clone().unwrap_or_default(),
            self.crypto.generate_fpr_mac_key(),
        );
        let handle = Arc::new(entry.handle(commands));
        if let Err(e) = self.registry.insert_incoming(entry) {
            warn!(target: "Rtc/Call", "Could not register invite {}: {e}", st.sid);
            return;
        }

        info!(target: "Rtc/Call", "Incoming call {} from {} (media: {})", st.sid, st.from, st.media);
        self.events
            .dispatch(&Event::IncomingCallRequest(IncomingCallRequest {
                sid: st.sid,
                caller: st.from,
                media: st.media,
                files: st.files,
                handle,
            }));
    }

    async fn answer(
        &mut self,
        sid: &SessionId,
        accept: bool,
        own_media: AvFlags,
        reason: Option<String>,
        text: Option<String>,
    ) -> Result<(), AnswerError> {
        let Some(entry) = self.registry.incoming(sid) else {
            return Err(AnswerError::AlreadyCanceled);
        };
        if entry.state != IncomingState::Ringing {
            return Err(AnswerError::AlreadyCanceled);
        }
        let is_data = entry.is_data_call();
        let peer_media = entry.peer_media;

        if !accept {
            if let Some(entry) = self.registry.claim_incoming(sid) {
                let reason = reason.unwrap_or_else(|| "busy".to_string());
                info!(target: "Rtc/Call", "Rejecting call {sid} from {} ({reason})", entry.caller);
                self.send_decline(&entry, &reason, text.clone()).await;
                self.finish(
                    CallEntry::Incoming(entry),
                    Termination::local(TermCode::CallReqCancel),
                    text,
                );
            }
            return Ok(());
        }

        if !is_data && !own_media.any() && !peer_media.any() {
            return Err(AnswerError::InvalidArgument(
                "neither side offers any media".to_string(),
            ));
        }

        if is_data || !own_media.any() {
            self.send_answer(sid, AvFlags::NONE, None).await;
            return Ok(());
        }

        if let Some(entry) = self.registry.incoming_mut(sid) {
            entry.state = IncomingState::AwaitingMedia;
            entry.own_media = own_media;
        }
        self.request_local_media(MediaWaiter::Incoming(sid.clone()), own_media)
            .await;
        Ok(())
    }

    async fn incoming_media_ready(
        &mut self,
        sid: &SessionId,
        outcome: Result<AvFlags, MediaError>,
    ) {
        let peer_media = match self.registry.incoming(sid) {
            Some(entry) if entry.state == IncomingState::AwaitingMedia => entry.peer_media,
            _ => {
                debug!(target: "Rtc/Call", "Incoming call {sid} is gone, dropping its capture result");
                return;
            }
        };

        match outcome {
            Ok(used) => {
                self.media.acquire(used.video);
                self.send_answer(sid, used, Some(used)).await;
            }
            Err(e) => {
                let continued = self.config.continue_without_local_media && peer_media.any();
                warn!(target: "Rtc/Call", "Local media for {sid} failed: {e} (continue: {continued})");
                self.events.dispatch(&Event::LocalMediaFail(LocalMediaFail {
                    sid: sid.clone(),
                    error: e.to_string(),
                    continued,
                }));
                if continued {
                    self.send_answer(sid, AvFlags::NONE, None).await;
                } else if let Some(entry) = self.registry.claim_incoming(sid) {
                    self.send_decline(
                        &entry,
                        "error",
                        Some("could not access camera or microphone".to_string()),
                    )
                    .await;
                    self.finish(
                        CallEntry::Incoming(entry),
                        Termination::local(TermCode::NoMediaError),
                        Some(e.to_string()),
                    );
                }
            }
        }
    }

    async fn send_answer(&mut self, sid: &SessionId, used: AvFlags, holds: Option<AvFlags>) {
        let Some(entry) = self.registry.incoming_mut(sid) else {
            if let Some(held) = holds {
                self.media.release(held.video);
            }
            return;
        };
        entry.own_media = used;
        entry.holds_media = holds;
        let caller = entry.caller.clone();
        let own_key = entry.own_key.clone();

        let sealed = match self.crypto.encrypt_key_for(&own_key, &caller.to_bare()) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(target: "Rtc/Call", "Could not encrypt key material for {caller}: {e}");
                self.terminate_entry(
                    EntryKind::Incoming,
                    sid,
                    Termination::local(TermCode::InternalError),
                    Some(e.to_string()),
                    true,
                )
                .await;
                return;
            }
        };

        let answer = CallStanzaBuilder::new(SignalingType::Answer, sid, caller.clone())
            .from(self.own_jid.clone())
            .fpr_mac_key(sealed)
            .anon_id(self.crypto.scramble_jid(&self.own_jid))
            .media(used)
            .build();
        if let Err(e) = self.sender.send_node(answer).await {
            warn!(target: "Rtc/Call", "Failed to send answer for {sid}: {e}");
            self.terminate_entry(
                EntryKind::Incoming,
                sid,
                Termination::local(TermCode::ProtoError),
                Some(e.to_string()),
                false,
            )
            .await;
            return;
        }

        if let Some(entry) = self.registry.incoming_mut(sid) {
            entry.state = IncomingState::AwaitingSession;
        }
        info!(target: "Rtc/Call", "Answered call {sid} from {caller} (media: {used})");
    }

    async fn send_decline(&self, entry: &IncomingCallEntry, reason: &str, text: Option<String>) {
        let node = CallStanzaBuilder::new(SignalingType::Decline, &entry.sid, entry.caller.clone())
            .from(self.own_jid.clone())
            .reason(reason)
            .text(text)
            .build();
        self.send_best_effort(node, "decline").await;
    }

    async fn on_peer_cancel(&mut self, st: ParsedCallStanza) {
        let Some(entry) = self.registry.incoming(&st.sid) else {
            debug!(target: "Rtc/Call", "Cancel for unknown call {}", st.sid);
            return;
        };
        if !st.from.is_same_user_as(&entry.caller) {
            warn!(target: "Rtc/Call", "Ignoring cancel of {} from {}, not the caller", st.sid, st.from);
            return;
        }
        let code = match st.reason.as_deref().map(CancelReason::parse) {
            Some(CancelReason::AnswerTimeout) => TermCode::AnswerTimeout,
            _ => TermCode::CallReqCancel,
        };
        self.terminate_entry(
            EntryKind::Incoming,
            &st.sid,
            Termination::peer(code),
            None,
            false,
        )
        .await;
    }

    async fn on_call_handled(&mut self, st: ParsedCallStanza) {
        let (Some(by), Some(accepted)) = (st.handled_by.as_ref(), st.accepted) else {
            return;
        };
        if by == &self.own_jid {
            debug!(target: "Rtc/Call", "Call {} was handled by this device", st.sid);
            return;
        }
        let Some(entry) = self.registry.incoming(&st.sid) else {
            debug!(target: "Rtc/Call", "Call-handled notice for unknown call {}", st.sid);
            return;
        };
        if !st.from.is_same_user_as(&entry.caller) {
            warn!(target: "Rtc/Call", "Ignoring call-handled for {} from {}", st.sid, st.from);
            return;
        }
        let code = if accepted {
            TermCode::AnsweredElsewhere
        } else {
            TermCode::RejectedElsewhere
        };
        self.terminate_entry(
            EntryKind::Incoming,
            &st.sid,
            Termination::local(code),
            Some(format!("handled by {by}")),
            false,
        )
        .await;
    }

    async fn session_initiated(
        &mut self,
        sid: &SessionId,
        remote_media: AvFlags,
    ) -> Result<(), CallError> {
        match self.registry.incoming(sid).map(|e| e.state) {
            Some(IncomingState::AwaitingSession) => {}
            Some(state) => {
                return Err(CallError::InvalidArgument(format!(
                    "call {sid} is not answered yet ({state:?})"
                )));
            }
            None => return Err(CallError::NotFound(sid.to_string())),
        }
        let Some(entry) = self.registry.claim_incoming(sid) else {
            return Err(CallError::NotFound(sid.to_string()));
        };
        entry.invalidate();

        let session = Session {
            sid: entry.sid.clone(),
            peer: entry.caller.clone(),
            is_caller: false,
            local_media: entry.own_media,
            remote_media,
            remote_stream: None,
            own_key: entry.own_key.clone(),
            peer_key: entry.peer_key.clone(),
            peer_anon_id: entry.peer_anon_id.clone(),
            holds_media: entry.holds_media,
            is_data_call: entry.is_data_call(),
            stats: None,
            started_at: Utc::now(),
        };
        if self.insert_session(session) {
            self.start_media_session(sid).await;
        }
        Ok(())
    }

    // ---- sessions ----

    fn insert_session(&mut self, session: Session) -> bool {
        let sid = session.sid.clone();
        let held = session.holds_media;
        if let Err(e) = self.registry.insert_session(session) {
            error!(target: "Rtc/Call", "BUG: could not register session {sid}: {e}");
            if let Some(held) = held {
                self.media.release(held.video);
            }
            return false;
        }
        true
    }

    async fn start_media_session(&mut self, sid: &SessionId) {
        let Some(session) = self.registry.session(sid) else {
            return;
        };
        let params = SessionParams {
            sid: session.sid.clone(),
            peer: session.peer.clone(),
            is_caller: session.is_caller,
            local_media: session.local_media,
            peer_anon_id: session.peer_anon_id.clone(),
        };

        match self.media_engine.initiate_session(params).await {
            Ok(()) => {
                if let Some(session) = self.registry.session(sid) {
                    info!(target: "Rtc/Call", "Session {sid} with {} created", session.peer);
                    self.events.dispatch(&Event::SessionCreated(SessionCreated {
                        sid: sid.clone(),
                        peer: session.peer.clone(),
                        is_caller: session.is_caller,
                        local_media: session.local_media,
                        remote_media: session.remote_media,
                    }));
                }
            }
            Err(e) => {
                error!(target: "Rtc/Call", "Media engine could not start session {sid}: {e}");
                self.terminate_entry(
                    EntryKind::Session,
                    sid,
                    Termination::local(TermCode::InternalError),
                    Some(e.to_string()),
                    false,
                )
                .await;
            }
        }
    }

    fn media_started(&mut self, sid: &SessionId, options: StatsOptions) -> Result<(), CallError> {
        let session = self.session_mut(sid)?;
        if options.enable {
            session.stats = Some(StatsRecorder::start(
                session.sid.clone(),
                session.is_caller,
                session.peer_anon_id.clone(),
                options,
            ));
        }
        let event = Event::MediaRecv(MediaRecv {
            sid: sid.clone(),
            peer: session.peer.clone(),
            stats_enabled: options.enable,
        });
        self.events.dispatch(&event);
        Ok(())
    }

    async fn verify_fingerprint(
        &mut self,
        sid: &SessionId,
        fingerprint: &str,
        mac: &str,
    ) -> Result<bool, CallError> {
        let verified = self
            .session(sid)?
            .peer_key
            .verify_fingerprint(fingerprint, mac);
        if !verified {
            warn!(target: "Rtc/Call", "Fingerprint of session {sid} did not verify");
            self.terminate_entry(
                EntryKind::Session,
                sid,
                Termination::local(TermCode::FprVerifFail),
                Some("fingerprint verification failed".to_string()),
                false,
            )
            .await;
        }
        Ok(verified)
    }

    fn session(&self, sid: &SessionId) -> Result<&Session, CallError> {
        self.registry
            .session(sid)
            .ok_or_else(|| CallError::NotFound(sid.to_string()))
    }

    fn session_mut(&mut self, sid: &SessionId) -> Result<&mut Session, CallError> {
        self.registry
            .session_mut(sid)
            .ok_or_else(|| CallError::NotFound(sid.to_string()))
    }

    fn find_session(&self, query: &MediaQuery) -> Result<&Session, CallError> {
        match query {
            MediaQuery::Sid(sid) => self.session(sid),
            MediaQuery::Peer(peer) => self
                .registry
                .session_by_peer(peer)
                .ok_or_else(|| CallError::NotFound(peer.to_string())),
        }
    }

    async fn on_peer_unavailable(&mut self, peer: Jid) {
        for sid in self.registry.sessions_with_peer(&peer) {
            self.terminate_entry(
                EntryKind::Session,
                &sid,
                Termination::peer(TermCode::XmppDisconnError),
                Some("peer-disconnected".to_string()),
                false,
            )
            .await;
        }
    }

    // ---- local media acquisition ----

    /// Hands `waiter` a usable subset of the local capture, opening it first
    /// if needed. Only one open is in flight; later waiters queue behind it.
    ///
    /// The capture always asks for both devices, whatever the first waiter
    /// wanted, so a later video call still finds a camera track.
    async fn request_local_media(&mut self, waiter: MediaWaiter, wanted: AvFlags) {
        if let Some(tracks) = self.media.capture() {
            self.media_ready(waiter, wanted, Ok(tracks)).await;
            return;
        }
        if let Some(waiters) = self.pending_capture.as_mut() {
            waiters.push((waiter, wanted));
            return;
        }

        self.pending_capture = Some(vec![(waiter, wanted)]);
        let engine = self.media_engine.clone();
        let tx = self.self_tx.clone();
        debug!(target: "Rtc/Media", "Opening local capture for {wanted}");
        tokio::spawn(async move {
            let result = engine.open_capture(AvFlags::AUDIO_VIDEO).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(EngineCommand::CaptureDone { result }).await;
            }
        });
    }

    async fn capture_done(&mut self, result: Result<AvFlags, MediaError>) {
        let Some(waiters) = self.pending_capture.take() else {
            error!(target: "Rtc/Media", "BUG: capture completed with nobody waiting");
            if result.is_ok() {
                self.media_engine.close_capture();
            }
            return;
        };
        if let Ok(tracks) = &result {
            self.media.set_capture(*tracks);
        }
        for (waiter, wanted) in waiters {
            if result.is_ok() && self.media.capture().is_none() {
                // an earlier waiter's call already ended and closed it
                self.request_local_media(waiter, wanted).await;
                continue;
            }
            self.media_ready(waiter, wanted, result.clone()).await;
        }
        self.media.release_if_unused();
    }

    async fn media_ready(
        &mut self,
        waiter: MediaWaiter,
        wanted: AvFlags,
        result: Result<AvFlags, MediaError>,
    ) {
        let outcome = result.and_then(|tracks| {
            let used = wanted.intersect(tracks);
            if wanted.any() && !used.any() {
                Err(MediaError::NoDevice(format!(
                    "capture has no usable track (wanted {wanted}, have {tracks})"
                )))
            } else {
                Ok(used)
            }
        });
        match waiter {
            MediaWaiter::Outgoing(sid) => self.outgoing_media_ready(&sid, wanted, outcome).await,
            MediaWaiter::Incoming(sid) => self.incoming_media_ready(&sid, outcome).await,
        }
    }

    // ---- termination ----

    async fn hangup(
        &mut self,
        filter: &HangupFilter,
        call_type: CallType,
        termination: Termination,
        text: Option<String>,
        notify_peer: bool,
    ) -> usize {
        let targets = self.registry.enumerate_for_hangup(|c| {
            call_type.matches(c.is_data_call)
                && match filter {
                    HangupFilter::Sid(sid) => c.sid == sid,
                    HangupFilter::Peer(peer) => c.peer.matches(peer),
                    HangupFilter::All => true,
                }
        });

        let mut count = 0;
        for (kind, sid) in targets {
            if self
                .terminate_entry(kind, &sid, termination, text.clone(), notify_peer)
                .await
            {
                count += 1;
            }
        }
        count
    }

    /// Claim and finalize one entry. Returns false if another path already
    /// claimed it.
    async fn terminate_entry(
        &mut self,
        kind: EntryKind,
        sid: &SessionId,
        termination: Termination,
        text: Option<String>,
        notify_peer: bool,
    ) -> bool {
        let Some(mut entry) = self.registry.claim(kind, sid) else {
            return false;
        };

        if notify_peer {
            match &entry {
                CallEntry::Request(request)
                    if request.state == RequestState::GotMediaWaitingPeer =>
                {
                    let reason = if termination.code() == TermCode::AnswerTimeout {
                        CancelReason::AnswerTimeout
                    } else {
                        CancelReason::Caller
                    };
                    self.send_cancel(request, reason).await;
                }
                CallEntry::Incoming(incoming)
                    if matches!(
                        incoming.state,
                        IncomingState::Ringing | IncomingState::AwaitingMedia
                    ) =>
                {
                    self.send_decline(incoming, termination.code().reason_str(), text.clone())
                        .await;
                }
                _ => {}
            }
        }

        if let CallEntry::Request(request) = &mut entry {
            self.transition(request, RequestTransition::UserCanceled);
        }
        self.finish(entry, termination, text);
        true
    }

    fn finish(&mut self, entry: CallEntry, termination: Termination, text: Option<String>) {
        self.coordinator
            .terminate(&mut self.media, entry, termination, text);
    }

    fn transition(&self, request: &mut CallRequest, transition: RequestTransition) {
        if let Err(e) = request.apply_transition(transition) {
            debug!(target: "Rtc/Call", "Request {}: {e}", request.sid);
        }
    }

    async fn shutdown(&mut self) -> usize {
        self.stopped = true;
        let count = self
            .hangup(
                &HangupFilter::All,
                CallType::Any,
                Termination::local(TermCode::AppTerminating),
                None,
                true,
            )
            .await;
        if self.pending_capture.is_none() && self.media.capture().is_some() {
            error!(target: "Rtc/Media", "BUG: local capture still open after terminating every call");
        }
        count
    }

    // ---- stanza dispatch ----

    async fn handle_stanza(&mut self, node: Node) -> Result<(), CallError> {
        if let Some(peer) = parse_presence_unavailable(&node) {
            self.on_peer_unavailable(peer).await;
            return Ok(());
        }

        let st = ParsedCallStanza::parse(&node)?;
        debug!(target: "Rtc/Engine", "<-- {} {} from {}", st.signaling_type, st.sid, st.from);
        match st.signaling_type {
            SignalingType::Invite => self.on_invite(st).await,
            SignalingType::Answer => self.on_peer_answer(st).await,
            SignalingType::Decline => self.on_peer_decline(st).await,
            SignalingType::Cancel => self.on_peer_cancel(st).await,
            SignalingType::CallHandled => self.on_call_handled(st).await,
        }
        Ok(())
    }

    /// The peer's fingerprint-MAC key. A key we cannot decrypt is replaced
    /// by a fresh one and the call goes on; verification will then fail
    /// later instead of the call failing now.
    fn peer_key(&self, st: &ParsedCallStanza) -> FprMacKey {
        let Some(sealed) = st.fpr_mac_key.as_deref() else {
            warn!(target: "Rtc/Call", "{} {} has no key material, using a fresh key", st.signaling_type, st.sid);
            return self.crypto.generate_fpr_mac_key();
        };
        match self.crypto.decrypt_key_from(sealed, &st.from) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    target: "Rtc/Call",
                    "Could not decrypt key material of {} from {}: {e}, using a fresh key",
                    st.sid, st.from
                );
                self.crypto.generate_fpr_mac_key()
            }
        }
    }

    async fn send_best_effort(&self, node: Node, what: &str) {
        if let Err(e) = self.sender.send_node(node).await {
            warn!(target: "Rtc/Engine", "Failed to send {what}: {e}");
        }
    }
}
