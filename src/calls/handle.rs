//! Public entry point: a cloneable handle to a running call engine.

use jingle_core::net::HttpClient;
use jingle_core::stanza::{Jid, Node};
use jingle_core::stats::{StatsOptions, StatsSample};
use jingle_core::types::events::CoreEventBus;
use jingle_core::types::{AvFlags, CallType, SessionId, TermCode};
use log::warn;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::encryption::CallCrypto;
use super::engine::{ActorDeps, EngineActor, EngineCommand, HangupFilter, MediaQuery};
use super::error::CallError;
use super::media::{LocalMediaStatus, MediaEngine};
use super::termination::{StatsSubmitter, TerminationCoordinator};
use super::transport::StanzaSender;
use crate::config::RtcConfig;

/// Everything the engine talks to.
pub struct EngineDeps {
    /// Our full address on the XMPP server.
    pub own_jid: Jid,
    pub sender: Arc<dyn StanzaSender>,
    pub media: Arc<dyn MediaEngine>,
    pub crypto: Arc<dyn CallCrypto>,
    pub events: CoreEventBus,
    /// Needed only when statistics upload is configured.
    pub http: Option<Arc<dyn HttpClient>>,
}

#[derive(Clone)]
pub struct RtcEngine {
    commands: mpsc::Sender<EngineCommand>,
    own_jid: Jid,
}

impl std::fmt::Debug for RtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcEngine")
            .field("own_jid", &self.own_jid)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

/// An outgoing call as seen by the application that placed it.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    sid: SessionId,
    commands: mpsc::Sender<EngineCommand>,
}

impl OutgoingCall {
    pub fn sid(&self) -> &SessionId {
        &self.sid
    }

    /// Withdraw the call while it is still ringing. Returns false when it
    /// has already been answered, declined, timed out or canceled.
    pub async fn cancel(&self) -> bool {
        let (resp, rx) = oneshot::channel();
        let command = EngineCommand::CancelRequest {
            sid: self.sid.clone(),
            resp,
        };
        if self.commands.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl RtcEngine {
    /// Start the engine actor on the current runtime.
    pub fn spawn(config: RtcConfig, deps: EngineDeps) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));

        let submitter = match (&config.stats_url, deps.http) {
            (Some(url), Some(http)) => Some(StatsSubmitter::new(
                http,
                url.clone(),
                config.stats_max_attempts,
                config.stats_retry_backoff,
            )),
            (Some(_), None) => {
                warn!(target: "Rtc/Stats", "Statistics URL configured without an HTTP client, upload disabled");
                None
            }
            _ => None,
        };
        let coordinator =
            TerminationCoordinator::new(deps.events.clone(), deps.media.clone(), submitter);

        let own_jid = deps.own_jid.clone();
        let actor = EngineActor::new(
            config,
            ActorDeps {
                own_jid: deps.own_jid,
                sender: deps.sender,
                media: deps.media,
                crypto: deps.crypto,
                events: deps.events,
                coordinator,
            },
            rx,
            tx.downgrade(),
        );
        let task = tokio::spawn(actor.run());
        (
            Self {
                commands: tx,
                own_jid,
            },
            task,
        )
    }

    pub fn own_jid(&self) -> &Jid {
        &self.own_jid
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, CallError> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(build(resp))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Place a call. `files` makes it a data call, which never opens local
    /// media. `own_jid` overrides the address the invite is sent from.
    pub async fn start_call(
        &self,
        target: &str,
        media: AvFlags,
        files: Option<Vec<String>>,
        own_jid: Option<Jid>,
    ) -> Result<OutgoingCall, CallError> {
        if target.is_empty() {
            return Err(CallError::InvalidArgument("empty target".to_string()));
        }
        let target: Jid = target
            .parse()
            .map_err(|e| CallError::InvalidArgument(format!("bad target {target:?}: {e}")))?;

        let sid = self
            .request(|resp| EngineCommand::StartCall {
                target,
                media,
                files: files.unwrap_or_default(),
                own_jid,
                resp,
            })
            .await??;
        Ok(OutgoingCall {
            sid,
            commands: self.commands.clone(),
        })
    }

    /// Feed an inbound `<message>` or `<presence>` stanza to the engine.
    pub async fn handle_stanza(&self, node: Node) -> Result<(), CallError> {
        self.request(|resp| EngineCommand::Stanza { node, resp })
            .await?
    }

    pub async fn hangup_by_sid(
        &self,
        sid: &SessionId,
        call_type: CallType,
        term: TermCode,
        text: Option<String>,
    ) -> Result<usize, CallError> {
        self.hangup(HangupFilter::Sid(sid.clone()), call_type, term, text)
            .await
    }

    /// A bare `peer` ends calls with every device of that user.
    pub async fn hangup_by_peer(
        &self,
        peer: &Jid,
        call_type: CallType,
        term: TermCode,
        text: Option<String>,
    ) -> Result<usize, CallError> {
        self.hangup(HangupFilter::Peer(peer.clone()), call_type, term, text)
            .await
    }

    pub async fn hangup_all(
        &self,
        call_type: CallType,
        term: TermCode,
        text: Option<String>,
    ) -> Result<usize, CallError> {
        self.hangup(HangupFilter::All, call_type, term, text).await
    }

    async fn hangup(
        &self,
        filter: HangupFilter,
        call_type: CallType,
        term: TermCode,
        text: Option<String>,
    ) -> Result<usize, CallError> {
        self.request(|resp| EngineCommand::Hangup {
            filter,
            call_type,
            term,
            text,
            resp,
        })
        .await
    }

    pub async fn sent_media(&self, query: MediaQuery) -> Result<AvFlags, CallError> {
        self.request(|resp| EngineCommand::SentMedia { query, resp })
            .await?
    }

    pub async fn received_media(&self, query: MediaQuery) -> Result<AvFlags, CallError> {
        self.request(|resp| EngineCommand::ReceivedMedia { query, resp })
            .await?
    }

    /// The media engine reports that transport negotiation for an answered
    /// incoming call has begun.
    pub async fn session_initiated(
        &self,
        sid: &SessionId,
        remote_media: AvFlags,
    ) -> Result<(), CallError> {
        self.request(|resp| EngineCommand::SessionInitiated {
            sid: sid.clone(),
            remote_media,
            resp,
        })
        .await?
    }

    /// `None` once the remote stream has gone away.
    pub async fn remote_stream_changed(
        &self,
        sid: &SessionId,
        media: Option<AvFlags>,
    ) -> Result<(), CallError> {
        self.request(|resp| EngineCommand::RemoteStreamChanged {
            sid: sid.clone(),
            media,
            resp,
        })
        .await?
    }

    pub async fn media_started(
        &self,
        sid: &SessionId,
        options: StatsOptions,
    ) -> Result<(), CallError> {
        self.request(|resp| EngineCommand::MediaStarted {
            sid: sid.clone(),
            options,
            resp,
        })
        .await?
    }

    /// Returns whether the sample was kept.
    pub async fn record_stats_sample(
        &self,
        sid: &SessionId,
        sample: StatsSample,
    ) -> Result<bool, CallError> {
        self.request(|resp| EngineCommand::RecordStats {
            sid: sid.clone(),
            sample,
            resp,
        })
        .await?
    }

    pub async fn is_relay(&self, sid: &SessionId) -> Result<bool, CallError> {
        self.request(|resp| EngineCommand::IsRelay {
            sid: sid.clone(),
            resp,
        })
        .await?
    }

    /// MAC of our DTLS fingerprint, to be sent to the peer.
    pub async fn fingerprint_mac(
        &self,
        sid: &SessionId,
        fingerprint: &str,
    ) -> Result<String, CallError> {
        self.request(|resp| EngineCommand::FingerprintMac {
            sid: sid.clone(),
            fingerprint: fingerprint.to_string(),
            resp,
        })
        .await?
    }

    /// Checks the peer's fingerprint against the MAC it sent. A mismatch
    /// ends the session.
    pub async fn verify_peer_fingerprint(
        &self,
        sid: &SessionId,
        fingerprint: &str,
        mac: &str,
    ) -> Result<bool, CallError> {
        self.request(|resp| EngineCommand::VerifyFingerprint {
            sid: sid.clone(),
            fingerprint: fingerprint.to_string(),
            mac: mac.to_string(),
            resp,
        })
        .await?
    }

    /// The XMPP connection dropped. Every call ends without notifying peers.
    pub async fn connection_lost(&self) -> Result<usize, CallError> {
        self.request(|resp| EngineCommand::ConnectionLost { resp })
            .await
    }

    pub async fn local_media_status(&self) -> Result<LocalMediaStatus, CallError> {
        self.request(|resp| EngineCommand::LocalMediaStatus { resp })
            .await
    }

    /// End every call and stop the actor.
    pub async fn shutdown(&self) -> Result<usize, CallError> {
        self.request(|resp| EngineCommand::Shutdown { resp }).await
    }
}
