//! Final bookkeeping for every call that ends: statistics, media release,
//! the terminal event, and best-effort statistics upload.

use jingle_core::net::{HttpClient, HttpRequest};
use jingle_core::stats::{BasicStats, RtcStats};
use jingle_core::types::events::{CallEnded, CoreEventBus, Event};
use jingle_core::types::Termination;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::media::{MediaEngine, MediaStreamRefCounter};
use super::registry::CallEntry;

/// Posts finalized statistics to a collection endpoint with bounded retry.
#[derive(Clone)]
pub struct StatsSubmitter {
    http: Arc<dyn HttpClient>,
    url: String,
    max_attempts: u32,
    backoff: Duration,
}

impl StatsSubmitter {
    pub fn new(
        http: Arc<dyn HttpClient>,
        url: impl Into<String>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Fire and forget. Failures are only logged.
    pub fn submit(&self, stats: Arc<RtcStats>) {
        let body = match stats.to_json() {
            Ok(json) => json.into_bytes(),
            Err(e) => {
                error!(target: "Rtc/Stats", "Failed to serialize stats for {}: {e}", stats.sid());
                return;
            }
        };
        let submitter = self.clone();
        tokio::spawn(async move {
            submitter.post_with_retry(body).await;
        });
    }

    /// Returns true once the endpoint accepted the report.
    pub async fn post_with_retry(&self, body: Vec<u8>) -> bool {
        let request = HttpRequest::post(self.url.clone())
            .with_header("Content-Type", "application/json")
            .with_body(body);

        for attempt in 1..=self.max_attempts {
            match self.http.execute(request.clone()).await {
                Ok(resp) if resp.is_success() => {
                    debug!(target: "Rtc/Stats", "Stats submitted on attempt {attempt}");
                    return true;
                }
                Ok(resp) => {
                    warn!(
                        target: "Rtc/Stats",
                        "Stats endpoint answered {} (attempt {attempt}/{})",
                        resp.status_code, self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        target: "Rtc/Stats",
                        "Stats upload failed (attempt {attempt}/{}): {e}",
                        self.max_attempts
                    );
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        error!(target: "Rtc/Stats", "Giving up on stats upload after {} attempts", self.max_attempts);
        false
    }
}

/// Single place where a claimed registry entry is finished off.
pub struct TerminationCoordinator {
    events: CoreEventBus,
    media_engine: Arc<dyn MediaEngine>,
    submitter: Option<StatsSubmitter>,
}

impl TerminationCoordinator {
    pub fn new(
        events: CoreEventBus,
        media_engine: Arc<dyn MediaEngine>,
        submitter: Option<StatsSubmitter>,
    ) -> Self {
        Self {
            events,
            media_engine,
            submitter,
        }
    }

    /// Finalize an entry that was already claimed from the registry.
    ///
    /// The claim is what guarantees this runs once per session id; the
    /// coordinator itself never looks the entry up again.
    pub fn terminate(
        &self,
        media: &mut MediaStreamRefCounter,
        entry: CallEntry,
        termination: Termination,
        text: Option<String>,
    ) -> Arc<RtcStats> {
        let kind = entry.kind();
        let sid = entry.sid().clone();
        let peer = entry.peer().clone();
        let held = entry.holds_media();

        let stats = match entry {
            CallEntry::Session(mut session) => {
                self.media_engine.terminate_session(&session.sid, termination);
                match session.stats.take() {
                    Some(recorder) => RtcStats::Full(recorder.finalize(termination)),
                    None => RtcStats::Basic(BasicStats::new(
                        session.sid.clone(),
                        session.is_caller,
                        session.peer.clone(),
                        Some(session.peer_anon_id.clone()),
                        termination,
                    )),
                }
            }
            CallEntry::Incoming(incoming) => {
                incoming.invalidate();
                RtcStats::Basic(BasicStats::new(
                    incoming.sid.clone(),
                    false,
                    incoming.caller.clone(),
                    Some(incoming.peer_anon_id.clone()),
                    termination,
                ))
            }
            CallEntry::Request(mut request) => {
                request.cancel_timer();
                RtcStats::Basic(BasicStats::new(
                    request.sid.clone(),
                    true,
                    request.target.clone(),
                    None,
                    termination,
                ))
            }
        };

        if let Some(held) = held {
            media.release(held.video);
        }

        info!(
            target: "Rtc/Call",
            "{kind:?} {sid} with {peer} ended: {termination}{}",
            text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default()
        );

        let stats = Arc::new(stats);
        self.events.dispatch(&Event::CallEnded(CallEnded {
            sid,
            peer,
            kind,
            termination,
            text,
            stats: stats.clone(),
        }));

        if let Some(submitter) = &self.submitter {
            submitter.submit(stats.clone());
        }
        stats
    }
}
