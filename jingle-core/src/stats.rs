//! Per-call statistics: a recorder that lives on an established session
//! once media flows, and the finalized report emitted on termination.

use chrono::{DateTime, Utc};
use jingle_stanza::Jid;
use serde::Serialize;

use crate::types::{SessionId, Termination};

/// Sampling configuration handed over when remote media starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsOptions {
    pub enable: bool,
    /// Minimum spacing between stored samples.
    pub scan_period_ms: i64,
    /// A sample is stored at least this often even when nothing changed.
    pub max_sample_period_ms: i64,
}

impl StatsOptions {
    pub const DEFAULT_SCAN_PERIOD_MS: i64 = 1000;
    pub const DEFAULT_MAX_SAMPLE_PERIOD_MS: i64 = 5000;

    /// Negative periods select the defaults.
    pub fn normalized(mut self) -> Self {
        if self.scan_period_ms < 0 {
            self.scan_period_ms = Self::DEFAULT_SCAN_PERIOD_MS;
        }
        if self.max_sample_period_ms < 0 {
            self.max_sample_period_ms = Self::DEFAULT_MAX_SAMPLE_PERIOD_MS;
        }
        self
    }
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            enable: true,
            scan_period_ms: Self::DEFAULT_SCAN_PERIOD_MS,
            max_sample_period_ms: Self::DEFAULT_MAX_SAMPLE_PERIOD_MS,
        }
    }
}

/// One transport statistics snapshot reported by the media engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSample {
    /// Milliseconds since the recorder started.
    pub ts_ms: i64,
    pub rtt_ms: u32,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub is_relay: bool,
}

#[derive(Debug)]
pub struct StatsRecorder {
    sid: SessionId,
    is_caller: bool,
    peer_anon_id: String,
    options: StatsOptions,
    started_at: DateTime<Utc>,
    samples: Vec<StatsSample>,
}

impl StatsRecorder {
    pub fn start(
        sid: SessionId,
        is_caller: bool,
        peer_anon_id: String,
        options: StatsOptions,
    ) -> Self {
        Self {
            sid,
            is_caller,
            peer_anon_id,
            options: options.normalized(),
            started_at: Utc::now(),
            samples: Vec::new(),
        }
    }

    pub fn options(&self) -> &StatsOptions {
        &self.options
    }

    /// Stores the sample if it is due. Returns whether it was kept.
    pub fn record(&mut self, sample: StatsSample) -> bool {
        let keep = match self.samples.last() {
            None => true,
            Some(last) => {
                let elapsed = sample.ts_ms - last.ts_ms;
                let changed = last.rtt_ms != sample.rtt_ms || last.is_relay != sample.is_relay;
                elapsed >= self.options.max_sample_period_ms
                    || (changed && elapsed >= self.options.scan_period_ms)
            }
        };
        if keep {
            self.samples.push(sample);
        }
        keep
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Relay flag of the latest sample, if any.
    pub fn is_relay(&self) -> Option<bool> {
        self.samples.last().map(|s| s.is_relay)
    }

    pub fn finalize(self, termination: Termination) -> CallStats {
        let ended_at = Utc::now();
        CallStats {
            sid: self.sid,
            is_caller: self.is_caller,
            peer_anon_id: self.peer_anon_id,
            started_at: self.started_at,
            ended_at,
            duration_ms: (ended_at - self.started_at).num_milliseconds(),
            termination,
            term_reason: termination.to_string(),
            samples: self.samples,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub sid: SessionId,
    pub is_caller: bool,
    pub peer_anon_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub termination: Termination,
    pub term_reason: String,
    pub samples: Vec<StatsSample>,
}

/// Stats for calls that ended before any media statistics were gathered.
#[derive(Debug, Clone, Serialize)]
pub struct BasicStats {
    pub sid: SessionId,
    pub is_caller: bool,
    /// Kept locally, never uploaded.
    #[serde(skip)]
    pub peer: Jid,
    pub peer_anon_id: Option<String>,
    pub termination: Termination,
    pub term_reason: String,
    pub ts: DateTime<Utc>,
}

impl BasicStats {
    pub fn new(
        sid: SessionId,
        is_caller: bool,
        peer: Jid,
        peer_anon_id: Option<String>,
        termination: Termination,
    ) -> Self {
        Self {
            sid,
            is_caller,
            peer,
            peer_anon_id,
            termination,
            term_reason: termination.to_string(),
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RtcStats {
    Full(CallStats),
    Basic(BasicStats),
}

impl RtcStats {
    pub fn sid(&self) -> &SessionId {
        match self {
            RtcStats::Full(s) => &s.sid,
            RtcStats::Basic(s) => &s.sid,
        }
    }

    pub fn termination(&self) -> Termination {
        match self {
            RtcStats::Full(s) => s.termination,
            RtcStats::Basic(s) => s.termination,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, RtcStats::Full(_))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
