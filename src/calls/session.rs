use chrono::{DateTime, Utc};
use jingle_core::stanza::Jid;
use jingle_core::stats::StatsRecorder;
use jingle_core::types::{AvFlags, SessionId};

use super::encryption::FprMacKey;
use super::error::CallError;

/// An established call.
#[derive(Debug)]
pub struct Session {
    pub sid: SessionId,
    /// Full address of the peer device.
    pub peer: Jid,
    pub is_caller: bool,
    /// What we actually send, after device availability.
    pub local_media: AvFlags,
    /// What the peer announced during negotiation.
    pub remote_media: AvFlags,
    /// Set once the remote stream is attached to a renderer.
    pub remote_stream: Option<AvFlags>,
    pub own_key: FprMacKey,
    pub peer_key: FprMacKey,
    pub peer_anon_id: String,
    pub holds_media: Option<AvFlags>,
    pub is_data_call: bool,
    pub stats: Option<StatsRecorder>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn sent_media(&self) -> Result<AvFlags, CallError> {
        self.holds_media
            .map(|_| self.local_media)
            .ok_or_else(|| CallError::NoStream(format!("no local stream in {}", self.sid)))
    }

    pub fn received_media(&self) -> Result<AvFlags, CallError> {
        self.remote_stream
            .ok_or_else(|| CallError::NoStream(format!("no remote stream in {}", self.sid)))
    }
}
