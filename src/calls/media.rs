//! Local media: the external media engine seam and the reference counter
//! that shares one capture stream across every live call.

use async_trait::async_trait;
use jingle_core::stanza::Jid;
use jingle_core::types::events::{CoreEventBus, Event};
use jingle_core::types::{AvFlags, SessionId, Termination};
use log::{debug, error};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("no capture device: {0}")]
    NoDevice(String),
    #[error("capture device busy: {0}")]
    DeviceBusy(String),
    #[error("media engine failure: {0}")]
    Engine(String),
}

/// What the media engine needs to start transport negotiation for a call.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub sid: SessionId,
    pub peer: Jid,
    pub is_caller: bool,
    pub local_media: AvFlags,
    pub peer_anon_id: String,
}

/// Capture devices, renderers and the media transport. Implemented outside
/// this crate; the engine only calls it from its own task.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Open local capture. May return fewer tracks than asked for.
    async fn open_capture(&self, wanted: AvFlags) -> Result<AvFlags, MediaError>;
    fn close_capture(&self);
    fn attach_local_video(&self);
    fn detach_local_video(&self);
    async fn initiate_session(&self, params: SessionParams) -> Result<(), MediaError>;
    fn terminate_session(&self, sid: &SessionId, termination: Termination);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaStatus {
    pub total_refs: i64,
    pub video_refs: i64,
    /// Tracks of the open capture stream, if one is open.
    pub capture: Option<AvFlags>,
    pub video_attached: bool,
}

/// Counts holders of the local capture stream and, among them, holders
/// that send video.
///
/// Local video is attached iff `video > 0`; capture is open iff `total > 0`
/// (or an acquisition just completed and is being handed out).
pub struct MediaStreamRefCounter {
    engine: Arc<dyn MediaEngine>,
    events: CoreEventBus,
    capture: Option<AvFlags>,
    total: i64,
    video: i64,
    video_attached: bool,
}

impl MediaStreamRefCounter {
    pub fn new(engine: Arc<dyn MediaEngine>, events: CoreEventBus) -> Self {
        Self {
            engine,
            events,
            capture: None,
            total: 0,
            video: 0,
            video_attached: false,
        }
    }

    pub fn capture(&self) -> Option<AvFlags> {
        self.capture
    }

    /// Record a freshly opened capture stream. Callers acquire their
    /// references next and then call [`Self::release_if_unused`].
    pub fn set_capture(&mut self, tracks: AvFlags) {
        if self.capture.is_some() {
            error!(target: "Rtc/Media", "BUG: capture opened while one is already open");
        }
        self.capture = Some(tracks);
    }

    pub fn acquire(&mut self, wants_video: bool) {
        if self.capture.is_none() {
            error!(target: "Rtc/Media", "BUG: media reference taken without an open capture");
        }
        self.total += 1;
        if wants_video {
            self.video += 1;
        }
        debug!(target: "Rtc/Media", "acquire: total={} video={}", self.total, self.video);
        self.reconcile();
    }

    pub fn release(&mut self, wants_video: bool) {
        self.total -= 1;
        if wants_video {
            self.video -= 1;
        }
        debug!(target: "Rtc/Media", "release: total={} video={}", self.total, self.video);
        self.reconcile();
    }

    /// Close a capture nobody took a reference on.
    pub fn release_if_unused(&mut self) {
        self.reconcile();
    }

    pub fn status(&self) -> LocalMediaStatus {
        LocalMediaStatus {
            total_refs: self.total,
            video_refs: self.video,
            capture: self.capture,
            video_attached: self.video_attached,
        }
    }

    fn reconcile(&mut self) {
        if self.total < 0 {
            error!(target: "Rtc/Media", "BUG: local media refcount is negative ({}), clamping", self.total);
            self.total = 0;
        }
        if self.video < 0 {
            error!(target: "Rtc/Media", "BUG: local video refcount is negative ({}), clamping", self.video);
            self.video = 0;
        }
        if self.video > self.total {
            error!(
                target: "Rtc/Media",
                "BUG: local video refcount {} exceeds total {}, clamping",
                self.video, self.total
            );
            self.video = self.total;
        }

        if self.video > 0 && !self.video_attached {
            self.engine.attach_local_video();
            self.video_attached = true;
            self.events.dispatch(&Event::LocalVideoEnabled);
        } else if self.video == 0 && self.video_attached {
            self.engine.detach_local_video();
            self.video_attached = false;
            self.events.dispatch(&Event::LocalVideoDisabled);
        }

        if self.total == 0 && self.capture.take().is_some() {
            debug!(target: "Rtc/Media", "no more holders, closing local capture");
            self.engine.close_capture();
        }
    }
}
