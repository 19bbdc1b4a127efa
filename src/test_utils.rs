//! Mocks for the engine's collaborators, shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::calls::{
    EngineDeps, MediaEngine, MediaError, RtcEngine, SessionParams, SharedSecretCrypto,
    SignalingType, StanzaSender,
};
use crate::config::RtcConfig;
use crate::net::{HttpClient, HttpRequest, HttpResponse};
use crate::stanza::{Jid, Node};
use crate::types::events::{CallEnded, CoreEventBus, Event, EventHandler, IncomingCallRequest};
use crate::types::{AvFlags, SessionId, Termination};

pub const TEST_SECRET: &[u8] = b"jingle-calls test secret";

#[derive(Debug, Default)]
pub struct MockHttpClient {
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse::empty(200))
    }
}

#[derive(Debug, Default)]
pub struct FailingMockHttpClient {
    attempts: AtomicU32,
}

impl FailingMockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for FailingMockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("Not implemented"))
    }
}

/// Keeps every stanza the engine sends.
#[derive(Debug, Default)]
pub struct RecordingStanzaSender {
    sent: Mutex<Vec<Node>>,
    fail: AtomicBool,
}

impl RecordingStanzaSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Node> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of_type(&self, ty: SignalingType) -> Vec<Node> {
        self.sent()
            .into_iter()
            .filter(|n| n.attrs.get("type").and_then(|v| v.as_str()) == Some(ty.tag_name()))
            .collect()
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<Node> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl StanzaSender for RecordingStanzaSender {
    async fn send_node(&self, node: Node) -> Result<(), anyhow::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("socket closed"));
        }
        self.sent.lock().unwrap().push(node);
        Ok(())
    }
}

/// Media engine double. Capture succeeds with `available` tracks unless
/// `capture_error` is set; `hold_capture` makes opens wait for a release.
#[derive(Debug)]
pub struct MockMediaEngine {
    available: Mutex<AvFlags>,
    capture_error: Mutex<Option<MediaError>>,
    initiate_error: Mutex<Option<MediaError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    opened_with: Mutex<Vec<AvFlags>>,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
    attach_count: AtomicUsize,
    detach_count: AtomicUsize,
    initiated: Mutex<Vec<SessionParams>>,
    terminated: Mutex<Vec<(SessionId, Termination)>>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self {
            available: Mutex::new(AvFlags::AUDIO_VIDEO),
            capture_error: Mutex::new(None),
            initiate_error: Mutex::new(None),
            gate: Mutex::new(None),
            opened_with: Mutex::new(Vec::new()),
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            attach_count: AtomicUsize::new(0),
            detach_count: AtomicUsize::new(0),
            initiated: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, tracks: AvFlags) {
        *self.available.lock().unwrap() = tracks;
    }

    pub fn fail_capture(&self, error: MediaError) {
        *self.capture_error.lock().unwrap() = Some(error);
    }

    pub fn fail_initiate(&self, error: MediaError) {
        *self.initiate_error.lock().unwrap() = Some(error);
    }

    /// Block capture opens until the returned notify fires.
    pub fn hold_capture(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Device sets requested by each capture open, in order.
    pub fn opened_with(&self) -> Vec<AvFlags> {
        self.opened_with.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detach_count.load(Ordering::SeqCst)
    }

    pub fn initiated(&self) -> Vec<SessionParams> {
        self.initiated.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<(SessionId, Termination)> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn open_capture(&self, wanted: AvFlags) -> Result<AvFlags, MediaError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.opened_with.lock().unwrap().push(wanted);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.capture_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(wanted.intersect(*self.available.lock().unwrap()))
    }

    fn close_capture(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn attach_local_video(&self) {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
    }

    fn detach_local_video(&self) {
        self.detach_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn initiate_session(&self, params: SessionParams) -> Result<(), MediaError> {
        if let Some(err) = self.initiate_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.initiated.lock().unwrap().push(params);
        Ok(())
    }

    fn terminate_session(&self, sid: &SessionId, termination: Termination) {
        self.terminated
            .lock()
            .unwrap()
            .push((sid.clone(), termination));
    }
}

/// Keeps every dispatched event.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn ended(&self) -> Vec<CallEnded> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::CallEnded(ended) => Some(ended),
                _ => None,
            })
            .collect()
    }

    pub fn ended_for(&self, sid: &SessionId) -> Vec<CallEnded> {
        self.ended().into_iter().filter(|e| &e.sid == sid).collect()
    }

    pub fn incoming(&self) -> Vec<IncomingCallRequest> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::IncomingCallRequest(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl EventHandler for RecordingEventHandler {
    fn handle_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// One engine wired to mocks.
pub struct TestEngine {
    pub engine: RtcEngine,
    pub jid: Jid,
    pub sender: Arc<RecordingStanzaSender>,
    pub media: Arc<MockMediaEngine>,
    pub events: Arc<RecordingEventHandler>,
    pub http: Arc<MockHttpClient>,
    pub task: JoinHandle<()>,
}

impl TestEngine {
    pub fn spawn(jid: &str) -> Self {
        Self::spawn_with_config(jid, RtcConfig::default())
    }

    pub fn spawn_with_config(jid: &str, config: RtcConfig) -> Self {
        let jid: Jid = jid.parse().expect("test jid should parse");
        let sender = Arc::new(RecordingStanzaSender::new());
        let media = Arc::new(MockMediaEngine::new());
        let events = Arc::new(RecordingEventHandler::new());
        let http = Arc::new(MockHttpClient::new());
        let bus = CoreEventBus::new();
        bus.add_handler(events.clone());
        let crypto = SharedSecretCrypto::new(TEST_SECRET, &jid).expect("test crypto");

        let (engine, task) = RtcEngine::spawn(
            config,
            EngineDeps {
                own_jid: jid.clone(),
                sender: sender.clone(),
                media: media.clone(),
                crypto: Arc::new(crypto),
                events: bus,
                http: Some(http.clone()),
            },
        );
        Self {
            engine,
            jid,
            sender,
            media,
            events,
            http,
            task,
        }
    }

    /// Deliver everything this engine sent so far to `other`.
    pub async fn deliver_to(&self, other: &TestEngine) {
        for node in self.sender.take() {
            let _ = other.engine.handle_stanza(node).await;
        }
        settle().await;
    }
}

/// Let spawned tasks (capture opens, timers already due) run to completion.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
