use chrono::Local;
use clap::Parser;
use jingle_calls::calls::{
    EngineDeps, MediaEngine, MediaError, MediaQuery, RtcEngine, SessionParams,
    SharedSecretCrypto, StanzaSender,
};
use jingle_calls::config::RtcConfig;
use jingle_calls::net::HttpClient;
use jingle_calls::stanza::{Jid, Node};
use jingle_calls::stats::{StatsOptions, StatsSample};
use jingle_calls::types::events::{CoreEventBus, Event, EventHandler};
use jingle_calls::types::{AvFlags, CallType, SessionId, TermCode, Termination};
use jingle_ureq_http_client::UreqHttpClient;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Two call engines talking over an in-process stanza link.
//
// Usage:
//   cargo run                                   # alice calls bob, bob answers
//   cargo run -- --decline                      # bob declines as busy
//   cargo run -- -m a --talk-secs 1             # audio only, short call
//   cargo run -- --stats-url https://host/rtc   # upload call statistics

#[derive(Parser)]
#[command(name = "jingle-calls")]
#[command(about = "Loopback demo of the call signaling engine")]
struct Cli {
    #[arg(long, default_value = "alice@example.com/laptop")]
    caller: String,

    /// A bare address rings the callee's "phone" device.
    #[arg(long, default_value = "bob@example.com")]
    callee: String,

    /// Requested media: a, v, av or _
    #[arg(short, long, default_value = "av")]
    media: String,

    #[arg(long)]
    decline: bool,

    #[arg(long, default_value_t = 3)]
    talk_secs: u64,

    #[arg(long)]
    stats_url: Option<String>,

    #[arg(long, default_value = "jingle-calls demo secret")]
    secret: String,
}

/// Forwards outbound stanzas to the other engine's router.
struct LinkSender {
    tx: mpsc::UnboundedSender<Node>,
}

#[async_trait::async_trait]
impl StanzaSender for LinkSender {
    async fn send_node(&self, node: Node) -> Result<(), anyhow::Error> {
        self.tx
            .send(node)
            .map_err(|_| anyhow::anyhow!("stanza link closed"))
    }
}

/// Pretends to own a camera and microphone.
struct LoopbackMedia {
    name: &'static str,
}

#[async_trait::async_trait]
impl MediaEngine for LoopbackMedia {
    async fn open_capture(&self, wanted: AvFlags) -> Result<AvFlags, MediaError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        info!(target: "Demo/Media", "[{}] capture opened ({wanted})", self.name);
        Ok(wanted)
    }

    fn close_capture(&self) {
        info!(target: "Demo/Media", "[{}] capture closed", self.name);
    }

    fn attach_local_video(&self) {
        info!(target: "Demo/Media", "[{}] local video attached", self.name);
    }

    fn detach_local_video(&self) {
        info!(target: "Demo/Media", "[{}] local video detached", self.name);
    }

    async fn initiate_session(&self, params: SessionParams) -> Result<(), MediaError> {
        info!(
            target: "Demo/Media",
            "[{}] negotiating transport for {} with {}",
            self.name, params.sid, params.peer
        );
        Ok(())
    }

    fn terminate_session(&self, sid: &SessionId, termination: Termination) {
        info!(target: "Demo/Media", "[{}] session {sid} torn down ({termination})", self.name);
    }
}

struct Forwarder {
    name: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, Event)>,
}

impl EventHandler for Forwarder {
    fn handle_event(&self, event: &Event) {
        let _ = self.tx.send((self.name, event.clone()));
    }
}

fn spawn_engine(
    name: &'static str,
    jid: Jid,
    cli: &Cli,
    link: mpsc::UnboundedSender<Node>,
    events: mpsc::UnboundedSender<(&'static str, Event)>,
) -> Result<RtcEngine, anyhow::Error> {
    let bus = CoreEventBus::new();
    bus.add_handler(Arc::new(Forwarder { name, tx: events }));
    let crypto = SharedSecretCrypto::new(cli.secret.as_bytes(), &jid)?;
    let http: Arc<dyn HttpClient> = Arc::new(UreqHttpClient::new());

    let config = RtcConfig {
        stats_url: cli.stats_url.clone(),
        ..Default::default()
    };
    let (engine, _task) = RtcEngine::spawn(
        config,
        EngineDeps {
            own_jid: jid,
            sender: Arc::new(LinkSender { tx: link }),
            media: Arc::new(LoopbackMedia { name }),
            crypto: Arc::new(crypto),
            events: bus,
            http: Some(http),
        },
    );
    Ok(engine)
}

fn spawn_router(name: &'static str, engine: RtcEngine, mut rx: mpsc::UnboundedReceiver<Node>) {
    tokio::spawn(async move {
        while let Some(node) = rx.recv().await {
            info!(target: "Demo/Link", "--> {name}: {node}");
            if let Err(e) = engine.handle_stanza(node).await {
                warn!(target: "Demo/Link", "{name} rejected stanza: {e}");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let caller_jid: Jid = cli.caller.parse()?;
    let target: Jid = cli.callee.parse()?;
    let callee_jid = if target.is_bare() {
        target.clone().with_resource("phone")
    } else {
        target.clone()
    };
    let media = AvFlags::from_wire(&cli.media);

    let (to_callee, callee_rx) = mpsc::unbounded_channel();
    let (to_caller, caller_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let caller = spawn_engine("caller", caller_jid, &cli, to_callee, events_tx.clone())?;
    let callee = spawn_engine("callee", callee_jid, &cli, to_caller, events_tx)?;
    spawn_router("caller", caller.clone(), caller_rx);
    spawn_router("callee", callee.clone(), callee_rx);

    let call = caller
        .start_call(&target.to_string(), media, None, None)
        .await?;
    info!("Placed call {}", call.sid());

    let deadline = tokio::time::sleep(Duration::from_secs(60 + cli.talk_secs));
    tokio::pin!(deadline);
    loop {
        let (who, event) = tokio::select! {
            Some(next) = events.recv() => next,
            _ = &mut deadline => {
                error!("Demo did not finish in time");
                break;
            }
        };

        match event {
            Event::IncomingCallRequest(req) if who == "callee" => {
                info!("{who}: {} is calling ({})", req.caller, req.media);
                let answer = if cli.decline {
                    req.handle
                        .answer(false, AvFlags::NONE, Some("busy".to_string()), None)
                        .await
                } else {
                    req.handle.answer(true, req.media, None, None).await
                };
                if let Err(e) = answer {
                    error!("{who}: could not answer: {e}");
                }
            }
            Event::SessionCreated(created) if who == "caller" => {
                info!("{who}: session {} with {}", created.sid, created.peer);
                callee
                    .session_initiated(&created.sid, created.local_media)
                    .await?;
                for engine in [&caller, &callee] {
                    engine
                        .media_started(
                            &created.sid,
                            StatsOptions {
                                enable: true,
                                ..Default::default()
                            },
                        )
                        .await?;
                    engine
                        .record_stats_sample(
                            &created.sid,
                            StatsSample {
                                rtt_ms: 42,
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                let sent = caller.sent_media(MediaQuery::Sid(created.sid.clone())).await?;
                info!("{who}: sending {sent}");

                tokio::time::sleep(Duration::from_secs(cli.talk_secs)).await;
                let ended = caller
                    .hangup_by_peer(&target, CallType::Any, TermCode::UserHangup, None)
                    .await?;
                info!("{who}: hung up {ended} call(s)");
            }
            Event::CallEnded(ended) => {
                info!(
                    "{who}: {:?} {} ended: {} ({} stats)",
                    ended.kind,
                    ended.sid,
                    ended.termination,
                    if ended.stats.is_full() { "full" } else { "basic" }
                );
                if who == "caller" {
                    break;
                }
            }
            other => info!("{who}: {other:?}"),
        }
    }

    let remaining = callee.shutdown().await?;
    caller.shutdown().await?;
    info!("Callee had {remaining} call(s) left at shutdown");
    Ok(())
}
