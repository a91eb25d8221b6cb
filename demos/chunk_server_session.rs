use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::time::interval;
use tracing::{info, warn, Level};

use metasession::session::meta_server_session::MetaServerSession;
use metasession::session::op::{Op, OpKind};
use metasession::session::processor::{OpProcessor, Responder};
use metasession::session::run_session;
use metasession::session::server_location::ServerLocation;
use metasession::session::session_config::SessionConfig;
use metasession::util::build_checksum::checksum_of_current_exe;

#[derive(Parser)]
struct Args {
    /// meta server location as host:port
    meta_server: String,

    #[clap(long, default_value_t = 22000)]
    port: u16,

    #[clap(long)]
    hostname: Option<String>,

    #[clap(long, default_value = "demo-cluster")]
    cluster_key: String,

    #[clap(long, default_value_t = -1)]
    rack_id: i32,

    /// property overrides as key=value, e.g. chunkServer.meta.inactivityTimeout=30
    #[clap(long)]
    property: Vec<String>,

    /// interval in seconds between demo requests to the meta server
    #[clap(long, default_value_t = 5)]
    request_interval: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// Answers every allocation request with success, and everything else with an error
struct DemoProcessor {}
impl OpProcessor for DemoProcessor {
    fn node_capabilities(&self) -> Vec<(String, String)> {
        vec![
            ("totalSpace".to_string(), (1u64 << 40).to_string()),
            ("usedSpace".to_string(), "0".to_string()),
            ("numChunks".to_string(), "0".to_string()),
        ]
    }

    fn on_request(&self, op: Op, responder: Responder) {
        info!("meta server request {:?} ({:?}, {} bytes)", op.seq, op.kind, op.payload.len());
        match op.kind {
            OpKind::AllocChunk => responder.respond_ok(Bytes::new()),
            _ => responder.respond_error(-95, "not supported by the demo"),
        }
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let meta_server: ServerLocation = args.meta_server.parse()?;
    let build_checksum = checksum_of_current_exe()?;

    let mut config = SessionConfig::new(meta_server, args.cluster_key, args.rack_id, build_checksum, args.port);
    config.chunk_server_hostname = args.hostname;

    let mut properties = FxHashMap::default();
    for p in &args.property {
        let (key, value) = p.split_once('=')
            .ok_or_else(|| anyhow::anyhow!("property {:?} is not of the form key=value", p))?;
        properties.insert(key.to_string(), value.to_string());
    }
    config.apply_properties(&properties)?;

    let (session, handle) = MetaServerSession::new_tcp(config, Arc::new(DemoProcessor {}))?;
    let mut events = handle.subscribe();

    let session_loop = tokio::spawn(run_session(session));

    let mut requests = interval(Duration::from_secs(args.request_interval.max(1)));
    loop {
        select! {
            evt = events.recv() => {
                match evt {
                    Ok(evt) => info!("session event: {:?}", evt),
                    Err(e) => warn!("session events lagging: {}", e),
                }
            }
            _ = requests.tick() => {
                let (seq, reply) = handle.submit_request(OpKind::Other("CORRUPT_CHUNK".to_string()), Bytes::from_static(b"demo"));
                tokio::spawn(async move {
                    match reply.await {
                        Ok(reply) => info!("reply for {:?}: {:?}", seq, reply.status),
                        Err(_) => warn!("session shut down before {:?} was answered", seq),
                    }
                });
                info!("up for {:?}, counters {:?}", handle.connection_uptime(), handle.counters());
            }
        }

        if session_loop.is_finished() {
            break;
        }
    }
    Ok(())
}
