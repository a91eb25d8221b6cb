use std::time::Duration;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;

use crate::session::server_location::ServerLocation;

pub const PROP_INACTIVITY_TIMEOUT_SECS: &str = "chunkServer.meta.inactivityTimeout";
pub const PROP_MAX_READ_AHEAD: &str = "chunkServer.meta.maxReadAhead";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub meta_server: ServerLocation,

    /// 'shared secret' for the cluster. This guards against configuration mishaps: the meta server
    ///  only admits chunk servers that agree with it on the cluster key.
    pub cluster_key: String,
    /// used by the meta server for rack-aware placement of replicas
    pub rack_id: i32,
    /// digest of the running binary, see [crate::util::build_checksum]
    pub build_checksum: String,

    /// the port at which this chunk server listens for client connections
    pub chunk_server_port: u16,
    /// the host name that the meta server passes on to clients. If this is `None`, the local
    ///  address of the meta server connection is advertised.
    pub chunk_server_hostname: Option<String>,

    /// interval of the periodic driver that reconnects and dispatches queued ops
    pub tick_interval: Duration,
    /// minimum spacing between connection attempts. This is a fixed interval, there is no
    ///  exponential backoff.
    pub retry_interval: Duration,
    /// a connection is dropped if the meta server does not reply to the handshake or stays
    ///  silent for this long
    pub inactivity_timeout: Duration,
    /// maximum number of bytes read from the connection in a single receive
    pub max_read_ahead: usize,
    pub max_message_size: usize,

    /// first sequence number to use. This is randomized if it is not set, making it unlikely
    ///  that a restarted chunk server's sequence numbers collide with those of its previous
    ///  incarnation.
    pub initial_seq: Option<i64>,
}

impl SessionConfig {
    pub fn new(meta_server: ServerLocation, cluster_key: impl Into<String>, rack_id: i32, build_checksum: impl Into<String>, chunk_server_port: u16) -> SessionConfig {
        SessionConfig {
            meta_server,
            cluster_key: cluster_key.into(),
            rack_id,
            build_checksum: build_checksum.into(),
            chunk_server_port,
            chunk_server_hostname: None,
            tick_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            inactivity_timeout: Duration::from_secs(65),
            max_read_ahead: 4 * 1024,
            max_message_size: 16 * 1024 * 1024,
            initial_seq: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.meta_server.is_valid() {
            bail!("invalid meta server location {:?}", self.meta_server);
        }
        if self.chunk_server_port == 0 {
            bail!("chunk server port must be configured");
        }
        if let Some(hostname) = &self.chunk_server_hostname {
            if hostname.is_empty() {
                bail!("chunk server host name must not be empty if it is configured");
            }
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.inactivity_timeout < self.tick_interval {
            bail!("inactivity timeout {:?} is shorter than the tick interval {:?}", self.inactivity_timeout, self.tick_interval);
        }
        if self.max_read_ahead == 0 {
            bail!("max read-ahead must be positive");
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            bail!("max message size must be between 1 and {}", u32::MAX);
        }
        if let Some(seq) = self.initial_seq {
            if seq < 0 {
                bail!("initial sequence number must not be negative");
            }
        }
        Ok(())
    }

    /// Applies the tunables that can be overridden by property, leaving everything else
    ///  untouched.
    pub fn apply_properties(&mut self, properties: &FxHashMap<String, String>) -> anyhow::Result<()> {
        if let Some(value) = properties.get(PROP_INACTIVITY_TIMEOUT_SECS) {
            let secs = value.trim().parse::<u64>()
                .map_err(|e| anyhow!("invalid value {:?} for {}: {}", value, PROP_INACTIVITY_TIMEOUT_SECS, e))?;
            self.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = properties.get(PROP_MAX_READ_AHEAD) {
            self.max_read_ahead = value.trim().parse::<usize>()
                .map_err(|e| anyhow!("invalid value {:?} for {}: {}", value, PROP_MAX_READ_AHEAD, e))?;
        }
        Ok(())
    }
}
