//! Utilities for testing code based on the meta server session: an in-memory connection whose far
//!  end plays the meta server, and a processor that records what it receives. They are used for
//!  the session's own tests, and they are exported for testing the surrounding chunk server.

use std::time::Duration;

use crate::session::server_location::ServerLocation;
use crate::session::session_config::SessionConfig;

pub mod endpoint;
pub mod processor;

/// A config with fixed identity, a fixed initial sequence number and short intervals
pub fn test_session_config(initial_seq: i64) -> SessionConfig {
    let mut config = SessionConfig::new(ServerLocation::new("meta", 20000), "K1", 3, "abc123", 22000);
    config.chunk_server_hostname = Some("chunk1".to_string());
    config.tick_interval = Duration::from_millis(100);
    config.retry_interval = Duration::from_secs(1);
    config.inactivity_timeout = Duration::from_secs(10);
    config.initial_seq = Some(initial_seq);
    config
}
