pub mod counters;
pub mod endpoint;
pub mod handshake;
pub mod meta_server_session;
pub mod op;
pub mod op_codec;
pub mod op_queue;
pub mod processor;
pub mod server_location;
pub mod session_config;
pub mod session_events;

use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::session::meta_server_session::MetaServerSession;

/// Drives a session until the surrounding task is dropped: ticks at the configured interval, and
///  handles incoming data as soon as it arrives.
#[tracing::instrument(name = "MetaServerSession", skip_all, fields(meta_server = %session.config().meta_server))]
pub async fn run_session(mut session: MetaServerSession) {
    //TODO graceful shutdown: flush pending responses before returning

    info!("starting meta server session");

    let mut ticks = interval(session.config().tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticks.tick() => {
                session.on_tick().await;
            }
            received = session.recv() => {
                session.on_received(received).await;
            }
        }
    }
}
