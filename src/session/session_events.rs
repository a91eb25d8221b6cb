use tokio::sync::broadcast;
use tracing::trace;

use crate::session::op::OpStatus;

/// The session's connection state. There is no terminal state: a session keeps reconnecting for
///  the lifetime of the process, and any state can fall back to [SessionState::Disconnected].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    /// transient: the connection is open, the handshake is not sent yet
    Connecting,
    /// the handshake is sent, no other requests go out until the meta server accepts it
    HandshakePending,
    Up,
}
impl SessionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    StateChanged(StateChangedData),
    /// the meta server rejected the handshake, typically because of a cluster key or build
    ///  checksum mismatch. This needs operator attention.
    HandshakeRejected(OpStatus),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateChangedData {
    pub old_state: SessionState,
    pub new_state: SessionState,
}


pub struct SessionEventNotifier {
    sender: broadcast::Sender<SessionEvent>,
}
impl SessionEventNotifier {
    pub fn new() -> SessionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        SessionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SessionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
