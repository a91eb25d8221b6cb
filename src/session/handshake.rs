use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use crate::session::op::{Op, OpKind, OpReply, OpStatus, SeqNo};
use crate::session::server_location::ServerLocation;
use crate::util::buf::{BufExt, BufMutExt};

/// The handshake a chunk server sends on every new connection. The meta server admits the chunk
///  server only if it agrees on the cluster key and recognizes the build checksum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HelloMessage {
    /// where clients can reach this chunk server
    pub location: ServerLocation,
    pub cluster_key: String,
    pub rack_id: i32,
    pub build_checksum: String,
    /// capacity and capability fields supplied by the processing path, opaque to the session
    pub capabilities: Vec<(String, String)>,
}
impl HelloMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.location.ser(buf);
        buf.put_string(&self.cluster_key);
        buf.put_i32(self.rack_id);
        buf.put_string(&self.build_checksum);
        buf.put_len(self.capabilities.len());
        for (key, value) in &self.capabilities {
            buf.put_string(key);
            buf.put_string(value);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HelloMessage> {
        let location = ServerLocation::try_deser(buf)?;
        let cluster_key = buf.checked_get_string()?;
        let rack_id = buf.checked_get_i32()?;
        let build_checksum = buf.checked_get_string()?;

        let num_capabilities = buf.checked_get_len()?;
        let mut capabilities = Vec::new();
        for _ in 0..num_capabilities {
            let key = buf.checked_get_string()?;
            let value = buf.checked_get_string()?;
            capabilities.push((key, value));
        }

        Ok(HelloMessage {
            location,
            cluster_key,
            rack_id,
            build_checksum,
            capabilities,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandshakeOutcome {
    Accepted,
    Rejected(OpStatus),
}

/// Tracks the (at most one) outstanding handshake. A handshake belongs to a connection, not to
///  the session: it is discarded when the connection is lost and never replayed.
#[derive(Debug, Default)]
pub struct HandshakeController {
    sent_hello: bool,
    outstanding: Option<SeqNo>,
}
impl HandshakeController {
    pub fn new() -> HandshakeController {
        Default::default()
    }

    /// Creates the hello op, which must go out ahead of all other traffic. Returns `None` if a
    ///  handshake is already outstanding.
    pub fn initiate(&mut self, seq: SeqNo, hello: &HelloMessage) -> Option<Op> {
        if let Some(outstanding) = self.outstanding {
            warn!("a handshake ({:?}) is already outstanding - not initiating another one", outstanding);
            return None;
        }

        let mut payload = BytesMut::new();
        hello.ser(&mut payload);

        self.outstanding = Some(seq);
        self.sent_hello = true;
        debug!("initiating handshake {:?}", seq);
        Some(Op::new(seq, OpKind::Hello, payload.freeze()))
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// true iff a hello was sent on the current connection, and it was answered
    pub fn is_complete(&self) -> bool {
        self.sent_hello && self.outstanding.is_none()
    }

    pub fn is_reply_to_handshake(&self, seq: SeqNo) -> bool {
        self.outstanding == Some(seq)
    }

    /// Resolves the outstanding handshake. The caller checks [Self::is_reply_to_handshake] first.
    pub fn on_reply(&mut self, reply: &OpReply) -> HandshakeOutcome {
        debug_assert!(self.is_reply_to_handshake(reply.seq));
        self.outstanding = None;

        if reply.status.is_ok() {
            HandshakeOutcome::Accepted
        }
        else {
            HandshakeOutcome::Rejected(reply.status.clone())
        }
    }

    pub fn discard(&mut self) {
        if let Some(seq) = self.outstanding.take() {
            debug!("discarding outstanding handshake {:?}", seq);
        }
        self.sent_hello = false;
    }
}
