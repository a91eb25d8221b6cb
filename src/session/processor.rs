use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::session::op::{Op, OpKind, OpStatus, SeqNo};
use crate::session::op_queue::OpSubmitter;

/// The processing path that executes ops: it receives requests initiated by the meta server, and
///  it supplies the capability fields for the handshake.
///
/// Both calls are made from the session's driver loop, so they must return quickly. Actual work
///  should be offloaded, with the result going back through the [Responder].
#[cfg_attr(test, automock)]
pub trait OpProcessor: Send + Sync + 'static {
    /// key / value pairs describing this node's capacity, sent with every handshake
    fn node_capabilities(&self) -> Vec<(String, String)>;

    fn on_request(&self, op: Op, responder: Responder);
}

/// Sends the response to a server-initiated request. Failures to execute the request are
///  reported as an error status rather than by dropping the responder - the meta server waits
///  for a response either way.
#[derive(Debug)]
pub struct Responder {
    seq: SeqNo,
    kind: OpKind,
    submitter: OpSubmitter,
}
impl Responder {
    pub fn new(seq: SeqNo, kind: OpKind, submitter: OpSubmitter) -> Responder {
        Responder {
            seq,
            kind,
            submitter,
        }
    }

    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    pub fn respond(self, status: OpStatus, payload: impl Into<Bytes>) {
        self.submitter.submit_response(Op::response(self.seq, self.kind, status, payload));
    }

    pub fn respond_ok(self, payload: impl Into<Bytes>) {
        self.respond(OpStatus::ok(), payload)
    }

    pub fn respond_error(self, code: i32, message: impl Into<String>) {
        self.respond(OpStatus::error(code, message), Bytes::new())
    }
}
