use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;

/// Sequence numbers are assigned by the chunk server, increasing monotonically and never reused -
///  not even across reconnects. A reply carries the sequence number of the request it answers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SeqNo(pub i64);

impl Debug for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind discriminator of an op. The session treats kinds as opaque except for the handshake,
///  and it keeps separate counters for allocation requests.
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum OpKind {
    Hello,
    AllocChunk,
    Other(String),
}
impl OpKind {
    const HELLO: &'static str = "HELLO";
    const ALLOCATE: &'static str = "ALLOCATE";

    pub fn from_name(name: &str) -> OpKind {
        match name {
            Self::HELLO => OpKind::Hello,
            Self::ALLOCATE => OpKind::AllocChunk,
            other => OpKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OpKind::Hello => Self::HELLO,
            OpKind::AllocChunk => Self::ALLOCATE,
            OpKind::Other(name) => name,
        }
    }
}
impl Debug for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The outcome of executing an op: `code` 0 means success, anything else is an error code that
///  is transported verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpStatus {
    pub code: i32,
    pub message: String,
}
impl OpStatus {
    pub fn ok() -> OpStatus {
        OpStatus {
            code: 0,
            message: String::new(),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> OpStatus {
        OpStatus {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// An op envelope. The payload is kind specific and opaque to the session. `status` is the
///  result slot: it is filled in by whoever executes the op, and it is sent as part of a response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Op {
    pub seq: SeqNo,
    pub kind: OpKind,
    pub payload: Bytes,
    pub status: OpStatus,
}
impl Op {
    pub fn new(seq: SeqNo, kind: OpKind, payload: impl Into<Bytes>) -> Op {
        Op {
            seq,
            kind,
            payload: payload.into(),
            status: OpStatus::ok(),
        }
    }

    /// The response to a server-initiated request keeps the request's sequence number and kind
    pub fn response(request_seq: SeqNo, kind: OpKind, status: OpStatus, payload: impl Into<Bytes>) -> Op {
        Op {
            seq: request_seq,
            kind,
            payload: payload.into(),
            status,
        }
    }
}

/// A reply from the meta server to a request this chunk server sent
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpReply {
    pub seq: SeqNo,
    pub kind: OpKind,
    pub status: OpStatus,
    pub payload: Bytes,
}
