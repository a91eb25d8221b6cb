use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;

use crate::session::op::{Op, OpKind, OpReply, OpStatus, SeqNo};
use crate::util::buf::{BufExt, BufMutExt};

/// A complete message received from the meta server
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InboundMessage {
    /// a server-initiated request that is handed to the processing path
    Request(Op),
    /// the reply to a request that this chunk server sent
    Reply(OpReply),
}
impl InboundMessage {
    pub fn seq(&self) -> SeqNo {
        match self {
            InboundMessage::Request(op) => op.seq,
            InboundMessage::Reply(reply) => reply.seq,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum Decoded {
    /// the buffer does not (yet) hold a complete message
    Incomplete,
    Message(InboundMessage),
    /// the codec discarded bytes it could not make sense of
    Malformed(String),
}

/// Splits received bytes into messages and encodes outbound ops. The session is agnostic of the
///  actual wire encoding.
pub trait OpCodec: Send + Sync + 'static {
    /// Appends the encoded request to `buf`. On failure, e.g. because the op exceeds the maximum
    ///  message size, `buf` is left unchanged.
    fn encode_request(&self, op: &Op, buf: &mut BytesMut) -> anyhow::Result<()>;
    fn encode_response(&self, op: &Op, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Consumes at most one message from the start of `buf`. Bytes are removed from `buf` if and
    ///  only if the result is not [Decoded::Incomplete].
    fn try_decode(&self, buf: &mut BytesMut) -> Decoded;
}


const FRAME_TYPE_REQUEST: u8 = 1;
const FRAME_TYPE_REPLY: u8 = 2;

const FRAME_HEADER_LEN: usize = 8;

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Length-prefixed binary frames:
///
/// ```ascii
/// u32 body length
/// u32 CRC32 of the body
/// u8 frame type (request or reply)
/// i64 sequence number
/// string op kind
/// (replies only) i32 status code, string status message
/// bytes payload
/// ```
///
/// A frame with a bad checksum or body is discarded on its own. A length prefix exceeding the
///  maximum message size means that frame boundaries are lost, so the entire buffer is discarded.
pub struct FramedOpCodec {
    max_message_size: usize,
}
impl FramedOpCodec {
    pub fn new(max_message_size: usize) -> FramedOpCodec {
        FramedOpCodec {
            max_message_size: max_message_size.min(u32::MAX as usize),
        }
    }

    fn write_frame(&self, buf: &mut BytesMut, write_body: impl FnOnce(&mut BytesMut)) -> anyhow::Result<()> {
        let frame_start = buf.len();
        buf.put_u32(0);
        buf.put_u32(0);
        write_body(buf);

        let body_len = buf.len() - frame_start - FRAME_HEADER_LEN;
        if body_len > self.max_message_size {
            buf.truncate(frame_start);
            bail!("message of {} bytes exceeds the maximum message size of {}", body_len, self.max_message_size);
        }

        let checksum = FRAME_CRC.checksum(&buf[frame_start + FRAME_HEADER_LEN..]);
        buf[frame_start..frame_start + 4].copy_from_slice(&(body_len as u32).to_be_bytes());
        buf[frame_start + 4..frame_start + 8].copy_from_slice(&checksum.to_be_bytes());
        Ok(())
    }

    fn parse_body(mut body: &[u8]) -> anyhow::Result<InboundMessage> {
        let frame_type = body.checked_get_u8()?;
        let seq = SeqNo(body.checked_get_i64()?);
        let kind = OpKind::from_name(&body.checked_get_string()?);

        let result = match frame_type {
            FRAME_TYPE_REQUEST => {
                let payload = body.checked_get_bytes()?;
                InboundMessage::Request(Op::new(seq, kind, payload))
            }
            FRAME_TYPE_REPLY => {
                let code = body.checked_get_i32()?;
                let message = body.checked_get_string()?;
                let payload = body.checked_get_bytes()?;
                InboundMessage::Reply(OpReply {
                    seq,
                    kind,
                    status: OpStatus { code, message },
                    payload,
                })
            }
            other => bail!("invalid frame type {}", other),
        };

        if body.has_remaining() {
            bail!("{} unexpected trailing bytes in frame", body.remaining());
        }
        Ok(result)
    }
}

impl OpCodec for FramedOpCodec {
    fn encode_request(&self, op: &Op, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.write_frame(buf, |buf| {
            buf.put_u8(FRAME_TYPE_REQUEST);
            buf.put_i64(op.seq.0);
            buf.put_string(op.kind.name());
            buf.put_len_prefixed(&op.payload);
        })
    }

    fn encode_response(&self, op: &Op, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.write_frame(buf, |buf| {
            buf.put_u8(FRAME_TYPE_REPLY);
            buf.put_i64(op.seq.0);
            buf.put_string(op.kind.name());
            buf.put_i32(op.status.code);
            buf.put_string(&op.status.message);
            buf.put_len_prefixed(&op.payload);
        })
    }

    fn try_decode(&self, buf: &mut BytesMut) -> Decoded {
        if buf.len() < FRAME_HEADER_LEN {
            return Decoded::Incomplete;
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len > self.max_message_size {
            let num_discarded = buf.len();
            buf.clear();
            return Decoded::Malformed(format!("frame length {} exceeds the maximum message size of {} - discarding {} buffered bytes", body_len, self.max_message_size, num_discarded));
        }

        if buf.len() < FRAME_HEADER_LEN + body_len {
            return Decoded::Incomplete;
        }

        let mut frame = buf.split_to(FRAME_HEADER_LEN + body_len);
        frame.advance(4);
        let expected_checksum = frame.get_u32();
        let actual_checksum = FRAME_CRC.checksum(&frame);
        if expected_checksum != actual_checksum {
            return Decoded::Malformed(format!("checksum error in frame of length {}", body_len));
        }

        match Self::parse_body(&frame) {
            Ok(msg) => Decoded::Message(msg),
            Err(e) => Decoded::Malformed(format!("invalid frame: {}", e)),
        }
    }
}
