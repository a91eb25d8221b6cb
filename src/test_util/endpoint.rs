use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::session::endpoint::{Connector, Endpoint};
use crate::session::op::{Op, OpKind, OpStatus, SeqNo};
use crate::session::op_codec::{Decoded, FramedOpCodec, InboundMessage, OpCodec};
use crate::session::server_location::ServerLocation;

/// A [Connector] that opens in-memory connections, keeping the far end of each connection so
///  that tests can play the meta server's part. It uses [FramedOpCodec] for encoding and
///  decoding, so sessions under test must use that codec as well.
pub struct TrackingConnector {
    refuse_connections: AtomicBool,
    fail_sends: AtomicBool,
    num_attempts: AtomicUsize,
    connections: Mutex<Vec<TestConnection>>,
}
impl TrackingConnector {
    pub fn new() -> Arc<TrackingConnector> {
        Arc::new(TrackingConnector {
            refuse_connections: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            num_attempts: AtomicUsize::new(0),
            connections: Default::default(),
        })
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Connections opened from now on start out with failing sends, see [TestConnection::set_fail_sends]
    pub fn set_fail_sends_on_new_connections(&self, fail_sends: bool) {
        self.fail_sends.store(fail_sends, Ordering::SeqCst);
    }

    pub fn num_attempts(&self) -> usize {
        self.num_attempts.load(Ordering::SeqCst)
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn last_connection(&self) -> TestConnection {
        self.connections.lock().unwrap()
            .last()
            .cloned()
            .expect("no connection was opened")
    }
}

#[async_trait]
impl Connector for TrackingConnector {
    async fn connect(&self, location: &ServerLocation) -> anyhow::Result<Box<dyn Endpoint>> {
        self.num_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(anyhow!("connection to {} refused", location));
        }

        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedConnection {
            is_open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(self.fail_sends.load(Ordering::SeqCst)),
            sent: Default::default(),
        });

        self.connections.lock().unwrap().push(TestConnection {
            shared: shared.clone(),
            inbound: inbound_sender,
        });

        Ok(Box::new(TestEndpoint {
            shared,
            inbound: inbound_receiver,
            pending: BytesMut::new(),
        }))
    }
}

struct SharedConnection {
    is_open: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<BytesMut>,
}

/// The meta server's end of an in-memory connection
#[derive(Clone)]
pub struct TestConnection {
    shared: Arc<SharedConnection>,
    inbound: mpsc::UnboundedSender<Bytes>,
}
impl TestConnection {
    fn codec() -> FramedOpCodec {
        FramedOpCodec::new(16 * 1024 * 1024)
    }

    /// NB: The connection still reports itself as good while sends fail, so it is the failed send
    ///  itself that the session must react to
    pub fn set_fail_sends(&self, fail_sends: bool) {
        self.shared.fail_sends.store(fail_sends, Ordering::SeqCst);
    }

    /// Breaks the connection: all further sends and receives on the session's side fail
    pub fn close(&self) {
        self.shared.is_open.store(false, Ordering::SeqCst);
    }

    pub fn push_raw(&self, data: impl Into<Bytes>) {
        let _ = self.inbound.send(data.into());
    }

    pub fn push_request(&self, op: &Op) {
        let mut buf = BytesMut::new();
        Self::codec().encode_request(op, &mut buf).unwrap();
        self.push_raw(buf.freeze());
    }

    pub fn push_reply(&self, seq: SeqNo, kind: OpKind, status: OpStatus) {
        let mut buf = BytesMut::new();
        Self::codec().encode_response(&Op::response(seq, kind, status, Bytes::new()), &mut buf).unwrap();
        self.push_raw(buf.freeze());
    }

    /// Decodes and removes everything the session sent so far. Requests are returned as
    ///  [InboundMessage::Request], responses as [InboundMessage::Reply].
    pub fn take_sent(&self) -> Vec<InboundMessage> {
        let mut sent = std::mem::take(&mut *self.shared.sent.lock().unwrap());

        let mut result = Vec::new();
        loop {
            match Self::codec().try_decode(&mut sent) {
                Decoded::Message(msg) => result.push(msg),
                Decoded::Incomplete => break,
                Decoded::Malformed(reason) => panic!("session sent malformed data: {}", reason),
            }
        }
        assert!(sent.is_empty(), "session sent an incomplete frame");
        result
    }

    pub fn take_sent_requests(&self) -> Vec<Op> {
        self.take_sent().into_iter()
            .map(|msg| match msg {
                InboundMessage::Request(op) => op,
                InboundMessage::Reply(reply) => panic!("expected a request, was {:?}", reply),
            })
            .collect()
    }
}

struct TestEndpoint {
    shared: Arc<SharedConnection>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
}
impl TestEndpoint {
    fn check_open(&self) -> anyhow::Result<()> {
        if self.shared.is_open.load(Ordering::SeqCst) {
            Ok(())
        }
        else {
            Err(anyhow!("connection reset"))
        }
    }
}

#[async_trait]
impl Endpoint for TestEndpoint {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.check_open()?;
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("broken pipe"));
        }
        self.shared.sent.lock().unwrap()
            .extend_from_slice(buf);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut BytesMut, max_read_ahead: usize) -> anyhow::Result<usize> {
        self.check_open()?;
        if self.pending.is_empty() {
            match self.inbound.recv().await {
                Some(data) => self.pending.extend_from_slice(&data),
                None => return Ok(0),
            }
            self.check_open()?;
        }

        let n = self.pending.len().min(max_read_ahead);
        buf.extend_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    fn is_good(&self) -> bool {
        self.shared.is_open.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000).into())
    }
}
