use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::session::counters::{Counters, SessionCounters};
use crate::session::endpoint::{Connector, Endpoint, TcpConnector};
use crate::session::handshake::{HandshakeController, HandshakeOutcome, HelloMessage};
use crate::session::op::{Op, OpKind, OpReply, SeqNo};
use crate::session::op_codec::{Decoded, FramedOpCodec, InboundMessage, OpCodec};
use crate::session::op_queue::{OpDispatchQueue, OpSubmitter};
use crate::session::processor::{OpProcessor, Responder};
use crate::session::server_location::ServerLocation;
use crate::session::session_config::SessionConfig;
use crate::session::session_events::{SessionEvent, SessionEventNotifier, SessionState, StateChangedData};

/// What the rest of the process can see of the session
#[derive(Copy, Clone, Debug)]
struct SessionStatus {
    state: SessionState,
    handshake_done: bool,
    connected_at: Option<Instant>,
    last_recv_cmd_at: Option<Instant>,
}

struct SharedSessionState {
    location: ServerLocation,
    status: RwLock<SessionStatus>,
    counters: SessionCounters,
    events: SessionEventNotifier,
}
impl SharedSessionState {
    fn status(&self) -> SessionStatus {
        *self.status.read()
            .unwrap_or_else(|e| e.into_inner())
    }
}


/// The session's interface for the rest of the chunk server process: status queries and
///  submission of outbound requests and responses. It is cheap to clone, and it can be used from
///  any thread.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SharedSessionState>,
    submitter: OpSubmitter,
}
impl Debug for SessionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHandle{{meta_server:{:?}}}", self.shared.location)
    }
}

impl SessionHandle {
    pub fn location(&self) -> &ServerLocation {
        &self.shared.location
    }

    /// Returns the next unused sequence number. Every call returns a different, bigger number.
    pub fn next_seq(&self) -> SeqNo {
        self.submitter.next_seq()
    }

    /// Queues a request under the next unused sequence number, returning that number and the
    ///  receiver for the meta server's reply
    pub fn submit_request(&self, kind: OpKind, payload: impl Into<Bytes>) -> (SeqNo, oneshot::Receiver<OpReply>) {
        self.submitter.submit_request(kind, payload)
    }

    /// Queues the response to a server-initiated request
    pub fn submit_response(&self, op: Op) {
        self.submitter.submit_response(op)
    }

    pub fn state(&self) -> SessionState {
        self.shared.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_handshake_done(&self) -> bool {
        self.shared.status().handshake_done
    }

    pub fn is_up(&self) -> bool {
        let status = self.shared.status();
        status.state.is_connected() && status.handshake_done
    }

    /// when the most recent message from the meta server was received, on any connection
    pub fn last_recv_cmd_time(&self) -> Option<Instant> {
        self.shared.status().last_recv_cmd_at
    }

    /// time since the current connection was established, or zero if the session is not up
    pub fn connection_uptime(&self) -> Duration {
        let status = self.shared.status();
        match status.connected_at {
            Some(connected_at) if status.state == SessionState::Up => connected_at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn counters(&self) -> Counters {
        self.shared.counters.snapshot()
    }

    pub fn counters_and_clear(&self) -> Counters {
        self.shared.counters.snapshot_and_clear()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }
}


/// The chunk server's session with the meta server: it keeps a single connection open, performs
///  the handshake on each new connection, and exchanges ops once the meta server accepted the
///  handshake.
///
/// The session is driven by [crate::session::run_session], which calls [Self::on_tick]
///  periodically and [Self::on_received] whenever data arrives.
pub struct MetaServerSession {
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn OpCodec>,
    processor: Arc<dyn OpProcessor>,

    shared: Arc<SharedSessionState>,
    submitter: OpSubmitter,
    queue: OpDispatchQueue,
    handshake: HandshakeController,

    endpoint: Option<Box<dyn Endpoint>>,
    recv_buf: BytesMut,

    state: SessionState,
    last_connect_attempt: Option<Instant>,
    connected_at: Option<Instant>,
    last_recv_at: Option<Instant>,
}

impl MetaServerSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn OpCodec>,
        processor: Arc<dyn OpProcessor>,
    ) -> anyhow::Result<(MetaServerSession, SessionHandle)> {
        config.validate()?;

        let initial_seq = config.initial_seq
            .unwrap_or_else(|| i64::from(rand::random::<u32>() >> 1));

        let shared = Arc::new(SharedSessionState {
            location: config.meta_server.clone(),
            status: RwLock::new(SessionStatus {
                state: SessionState::Disconnected,
                handshake_done: false,
                connected_at: None,
                last_recv_cmd_at: None,
            }),
            counters: Default::default(),
            events: SessionEventNotifier::new(),
        });

        let (submitter, queue) = OpDispatchQueue::new(initial_seq);

        let handle = SessionHandle {
            shared: shared.clone(),
            submitter: submitter.clone(),
        };

        let session = MetaServerSession {
            config: Arc::new(config),
            connector,
            codec,
            processor,
            shared,
            submitter,
            queue,
            handshake: HandshakeController::new(),
            endpoint: None,
            recv_buf: BytesMut::new(),
            state: SessionState::Disconnected,
            last_connect_attempt: None,
            connected_at: None,
            last_recv_at: None,
        };
        Ok((session, handle))
    }

    /// A session that talks to the meta server over TCP, using [FramedOpCodec]
    pub fn new_tcp(config: SessionConfig, processor: Arc<dyn OpProcessor>) -> anyhow::Result<(MetaServerSession, SessionHandle)> {
        let connector = Arc::new(TcpConnector::new(config.inactivity_timeout));
        let codec = Arc::new(FramedOpCodec::new(config.max_message_size));
        Self::new(config, connector, codec, processor)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
            submitter: self.submitter.clone(),
        }
    }

    pub fn num_awaiting_reply(&self) -> usize {
        self.queue.num_awaiting_reply()
    }

    /// The periodic step: (re)connect if necessary, check liveness, and send queued ops once
    ///  the session is up.
    pub async fn on_tick(&mut self) {
        let now = Instant::now();
        trace!(state = ?self.state, "tick");

        match self.state {
            SessionState::Disconnected => {
                self.try_connect(now).await;
            }
            SessionState::Connecting => {
                self.initiate_handshake().await;
            }
            SessionState::HandshakePending => {
                if !self.is_endpoint_good() {
                    self.disconnect("connection lost while waiting for the handshake reply");
                }
                else if self.is_handshake_overdue(now) {
                    self.disconnect("timeout waiting for the handshake reply");
                }
            }
            SessionState::Up => {
                if !self.is_endpoint_good() {
                    self.disconnect("connection lost");
                }
                else if self.is_inactive(now) {
                    self.disconnect("meta server was silent for longer than the inactivity timeout");
                }
                else {
                    self.dispatch_queued().await;
                }
            }
        }
    }

    /// Waits for data from the meta server, appending it to the receive buffer. This never
    ///  completes while there is no connection.
    ///
    /// NB: This is cancel safe as long as the [Endpoint] implementation is
    pub async fn recv(&mut self) -> anyhow::Result<usize> {
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.recv(&mut self.recv_buf, self.config.max_read_ahead).await,
            None => std::future::pending().await,
        }
    }

    /// Handles the outcome of [Self::recv]
    pub async fn on_received(&mut self, received: anyhow::Result<usize>) {
        match received {
            Ok(0) => {
                self.disconnect("connection closed by the meta server");
            }
            Ok(n) => {
                trace!("received {} bytes", n);
                self.process_received().await;
            }
            Err(e) => {
                self.disconnect(&format!("error receiving from meta server: {}", e));
            }
        }
    }

    /// [Self::recv] followed by [Self::on_received]
    pub async fn receive(&mut self) {
        let received = self.recv().await;
        self.on_received(received).await;
    }

    async fn try_connect(&mut self, now: Instant) {
        if let Some(last_attempt) = self.last_connect_attempt {
            if now.saturating_duration_since(last_attempt) < self.config.retry_interval {
                return;
            }
        }
        self.last_connect_attempt = Some(now);

        debug!("connecting to meta server {}", self.config.meta_server);
        match self.connector.connect(&self.config.meta_server).await {
            Ok(endpoint) => {
                info!("connected to meta server {}", self.config.meta_server);
                self.endpoint = Some(endpoint);
                self.recv_buf.clear();
                self.connected_at = Some(Instant::now());
                self.shared.counters.on_connect();
                self.set_state(SessionState::Connecting);

                self.initiate_handshake().await;
            }
            Err(e) => {
                warn!("error connecting to meta server {} - retrying in {:?}: {}", self.config.meta_server, self.config.retry_interval, e);
            }
        }
    }

    async fn initiate_handshake(&mut self) {
        let hello = match self.hello_message() {
            Ok(hello) => hello,
            Err(e) => {
                self.disconnect(&format!("cannot create handshake: {}", e));
                return;
            }
        };

        let seq = self.submitter.next_seq();
        let Some(hello_op) = self.handshake.initiate(seq, &hello) else {
            self.set_state(SessionState::HandshakePending);
            return;
        };

        let mut buf = BytesMut::new();
        if let Err(e) = self.codec.encode_request(&hello_op, &mut buf) {
            self.disconnect(&format!("cannot encode handshake: {}", e));
            return;
        }

        self.shared.counters.on_hello();
        self.set_state(SessionState::HandshakePending);

        if let Err(e) = self.send(&buf).await {
            self.disconnect(&format!("error sending handshake: {}", e));
        }
    }

    fn hello_message(&self) -> anyhow::Result<HelloMessage> {
        let hostname = match &self.config.chunk_server_hostname {
            Some(hostname) => hostname.clone(),
            None => self.endpoint.as_ref()
                .and_then(|e| e.local_addr())
                .map(|addr| addr.ip().to_string())
                .ok_or_else(|| anyhow!("no chunk server host name is configured, and the connection's local address is unknown"))?,
        };

        Ok(HelloMessage {
            location: ServerLocation::new(hostname, self.config.chunk_server_port),
            cluster_key: self.config.cluster_key.clone(),
            rack_id: self.config.rack_id,
            build_checksum: self.config.build_checksum.clone(),
            capabilities: self.processor.node_capabilities(),
        })
    }

    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.send(buf).await,
            None => bail!("not connected"),
        }
    }

    fn is_endpoint_good(&self) -> bool {
        self.endpoint.as_ref()
            .map(|e| e.is_good())
            .unwrap_or(false)
    }

    /// Only the handshake reply ends the wait for it, other traffic does not count
    fn is_handshake_overdue(&self, now: Instant) -> bool {
        match self.connected_at {
            Some(t) => now.saturating_duration_since(t) >= self.config.inactivity_timeout,
            None => false,
        }
    }

    fn is_inactive(&self, now: Instant) -> bool {
        let last_activity = [self.connected_at, self.last_recv_at].into_iter()
            .flatten()
            .max();
        match last_activity {
            Some(t) => now.saturating_duration_since(t) >= self.config.inactivity_timeout,
            None => false,
        }
    }

    /// Tears down the connection. Requests awaiting a reply are queued for resending on the next
    ///  connection; the handshake is discarded.
    fn disconnect(&mut self, reason: &str) {
        if self.state == SessionState::Disconnected {
            return;
        }

        self.endpoint = None;
        self.recv_buf.clear();
        self.connected_at = None;
        self.handshake.discard();
        let num_requeued = self.queue.requeue_dispatched();

        warn!("disconnected from meta server {}: {} - {} requests queued for resending", self.config.meta_server, reason, num_requeued);
        self.set_state(SessionState::Disconnected);
    }

    async fn dispatch_queued(&mut self) {
        self.dispatch_requests().await;
        if self.state == SessionState::Up {
            self.dispatch_responses().await;
        }
    }

    async fn dispatch_requests(&mut self) {
        let drained = self.queue.drain_requests();
        if drained.is_empty() {
            return;
        }

        let mut buf = BytesMut::new();
        let mut requests = Vec::with_capacity(drained.len());
        for request in drained {
            match self.codec.encode_request(&request.op, &mut buf) {
                Ok(()) => requests.push(request),
                Err(e) => {
                    // dropping the request closes the submitter's reply channel
                    error!("dropping request {:?} ({:?}) that cannot be sent: {}", request.op.seq, request.op.kind, e);
                }
            }
        }
        if requests.is_empty() {
            return;
        }

        debug!("sending {} requests to meta server", requests.len());
        match self.send(&buf).await {
            Ok(()) => {
                let now = Instant::now();
                for request in requests {
                    self.queue.mark_dispatched(request, now);
                }
            }
            Err(e) => {
                self.queue.hold(requests);
                self.disconnect(&format!("error sending requests: {}", e));
            }
        }
    }

    async fn dispatch_responses(&mut self) {
        let responses = self.queue.drain_responses();
        if responses.is_empty() {
            return;
        }

        let mut buf = BytesMut::new();
        for response in &responses {
            self.shared.counters.on_response(&response.kind, &response.status);
            if let Err(e) = self.codec.encode_response(response, &mut buf) {
                error!("dropping response {:?} ({:?}) that cannot be sent: {}", response.seq, response.kind, e);
            }
        }
        if buf.is_empty() {
            return;
        }

        debug!("sending {} responses to meta server", responses.len());
        if let Err(e) = self.send(&buf).await {
            warn!("dropping {} responses that could not be sent", responses.len());
            self.disconnect(&format!("error sending responses: {}", e));
        }
    }

    async fn process_received(&mut self) {
        loop {
            match self.codec.try_decode(&mut self.recv_buf) {
                Decoded::Incomplete => break,
                Decoded::Malformed(reason) => {
                    warn!("discarding malformed data from meta server: {}", reason);
                }
                Decoded::Message(msg) => {
                    self.last_recv_at = Some(Instant::now());
                    self.publish_status();

                    self.route_message(msg).await;
                    if !self.state.is_connected() {
                        break;
                    }
                }
            }
        }
    }

    async fn route_message(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::Reply(reply) => {
                if self.handshake.is_reply_to_handshake(reply.seq) {
                    self.on_handshake_reply(reply).await;
                }
                else if let Some(request) = self.queue.correlate_reply(reply.seq) {
                    trace!("received reply for {:?}", reply.seq);
                    request.complete(reply);
                }
                else {
                    warn!("received a reply for unknown sequence number {:?} ({:?}) - dropping it", reply.seq, reply.kind);
                }
            }
            InboundMessage::Request(op) => {
                if self.state != SessionState::Up {
                    warn!("received request {:?} ({:?}) before the handshake completed - dropping it", op.seq, op.kind);
                    return;
                }

                trace!("received request {:?} ({:?})", op.seq, op.kind);
                self.shared.counters.on_request(&op.kind);
                let responder = Responder::new(op.seq, op.kind.clone(), self.submitter.clone());
                self.processor.on_request(op, responder);
            }
        }
    }

    async fn on_handshake_reply(&mut self, reply: OpReply) {
        match self.handshake.on_reply(&reply) {
            HandshakeOutcome::Accepted => {
                info!("meta server {} accepted the handshake", self.config.meta_server);
                self.set_state(SessionState::Up);
                self.dispatch_queued().await;
            }
            HandshakeOutcome::Rejected(status) => {
                self.shared.counters.on_hello_error();
                error!("meta server {} rejected the handshake with status {} ({:?}) - check cluster key and build checksum", self.config.meta_server, status.code, status.message);
                self.shared.events.send_event(SessionEvent::HandshakeRejected(status));
                self.disconnect("handshake rejected");
            }
        }
    }

    fn set_state(&mut self, new_state: SessionState) {
        let old_state = self.state;
        self.state = new_state;
        self.publish_status();

        if old_state != new_state {
            debug!("session state {:?} -> {:?}", old_state, new_state);
            self.shared.events.send_event(SessionEvent::StateChanged(StateChangedData {
                old_state,
                new_state,
            }));
        }
    }

    fn publish_status(&self) {
        let mut status = self.shared.status.write()
            .unwrap_or_else(|e| e.into_inner());
        *status = SessionStatus {
            state: self.state,
            handshake_done: self.handshake.is_complete(),
            connected_at: self.connected_at,
            last_recv_cmd_at: self.last_recv_at,
        };
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;
    use bytes::{BufMut, Bytes};
    use tokio::time::advance;

    use super::*;
    use crate::session::endpoint::MockConnector;
    use crate::session::op::OpStatus;
    use crate::session::processor::MockOpProcessor;
    use crate::test_util::endpoint::{TestConnection, TrackingConnector};
    use crate::test_util::processor::TrackingProcessor;
    use crate::test_util::test_session_config;
    use SessionState::*;

    fn corrupt_chunk() -> OpKind {
        OpKind::Other("CORRUPT_CHUNK".to_string())
    }

    fn new_session(initial_seq: i64) -> (MetaServerSession, SessionHandle, Arc<TrackingConnector>, Arc<TrackingProcessor>) {
        let connector = TrackingConnector::new();
        let processor = TrackingProcessor::new(vec![("totalSpace".to_string(), "1000".to_string())]);
        let (session, handle) = MetaServerSession::new(
            test_session_config(initial_seq),
            connector.clone(),
            Arc::new(FramedOpCodec::new(1024 * 1024)),
            processor.clone(),
        ).unwrap();
        (session, handle, connector, processor)
    }

    /// connects and completes the handshake, returning the meta server's end of the connection
    async fn bring_up(session: &mut MetaServerSession, connector: &TrackingConnector) -> TestConnection {
        session.on_tick().await;
        let connection = connector.last_connection();

        let sent = connection.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OpKind::Hello);

        connection.push_reply(sent[0].seq, OpKind::Hello, OpStatus::ok());
        session.receive().await;
        assert_eq!(session.state(), Up);
        connection
    }

    fn sent_seqs(connection: &TestConnection) -> Vec<i64> {
        connection.take_sent_requests().iter()
            .map(|op| op.seq.0)
            .collect()
    }

    fn state_changes(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<(SessionState, SessionState)> {
        let mut result = Vec::new();
        while let Ok(evt) = events.try_recv() {
            if let SessionEvent::StateChanged(data) = evt {
                result.push((data.old_state, data.new_state));
            }
        }
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_sends_exactly_one_handshake() {
        let (mut session, handle, connector, _) = new_session(1);
        let mut events = handle.subscribe();

        session.on_tick().await;
        assert_eq!(state_changes(&mut events), vec![(Disconnected, Connecting), (Connecting, HandshakePending)]);

        let connection = connector.last_connection();
        let sent = connection.take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OpKind::Hello);

        let hello = HelloMessage::try_deser(&mut sent[0].payload.clone()).unwrap();
        assert_eq!(hello, HelloMessage {
            location: ServerLocation::new("chunk1", 22000),
            cluster_key: "K1".to_string(),
            rack_id: 3,
            build_checksum: "abc123".to_string(),
            capabilities: vec![("totalSpace".to_string(), "1000".to_string())],
        });

        assert!(handle.is_connected());
        assert!(!handle.is_handshake_done());
        assert!(!handle.is_up());

        connection.push_reply(sent[0].seq, OpKind::Hello, OpStatus::ok());
        session.receive().await;

        assert_eq!(state_changes(&mut events), vec![(HandshakePending, Up)]);
        assert!(!session.handshake.is_outstanding());
        assert!(handle.is_handshake_done());
        assert!(handle.is_up());

        let counters = handle.counters();
        assert_eq!(counters.connect_count, 1);
        assert_eq!(counters.hello_count, 1);
        assert_eq!(counters.hello_error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_advertises_local_address_without_configured_hostname() {
        let connector = TrackingConnector::new();
        let mut config = test_session_config(1);
        config.chunk_server_hostname = None;
        let (mut session, _) = MetaServerSession::new(config, connector.clone(), Arc::new(FramedOpCodec::new(1024)), TrackingProcessor::new(vec![])).unwrap();

        session.on_tick().await;
        let sent = connector.last_connection().take_sent_requests();
        let hello = HelloMessage::try_deser(&mut sent[0].payload.clone()).unwrap();
        assert_eq!(hello.location, ServerLocation::new("127.0.0.1", 22000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_requests_before_handshake_completes() {
        let (mut session, handle, connector, _) = new_session(1);

        session.on_tick().await;
        let connection = connector.last_connection();
        let hello = connection.take_sent_requests().remove(0);

        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(handle.submit_request(corrupt_chunk(), Bytes::new()));
        }
        for _ in 0..5 {
            advance(Duration::from_millis(100)).await;
            session.on_tick().await;
            assert!(connection.take_sent().is_empty());
        }
        assert_eq!(session.state(), HandshakePending);

        connection.push_reply(hello.seq, OpKind::Hello, OpStatus::ok());
        session.receive().await;

        assert_eq!(sent_seqs(&connection), vec![2, 3, 4]);
        assert_eq!(session.num_awaiting_reply(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_outstanding_handshake() {
        let (mut session, _, connector, _) = new_session(1);

        for _ in 0..20 {
            session.on_tick().await;
            advance(Duration::from_millis(400)).await;
        }

        assert_eq!(connector.num_attempts(), 1);
        let sent = connector.last_connection().take_sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, OpKind::Hello);
        assert_eq!(session.state(), HandshakePending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (mut session, handle, connector, _) = new_session(1);

        session.on_tick().await;
        let first = connector.last_connection();
        assert_eq!(sent_seqs(&first), vec![1]);

        advance(Duration::from_secs(10)).await;
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);

        // a fresh handshake with a new sequence number on the next connection
        session.on_tick().await;
        assert_eq!(session.state(), HandshakePending);
        assert_eq!(connector.num_connections(), 2);
        assert_eq!(sent_seqs(&connector.last_connection()), vec![2]);

        // a late reply to the discarded handshake is ignored
        connector.last_connection().push_reply(SeqNo(1), OpKind::Hello, OpStatus::ok());
        session.receive().await;
        assert_eq!(session.state(), HandshakePending);
        assert_eq!(handle.counters().hello_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_is_not_extended_by_other_traffic() {
        let (mut session, _, connector, _) = new_session(1);

        session.on_tick().await;
        let connection = connector.last_connection();
        assert_eq!(sent_seqs(&connection), vec![1]);

        for _ in 0..5 {
            advance(Duration::from_secs(1)).await;
            session.on_tick().await;
        }
        connection.push_reply(SeqNo(77), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        assert_eq!(session.state(), HandshakePending);

        for _ in 0..4 {
            advance(Duration::from_secs(1)).await;
            session.on_tick().await;
            assert_eq!(session.state(), HandshakePending);
        }

        advance(Duration::from_secs(1)).await;
        connection.push_reply(SeqNo(78), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_rejected() {
        let (mut session, handle, connector, _) = new_session(1);
        let mut events = handle.subscribe();

        session.on_tick().await;
        let connection = connector.last_connection();
        let hello = connection.take_sent_requests().remove(0);

        let (_, _reply) = handle.submit_request(corrupt_chunk(), Bytes::new());

        connection.push_reply(hello.seq, OpKind::Hello, OpStatus::error(-22, "cluster key mismatch"));
        session.receive().await;

        assert_eq!(session.state(), Disconnected);
        assert!(!handle.is_handshake_done());
        assert!(connection.take_sent().is_empty());
        assert_eq!(handle.counters().hello_error_count, 1);

        let all_events = std::iter::from_fn(|| events.try_recv().ok()).collect::<Vec<_>>();
        assert!(all_events.contains(&SessionEvent::HandshakeRejected(OpStatus::error(-22, "cluster key mismatch"))));

        // the reconnect loop continues, spaced by the retry interval
        session.on_tick().await;
        assert_eq!(connector.num_attempts(), 1);
        advance(Duration::from_secs(1)).await;
        session.on_tick().await;
        assert_eq!(connector.num_attempts(), 2);
        assert_eq!(session.state(), HandshakePending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_after_reconnect() {
        let (mut session, handle, connector, _) = new_session(4);
        let first = bring_up(&mut session, &connector).await;

        let (seq_5, reply_5) = handle.submit_request(corrupt_chunk(), Bytes::from_static(b"five"));
        let (seq_6, reply_6) = handle.submit_request(corrupt_chunk(), Bytes::from_static(b"six"));
        assert_eq!((seq_5, seq_6), (SeqNo(5), SeqNo(6)));

        session.on_tick().await;
        assert_eq!(sent_seqs(&first), vec![5, 6]);
        assert_eq!(session.num_awaiting_reply(), 2);

        first.close();
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
        assert_eq!(session.num_awaiting_reply(), 0);

        advance(Duration::from_secs(1)).await;
        session.on_tick().await;
        let second = connector.last_connection();
        let hello = second.take_sent_requests();
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].kind, OpKind::Hello);
        assert_eq!(hello[0].seq, SeqNo(7));

        second.push_reply(SeqNo(7), OpKind::Hello, OpStatus::ok());
        session.receive().await;

        assert_eq!(second.take_sent_requests(), vec![
            Op::new(SeqNo(5), corrupt_chunk(), Bytes::from_static(b"five")),
            Op::new(SeqNo(6), corrupt_chunk(), Bytes::from_static(b"six")),
        ]);

        // nothing is sent twice
        session.on_tick().await;
        assert!(second.take_sent().is_empty());

        second.push_reply(SeqNo(6), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        second.push_reply(SeqNo(5), corrupt_chunk(), OpStatus::error(-2, "no such chunk"));
        session.receive().await;

        assert_eq!(reply_6.await.unwrap().status, OpStatus::ok());
        assert_eq!(reply_5.await.unwrap().status, OpStatus::error(-2, "no such chunk"));
        assert_eq!(session.num_awaiting_reply(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_queued_while_disconnected_follow_replayed_ones() {
        let (mut session, handle, connector, _) = new_session(1);
        let first = bring_up(&mut session, &connector).await;

        let (_, _r1) = handle.submit_request(corrupt_chunk(), Bytes::new());
        session.on_tick().await;
        let (_, _r2) = handle.submit_request(corrupt_chunk(), Bytes::new());
        let (_, _r3) = handle.submit_request(corrupt_chunk(), Bytes::new());

        first.close();
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);

        advance(Duration::from_secs(1)).await;
        let second = bring_up(&mut session, &connector).await;
        assert_eq!(sent_seqs(&second), vec![2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_correlation() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        let (_, reply_2) = handle.submit_request(corrupt_chunk(), Bytes::new());
        let (_, mut reply_3) = handle.submit_request(corrupt_chunk(), Bytes::new());
        session.on_tick().await;
        assert_eq!(sent_seqs(&connection), vec![2, 3]);

        connection.push_reply(SeqNo(99), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        assert_eq!(session.state(), Up);
        assert_eq!(session.num_awaiting_reply(), 2);

        connection.push_reply(SeqNo(2), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        assert_eq!(reply_2.await.unwrap().seq, SeqNo(2));
        assert_eq!(session.num_awaiting_reply(), 1);
        assert!(reply_3.try_recv().is_err());

        // duplicate reply
        connection.push_reply(SeqNo(2), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        assert_eq!(session.num_awaiting_reply(), 1);
        assert_eq!(session.state(), Up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_is_sent_but_not_tracked() {
        let (mut session, handle, connector, processor) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        let request = Op::new(SeqNo(1000), OpKind::AllocChunk, Bytes::from_static(b"chunk 77"));
        connection.push_request(&request);
        session.receive().await;

        let mut received = processor.take_received();
        assert_eq!(received.len(), 1);
        let (op, responder) = received.remove(0);
        assert_eq!(op, request);
        responder.respond_ok(Bytes::from_static(b"allocated"));

        session.on_tick().await;
        let sent = connection.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            InboundMessage::Reply(reply) => {
                assert_eq!(reply.seq, SeqNo(1000));
                assert_eq!(reply.kind, OpKind::AllocChunk);
                assert_eq!(reply.status, OpStatus::ok());
                assert_eq!(reply.payload, Bytes::from_static(b"allocated"));
            }
            other => panic!("expected a response, was {:?}", other),
        }

        assert_eq!(session.num_awaiting_reply(), 0);
        assert!(session.queue.drain_responses().is_empty());

        let counters = handle.counters();
        assert_eq!(counters.alloc_count, 1);
        assert_eq!(counters.alloc_error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_failure_is_reported_as_response() {
        let (mut session, handle, connector, processor) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        connection.push_request(&Op::new(SeqNo(500), OpKind::AllocChunk, Bytes::new()));
        session.receive().await;
        let (_, responder) = processor.take_received().remove(0);
        responder.respond_error(-28, "no space left");

        session.on_tick().await;
        match &connection.take_sent()[0] {
            InboundMessage::Reply(reply) => assert_eq!(reply.status, OpStatus::error(-28, "no space left")),
            other => panic!("expected a response, was {:?}", other),
        }
        assert_eq!(session.state(), Up);
        assert_eq!(handle.counters().alloc_error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_flushed_before_responses() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        handle.submit_response(Op::response(SeqNo(300), corrupt_chunk(), OpStatus::ok(), Bytes::new()));
        let (_, _reply) = handle.submit_request(corrupt_chunk(), Bytes::new());

        session.on_tick().await;
        let sent = connection.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], InboundMessage::Request(op) if op.seq == SeqNo(2)));
        assert!(matches!(&sent[1], InboundMessage::Reply(reply) if reply.seq == SeqNo(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_requests_before_handshake_are_dropped() {
        let connector = TrackingConnector::new();
        let mut processor = MockOpProcessor::new();
        processor.expect_node_capabilities().returning(Vec::new);
        processor.expect_on_request().never();

        let (mut session, handle) = MetaServerSession::new(test_session_config(1), connector.clone(), Arc::new(FramedOpCodec::new(1024)), Arc::new(processor)).unwrap();

        session.on_tick().await;
        connector.last_connection().push_request(&Op::new(SeqNo(12), OpKind::AllocChunk, Bytes::new()));
        session.receive().await;

        assert_eq!(session.state(), HandshakePending);
        assert_eq!(handle.counters().alloc_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_spacing() {
        let mut connector = MockConnector::new();
        connector.expect_connect()
            .times(2)
            .returning(|_| Err(anyhow!("connection refused")));

        let (mut session, handle) = MetaServerSession::new(test_session_config(1), Arc::new(connector), Arc::new(FramedOpCodec::new(1024)), TrackingProcessor::new(vec![])).unwrap();

        session.on_tick().await;
        for _ in 0..9 {
            advance(Duration::from_millis(100)).await;
            session.on_tick().await;
        }
        assert_eq!(session.state(), Disconnected);

        advance(Duration::from_millis(100)).await;
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
        assert_eq!(handle.counters().connect_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_disconnects() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        advance(Duration::from_secs(9)).await;
        connection.push_request(&Op::new(SeqNo(1), OpKind::Other("HEARTBEAT".to_string()), Bytes::new()));
        session.receive().await;

        advance(Duration::from_secs(9)).await;
        session.on_tick().await;
        assert_eq!(session.state(), Up);

        advance(Duration::from_secs(1)).await;
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
        assert_eq!(handle.counters().for_kind(&OpKind::Other("HEARTBEAT".to_string())).attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_data_does_not_disconnect() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        let (_, reply) = handle.submit_request(corrupt_chunk(), Bytes::new());
        session.on_tick().await;
        connection.take_sent();

        let mut garbage = BytesMut::new();
        garbage.put_u32(u32::MAX);
        garbage.put_slice(b"garbage");
        connection.push_raw(garbage.freeze());
        session.receive().await;
        assert_eq!(session.state(), Up);

        connection.push_reply(SeqNo(2), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        assert_eq!(reply.await.unwrap().seq, SeqNo(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_split_across_reads() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        let (_, mut reply) = handle.submit_request(corrupt_chunk(), Bytes::new());
        session.on_tick().await;

        let mut buf = BytesMut::new();
        FramedOpCodec::new(1024).encode_response(&Op::response(SeqNo(2), corrupt_chunk(), OpStatus::ok(), Bytes::new()), &mut buf).unwrap();
        let mut buf = buf.freeze();
        let head = buf.split_to(10);

        connection.push_raw(head);
        session.receive().await;
        assert!(reply.try_recv().is_err());

        connection.push_raw(buf);
        session.receive().await;
        assert_eq!(reply.await.unwrap().seq, SeqNo(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_disconnects() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        connection.close();
        session.receive().await;
        assert_eq!(session.state(), Disconnected);
        assert!(!handle.is_connected());
        assert!(!handle.is_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_queries() {
        let (mut session, handle, connector, _) = new_session(100);
        assert_eq!(handle.location(), &ServerLocation::new("meta", 20000));
        assert_eq!(handle.state(), Disconnected);
        assert_eq!(handle.connection_uptime(), Duration::ZERO);
        assert!(handle.last_recv_cmd_time().is_none());

        let connection = bring_up(&mut session, &connector).await;
        assert!(handle.last_recv_cmd_time().is_some());

        advance(Duration::from_secs(5)).await;
        assert_eq!(handle.connection_uptime(), Duration::from_secs(5));

        // the hello used 100
        let a = handle.next_seq();
        let b = handle.next_seq();
        assert_eq!(a, SeqNo(101));
        assert!(b > a);

        connection.close();
        session.on_tick().await;
        assert_eq!(handle.connection_uptime(), Duration::ZERO);
        assert!(handle.last_recv_cmd_time().is_some());

        let counters = handle.counters_and_clear();
        assert_eq!(counters.connect_count, 1);
        assert_eq!(handle.counters(), Counters::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submitted_requests_get_distinct_sequence_numbers() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        let (seq_a, reply_a) = handle.submit_request(corrupt_chunk(), Bytes::from_static(b"a"));
        let skipped = handle.next_seq();
        let (seq_b, reply_b) = handle.submit_request(corrupt_chunk(), Bytes::from_static(b"b"));
        assert_eq!((seq_a, skipped, seq_b), (SeqNo(2), SeqNo(3), SeqNo(4)));

        session.on_tick().await;
        assert_eq!(sent_seqs(&connection), vec![2, 4]);

        connection.push_reply(seq_b, corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        connection.push_reply(seq_a, corrupt_chunk(), OpStatus::error(-5, "io error"));
        session.receive().await;

        assert_eq!(reply_a.await.unwrap().status, OpStatus::error(-5, "io error"));
        assert_eq!(reply_b.await.unwrap().status, OpStatus::ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_send_replays_once_in_order() {
        let (mut session, handle, connector, _) = new_session(1);
        let first = bring_up(&mut session, &connector).await;

        let (_, reply_2) = handle.submit_request(corrupt_chunk(), Bytes::new());
        session.on_tick().await;
        assert_eq!(sent_seqs(&first), vec![2]);

        let (_, reply_3) = handle.submit_request(corrupt_chunk(), Bytes::new());
        let (_, reply_4) = handle.submit_request(corrupt_chunk(), Bytes::new());
        first.set_fail_sends(true);
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
        assert!(first.take_sent().is_empty());
        assert_eq!(session.num_awaiting_reply(), 0);

        advance(Duration::from_secs(1)).await;
        let second = bring_up(&mut session, &connector).await;
        assert_eq!(sent_seqs(&second), vec![2, 3, 4]);

        session.on_tick().await;
        assert!(second.take_sent().is_empty());

        for seq in 2..=4 {
            second.push_reply(SeqNo(seq), corrupt_chunk(), OpStatus::ok());
            session.receive().await;
        }
        assert_eq!(reply_2.await.unwrap().seq, SeqNo(2));
        assert_eq!(reply_3.await.unwrap().seq, SeqNo(3));
        assert_eq!(reply_4.await.unwrap().seq, SeqNo(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_send_disconnects() {
        let (mut session, handle, connector, _) = new_session(1);
        let mut events = handle.subscribe();
        connector.set_fail_sends_on_new_connections(true);

        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
        assert_eq!(state_changes(&mut events), vec![(Disconnected, Connecting), (Connecting, HandshakePending), (HandshakePending, Disconnected)]);
        assert!(connector.last_connection().take_sent().is_empty());
        assert_eq!(handle.counters().hello_count, 1);

        connector.set_fail_sends_on_new_connections(false);
        advance(Duration::from_secs(1)).await;
        session.on_tick().await;
        assert_eq!(session.state(), HandshakePending);
        assert_eq!(connector.num_connections(), 2);
        assert_eq!(sent_seqs(&connector.last_connection()), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_response_send_drops_responses() {
        let (mut session, handle, connector, processor) = new_session(1);
        let first = bring_up(&mut session, &connector).await;

        first.push_request(&Op::new(SeqNo(500), OpKind::AllocChunk, Bytes::new()));
        session.receive().await;
        let (_, responder) = processor.take_received().remove(0);
        responder.respond_ok(Bytes::new());

        first.set_fail_sends(true);
        session.on_tick().await;
        assert_eq!(session.state(), Disconnected);
        assert!(first.take_sent().is_empty());
        assert_eq!(handle.counters().alloc_count, 1);

        advance(Duration::from_secs(1)).await;
        let second = bring_up(&mut session, &connector).await;
        session.on_tick().await;
        assert!(second.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connection_is_retried() {
        let (mut session, handle, connector, _) = new_session(1);
        connector.set_refuse_connections(true);

        session.on_tick().await;
        assert_eq!(connector.num_attempts(), 1);
        assert_eq!(connector.num_connections(), 0);
        assert_eq!(session.state(), Disconnected);

        connector.set_refuse_connections(false);
        session.on_tick().await;
        assert_eq!(connector.num_attempts(), 1);

        advance(Duration::from_secs(1)).await;
        session.on_tick().await;
        assert_eq!(connector.num_attempts(), 2);
        assert_eq!(connector.num_connections(), 1);
        assert_eq!(session.state(), HandshakePending);
        assert_eq!(handle.counters().connect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_is_dropped() {
        let (mut session, handle, connector, _) = new_session(1);
        let connection = bring_up(&mut session, &connector).await;

        let (_, too_big) = handle.submit_request(corrupt_chunk(), vec![0u8; 2 * 1024 * 1024]);
        let (_, small) = handle.submit_request(corrupt_chunk(), Bytes::from_static(b"small"));

        session.on_tick().await;
        assert_eq!(sent_seqs(&connection), vec![3]);
        assert_eq!(session.state(), Up);
        assert_eq!(session.num_awaiting_reply(), 1);
        assert!(too_big.await.is_err());

        connection.push_reply(SeqNo(3), corrupt_chunk(), OpStatus::ok());
        session.receive().await;
        assert_eq!(small.await.unwrap().seq, SeqNo(3));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_session_config(1);
        config.chunk_server_port = 0;
        assert!(MetaServerSession::new(config, TrackingConnector::new(), Arc::new(FramedOpCodec::new(1024)), TrackingProcessor::new(vec![])).is_err());
    }
}
