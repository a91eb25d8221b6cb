//! Outbound ops travel from the processing path to the session through two channels, one for
//!  requests and one for responses. Requests get their sequence numbers from the submitter, which
//!  is the only source of sequence numbers for the session. Producers never block, and the session drains whatever is
//!  there on each tick: an op submitted during a drain lands either in that batch or in the next
//!  one.
//!
//! Requests are owned by exactly one place at any time: the channel, the replay queue (for
//!  requests that must go out again after a reconnect), or the map of dispatched requests that
//!  await a reply. A request leaves the map either with its reply or by being moved back to the
//!  replay queue when the connection breaks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::op::{Op, OpKind, OpReply, SeqNo};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestStage {
    Queued,
    Dispatched { at: Instant },
}

#[derive(Debug)]
pub struct TrackedRequest {
    pub op: Op,
    stage: RequestStage,
    reply_to: Option<oneshot::Sender<OpReply>>,
}
impl TrackedRequest {
    pub fn stage(&self) -> RequestStage {
        self.stage
    }

    /// Hands the reply to whoever submitted the request, consuming the request.
    pub fn complete(self, reply: OpReply) {
        if let Some(reply_to) = self.reply_to {
            if reply_to.send(reply).is_err() {
                debug!("reply for {:?} arrived after the submitter lost interest", self.op.seq);
            }
        }
    }
}


/// The producer side, cheap to clone
#[derive(Clone, Debug)]
pub struct OpSubmitter {
    next_seq: Arc<AtomicI64>,
    requests: mpsc::UnboundedSender<TrackedRequest>,
    responses: mpsc::UnboundedSender<Op>,
}
impl OpSubmitter {
    /// Returns a sequence number that was never returned before
    pub fn next_seq(&self) -> SeqNo {
        SeqNo(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues a request for the meta server under a fresh sequence number. The returned receiver
    ///  resolves with the meta server's reply, however many reconnects that takes.
    pub fn submit_request(&self, kind: OpKind, payload: impl Into<Bytes>) -> (SeqNo, oneshot::Receiver<OpReply>) {
        let (reply_to, reply) = oneshot::channel();
        let seq = self.next_seq();
        let request = TrackedRequest {
            op: Op::new(seq, kind, payload),
            stage: RequestStage::Queued,
            reply_to: Some(reply_to),
        };
        if self.requests.send(request).is_err() {
            // the receiver side is dropped, so the caller will see its reply channel closed
            warn!("session is shut down - dropping request {:?}", seq);
        }
        (seq, reply)
    }

    /// Queues the response to a server-initiated request. Responses are fire-and-forget.
    pub fn submit_response(&self, op: Op) {
        let seq = op.seq;
        if self.responses.send(op).is_err() {
            warn!("session is shut down - dropping response {:?}", seq);
        }
    }
}


/// The consumer side, owned by the session
pub struct OpDispatchQueue {
    requests: mpsc::UnboundedReceiver<TrackedRequest>,
    responses: mpsc::UnboundedReceiver<Op>,
    replay: VecDeque<TrackedRequest>,
    dispatched: BTreeMap<SeqNo, TrackedRequest>,
}
impl OpDispatchQueue {
    pub fn new(initial_seq: i64) -> (OpSubmitter, OpDispatchQueue) {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (response_sender, response_receiver) = mpsc::unbounded_channel();

        let submitter = OpSubmitter {
            next_seq: Arc::new(AtomicI64::new(initial_seq)),
            requests: request_sender,
            responses: response_sender,
        };
        let queue = OpDispatchQueue {
            requests: request_receiver,
            responses: response_receiver,
            replay: Default::default(),
            dispatched: Default::default(),
        };
        (submitter, queue)
    }

    /// Removes and returns all queued requests, requests waiting for replay first.
    pub fn drain_requests(&mut self) -> Vec<TrackedRequest> {
        let mut result = self.replay.drain(..).collect::<Vec<_>>();
        while let Ok(request) = self.requests.try_recv() {
            result.push(request);
        }
        result
    }

    pub fn drain_responses(&mut self) -> Vec<Op> {
        let mut result = Vec::new();
        while let Ok(response) = self.responses.try_recv() {
            result.push(response);
        }
        result
    }

    /// Puts requests that were drained but could not be sent back to the front of the queue,
    ///  preserving their order.
    pub fn hold(&mut self, requests: Vec<TrackedRequest>) {
        for mut request in requests.into_iter().rev() {
            request.stage = RequestStage::Queued;
            self.replay.push_front(request);
        }
    }

    pub fn mark_dispatched(&mut self, mut request: TrackedRequest, now: Instant) {
        request.stage = RequestStage::Dispatched { at: now };
        let seq = request.op.seq;
        if self.dispatched.insert(seq, request).is_some() {
            // sequence numbers are never reused, so this is a bug
            warn!("request {:?} was dispatched twice - the reply goes to the most recent one", seq);
        }
    }

    /// Removes and returns the dispatched request for a reply's sequence number, or `None` if
    ///  no dispatched request has that sequence number.
    pub fn correlate_reply(&mut self, seq: SeqNo) -> Option<TrackedRequest> {
        self.dispatched.remove(&seq)
    }

    pub fn is_awaiting_reply(&self, seq: SeqNo) -> bool {
        self.dispatched.contains_key(&seq)
    }

    pub fn num_awaiting_reply(&self) -> usize {
        self.dispatched.len()
    }

    pub fn num_queued_for_replay(&self) -> usize {
        self.replay.len()
    }

    /// Called when the connection is lost: all requests awaiting a reply go back to the front
    ///  of the queue, in sequence order, to be sent again on the next connection.
    pub fn requeue_dispatched(&mut self) -> usize {
        let dispatched = std::mem::take(&mut self.dispatched);
        let num_requeued = dispatched.len();
        self.hold(dispatched.into_values().collect());
        num_requeued
    }
}
