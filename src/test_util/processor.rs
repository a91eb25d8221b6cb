use std::sync::{Arc, Mutex};

use crate::session::op::Op;
use crate::session::processor::{OpProcessor, Responder};

/// An [OpProcessor] that keeps every request it receives, leaving it to the test to respond
pub struct TrackingProcessor {
    capabilities: Vec<(String, String)>,
    received: Mutex<Vec<(Op, Responder)>>,
}
impl TrackingProcessor {
    pub fn new(capabilities: Vec<(String, String)>) -> Arc<TrackingProcessor> {
        Arc::new(TrackingProcessor {
            capabilities,
            received: Default::default(),
        })
    }

    pub fn take_received(&self) -> Vec<(Op, Responder)> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }
}

impl OpProcessor for TrackingProcessor {
    fn node_capabilities(&self) -> Vec<(String, String)> {
        self.capabilities.clone()
    }

    fn on_request(&self, op: Op, responder: Responder) {
        self.received.lock().unwrap()
            .push((op, responder));
    }
}
