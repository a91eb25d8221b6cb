use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::session::op::{OpKind, OpStatus};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KindCounters {
    pub attempts: i64,
    pub errors: i64,
}

/// Lifetime tallies of the session. They are never reset except by an explicit
///  [SessionCounters::snapshot_and_clear].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub connect_count: i64,
    pub hello_count: i64,
    pub hello_error_count: i64,
    pub alloc_count: i64,
    pub alloc_error_count: i64,
    /// attempt / error pairs for every kind of server-initiated request, allocations included
    pub per_kind: FxHashMap<OpKind, KindCounters>,
}
impl Counters {
    pub fn for_kind(&self, kind: &OpKind) -> KindCounters {
        self.per_kind.get(kind)
            .copied()
            .unwrap_or_default()
    }
}

/// Counters are incremented by the session and read concurrently by the rest of the process.
///  They are kept behind a single lock so that a snapshot is consistent across all fields.
#[derive(Default)]
pub struct SessionCounters {
    counters: Mutex<Counters>,
}
impl SessionCounters {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        // counters stay meaningful even if some thread panicked while holding the lock
        self.counters.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_connect(&self) {
        self.lock().connect_count += 1;
    }

    pub fn on_hello(&self) {
        self.lock().hello_count += 1;
    }

    pub fn on_hello_error(&self) {
        self.lock().hello_error_count += 1;
    }

    /// a server-initiated request was handed to the processing path
    pub fn on_request(&self, kind: &OpKind) {
        let mut counters = self.lock();
        if kind == &OpKind::AllocChunk {
            counters.alloc_count += 1;
        }
        counters.per_kind.entry(kind.clone())
            .or_default()
            .attempts += 1;
    }

    /// the response to a server-initiated request is sent
    pub fn on_response(&self, kind: &OpKind, status: &OpStatus) {
        if status.is_ok() {
            return;
        }

        let mut counters = self.lock();
        if kind == &OpKind::AllocChunk {
            counters.alloc_error_count += 1;
        }
        counters.per_kind.entry(kind.clone())
            .or_default()
            .errors += 1;
    }

    pub fn snapshot(&self) -> Counters {
        self.lock().clone()
    }

    pub fn snapshot_and_clear(&self) -> Counters {
        std::mem::take(&mut *self.lock())
    }
}
