//! Two-level run admission.
//!
//! Each session key owns a concurrency-1 lane, and the whole agent shares
//! one global lane. A run is admitted only after acquiring a slot in the
//! session lane AND the global lane, in that order — taking the session
//! slot first means a queued same-session run cannot starve while the
//! global lane is saturated by other sessions. Both lanes hand out slots
//! in strict FIFO order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// FIFO lane scheduler bounding per-session and global concurrency.
pub struct LaneScheduler {
    global: Arc<Semaphore>,
    session_lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Both slots for one admitted run; released on drop.
pub struct LanePermit {
    _session: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl LaneScheduler {
    /// Create a scheduler with the given global concurrency cap.
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            session_lanes: Mutex::new(HashMap::new()),
        }
    }

    fn session_lane(&self, session_key: &str) -> Arc<Semaphore> {
        let mut lanes = self
            .session_lanes
            .lock()
            .expect("lane registry poisoned");
        Arc::clone(
            lanes
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Wait for admission. Timeouts are the caller's concern: wrap this in
    /// a cancellable select if needed.
    pub async fn admit(&self, session_key: &str) -> LanePermit {
        let session = self
            .session_lane(session_key)
            .acquire_owned()
            .await
            .expect("session lane closed");
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .expect("global lane closed");
        LanePermit {
            _session: session,
            _global: global,
        }
    }

    /// Currently free global slots (diagnostics only).
    pub fn available_global_slots(&self) -> usize {
        self.global.available_permits()
    }
}
