//! Per-batch relay lanes
//!
//! Calls for the same batch id go through one lane: a gate serializes them and
//! a `watch` channel lets the proof relay wait until the commitment landed.
//! Lanes of different batch ids are independent.

use dashmap::DashMap;
use rollup_types::{BatchId, Commitment};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneStatus {
    /// No successful commitment observed yet
    Pending,
    Committed(Commitment),
    /// Last commitment attempt gave up; the next attempt resets the lane
    CommitFailed,
}

pub struct Lane {
    pub(crate) gate: Mutex<()>,
    status: watch::Sender<LaneStatus>,
}

impl Lane {
    fn new() -> Self {
        let (status, _) = watch::channel(LaneStatus::Pending);
        Self {
            gate: Mutex::new(()),
            status,
        }
    }

    pub fn status(&self) -> LaneStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LaneStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set(&self, status: LaneStatus) {
        self.status.send_replace(status);
    }
}

#[derive(Default)]
pub struct Lanes {
    lanes: DashMap<BatchId, Arc<Lane>>,
}

impl Lanes {
    /// Lane for `batch_id`, created on first use
    pub fn get(&self, batch_id: BatchId) -> Arc<Lane> {
        self.lanes
            .entry(batch_id)
            .or_insert_with(|| Arc::new(Lane::new()))
            .clone()
    }

    /// Put a failed lane back to Pending before a new attempt, so proof relays
    /// of that attempt wait for its commitment instead of the stale failure
    pub fn reopen(&self, batch_id: BatchId) {
        if let Some(lane) = self.lanes.get(&batch_id) {
            if lane.status() == LaneStatus::CommitFailed {
                lane.set(LaneStatus::Pending);
            }
        }
    }

    /// Drop the lane once no more work will happen for its batch
    pub fn close(&self, batch_id: BatchId) {
        self.lanes.remove(&batch_id);
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}
