use crate::hardware::VcpFeature;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::time::Duration;

/// A hardware write a store wants performed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteRequest {
    pub stable_id: String,
    pub feature: VcpFeature,
    /// Target on the 0..100 scale.
    pub value: f64,
    /// Target in device units.
    pub raw_value: u32,
}

impl WriteRequest {
    fn same_slot(&self, other: &WriteRequest) -> bool {
        self.feature == other.feature && self.stable_id == other.stable_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// A new request was queued.
    Queued,
    /// An unexecuted request for the same display and feature was replaced.
    Coalesced,
}

/// Last-write-wins mailbox between the stores and the hardware writer.
/// Holds at most one request per (display, feature).
pub struct WriteOutbox {
    state: Mutex<OutboxState>,
    ready: Condvar,
}

#[derive(Default)]
struct OutboxState {
    pending: Vec<WriteRequest>,
    posted: u64,
    closed: bool,
}

impl WriteOutbox {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            ready: Condvar::new(),
        }
    }

    pub fn post(&self, request: WriteRequest) -> PostOutcome {
        let mut state = self.state.lock();
        state.posted += 1;
        let outcome = match state.pending.iter().position(|p| p.same_slot(&request)) {
            Some(i) => {
                state.pending[i] = request;
                PostOutcome::Coalesced
            }
            None => {
                state.pending.push(request);
                PostOutcome::Queued
            }
        };
        drop(state);
        self.ready.notify_one();
        outcome
    }

    /// Replaces the value of a request that is still waiting for the writer.
    /// Returns false, and drops `request`, when nothing is pending for its slot.
    pub fn update_pending(&self, request: WriteRequest) -> bool {
        let mut state = self.state.lock();
        match state.pending.iter().position(|p| p.same_slot(&request)) {
            Some(i) => {
                state.pending[i] = request;
                true
            }
            None => false,
        }
    }

    pub fn take_all(&self) -> Vec<WriteRequest> {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Blocks until requests are available, the timeout passes, or the
    /// outbox is closed. Returns whatever was pending.
    pub fn wait_and_take(&self, timeout: Duration) -> Vec<WriteRequest> {
        let mut state = self.state.lock();
        if state.pending.is_empty() && !state.closed {
            let _ = self.ready.wait_for(&mut state, timeout);
        }
        std::mem::take(&mut state.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of `post` calls since creation.
    pub fn posted_count(&self) -> u64 {
        self.state.lock().posted
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for WriteOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, feature: VcpFeature, value: f64) -> WriteRequest {
        WriteRequest { stable_id: id.into(), feature, value, raw_value: value as u32 }
    }

    #[test]
    fn one_slot_per_display_and_feature() {
        let outbox = WriteOutbox::new();
        assert_eq!(outbox.post(request("a", VcpFeature::Brightness, 10.0)), PostOutcome::Queued);
        assert_eq!(outbox.post(request("a", VcpFeature::Contrast, 20.0)), PostOutcome::Queued);
        assert_eq!(outbox.post(request("a", VcpFeature::Brightness, 30.0)), PostOutcome::Coalesced);

        let taken = outbox.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].value, 30.0);
        assert_eq!(outbox.pending_len(), 0);
    }

    #[test]
    fn update_pending_only_touches_waiting_requests() {
        let outbox = WriteOutbox::new();
        assert!(!outbox.update_pending(request("a", VcpFeature::Brightness, 5.0)));
        outbox.post(request("a", VcpFeature::Brightness, 10.0));
        assert!(outbox.update_pending(request("a", VcpFeature::Brightness, 15.0)));
        assert_eq!(outbox.take_all()[0].value, 15.0);
    }

    #[test]
    fn closed_outbox_does_not_block() {
        let outbox = WriteOutbox::new();
        outbox.close();
        assert!(outbox.wait_and_take(Duration::from_secs(30)).is_empty());
    }
}
