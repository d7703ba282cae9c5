//! Serialized client request queue.
//!
//! The queue admits one request at a time: the next request is released only
//! after the previous one completed. Admission hands out an
//! [`AdmissionGuard`]; giving it back through [`RequestQueue::release`] is
//! the only way to open the next slot, so losing track of a completion is a
//! type error rather than a hang. The protocol assigns per-client ordering
//! to proposals; concurrent in-flight proposals from one client would
//! interleave at the leader and break the client's observed order.

use std::collections::VecDeque;

use paxkit_core::SendError;
use tokio::sync::oneshot;

/// One queued request. The reply channel fires exactly once.
pub(crate) struct PendingRequest {
    pub workload: Vec<u8>,
    pub retries: u32,
    pub reply: oneshot::Sender<Result<Vec<u8>, SendError>>,
}

/// Token proving a request was admitted.
pub(crate) struct AdmissionGuard {
    _private: (),
}

#[derive(Default)]
pub(crate) struct RequestQueue {
    waiting: VecDeque<PendingRequest>,
    in_flight: bool,
}

impl RequestQueue {
    pub(crate) fn push(&mut self, request: PendingRequest) {
        self.waiting.push_back(request);
    }

    /// Admit the next request, if none is in flight.
    pub(crate) fn admit(&mut self) -> Option<(PendingRequest, AdmissionGuard)> {
        if self.in_flight {
            return None;
        }
        let request = self.waiting.pop_front()?;
        self.in_flight = true;
        Some((request, AdmissionGuard { _private: () }))
    }

    /// Complete the admitted request, opening the next slot.
    pub(crate) fn release(&mut self, guard: AdmissionGuard) {
        let AdmissionGuard { _private: () } = guard;
        self.in_flight = false;
    }

    /// Take everything still waiting; used to drain on shutdown.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PendingRequest> + '_ {
        self.waiting.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tag: u8) -> (PendingRequest, oneshot::Receiver<Result<Vec<u8>, SendError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                workload: vec![tag],
                retries: 0,
                reply: tx,
            },
            rx,
        )
    }

    #[test]
    fn one_admission_at_a_time_in_submission_order() {
        let mut queue = RequestQueue::default();
        let (first, _rx1) = request(1);
        let (second, _rx2) = request(2);
        queue.push(first);
        queue.push(second);

        let (admitted, guard) = queue.admit().unwrap();
        assert_eq!(admitted.workload, vec![1]);
        assert!(queue.admit().is_none(), "second held back while in flight");

        queue.release(guard);
        let (admitted, _guard) = queue.admit().unwrap();
        assert_eq!(admitted.workload, vec![2]);
    }

    #[test]
    fn empty_queue_admits_nothing() {
        let mut queue = RequestQueue::default();
        assert!(queue.admit().is_none());
    }
}
