// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-peer barriers.
//!
//! The server opens a barrier by broadcasting BARRIER_REQUEST with a
//! nonce; each client acknowledges with BARRIER_ACK_LOCK when its
//! application reaches the barrier and then blocks until
//! BARRIER_UNLOCK for the same nonce. The server releases everyone
//! once all acknowledgements are in.

use crate::protocol::wire::BarrierNonce;
use crate::protocol::{Details, Envelope, MessageType, Outbound};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default time a barrier participant waits.
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side barrier bookkeeping, fed by the reader task.
#[derive(Default)]
pub struct BarrierState {
    requests: Mutex<VecDeque<u32>>,
    unlocks: Mutex<HashSet<u32>>,
    notify: Notify,
}

impl BarrierState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(&self, id: u32) {
        self.requests.lock().push_back(id);
        self.notify.notify_waiters();
    }

    pub fn on_unlock(&self, id: u32) {
        self.unlocks.lock().insert(id);
        self.notify.notify_waiters();
    }

    /// Drop all queued state. Used on disconnect and on protocol
    /// confusion.
    pub fn reset(&self) {
        self.requests.lock().clear();
        self.unlocks.lock().clear();
        self.notify.notify_waiters();
    }

    /// Enter the barrier: take the oldest queued request, acknowledge
    /// it and wait for its unlock. Returns false on timeout or when
    /// the unlock stream does not line up with the acknowledged
    /// nonce, after resetting the barrier state.
    pub async fn barrier(&self, outbound: &Outbound, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let id = loop {
            // Register for wakeups before checking, so a notify
            // between the check and the await is not lost.
            let notified = self.notify.notified();
            if let Some(id) = self.requests.lock().pop_front() {
                break id;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("barrier timed out waiting for a request");
                return false;
            }
        };

        let ack = Envelope::new(
            MessageType::BarrierAckLock,
            crate::protocol::ObjectType::Global,
            Details::Barrier(BarrierNonce { request_id: id }),
        );
        if outbound.send(ack).is_err() {
            self.reset();
            return false;
        }

        loop {
            let notified = self.notify.notified();
            {
                let mut unlocks = self.unlocks.lock();
                if unlocks.remove(&id) {
                    return true;
                }
                // An unlock that cannot belong to this exchange means
                // the sequencing broke; start over rather than guess.
                if !unlocks.is_empty() {
                    warn!(expected = id, "unexpected barrier unlock, resetting");
                    drop(unlocks);
                    self.reset();
                    return false;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(nonce = id, "barrier timed out waiting for unlock");
                self.reset();
                return false;
            }
        }
    }
}

/// Server-side acknowledgement collection.
#[derive(Default)]
pub struct BarrierCoordinator {
    next_id: Mutex<u32>,
    acks: Mutex<HashMap<u32, HashSet<u64>>>,
    notify: Notify,
}

impl BarrierCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nonce for a new barrier round; never zero.
    pub fn allocate(&self) -> u32 {
        let mut next = self.next_id.lock();
        *next = if *next >= u32::MAX - 1 { 1 } else { *next + 1 };
        self.acks.lock().insert(*next, HashSet::new());
        *next
    }

    pub fn on_ack(&self, id: u32, connection: u64) {
        match self.acks.lock().get_mut(&id) {
            Some(set) => {
                set.insert(connection);
            }
            None => {
                warn!(nonce = id, connection, "ack for unknown barrier");
                return;
            }
        }
        self.notify.notify_waiters();
    }

    /// Wait until every listed connection acknowledged nonce `id`.
    pub async fn wait_for_acks(
        &self,
        id: u32,
        participants: &HashSet<u64>,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let acks = self.acks.lock();
                if let Some(set) = acks.get(&id) {
                    if participants.is_subset(set) {
                        return true;
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Drop the round's bookkeeping.
    pub fn finish(&self, id: u32) {
        self.acks.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use std::sync::Arc;

    fn ack_nonce(envelope: &Envelope) -> u32 {
        assert_eq!(envelope.message_type, MessageType::BarrierAckLock);
        match &envelope.details {
            Details::Barrier(nonce) => nonce.request_id,
            other => panic!("wrong details: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_matched_pair_returns_immediately() {
        let state = BarrierState::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        state.on_request(7);
        state.on_unlock(7);
        assert!(state.barrier(&tx, Duration::from_millis(100)).await);
        assert_eq!(ack_nonce(&rx.try_recv().unwrap()), 7);
    }

    #[tokio::test]
    async fn test_barrier_waits_for_unlock() {
        let state = Arc::new(BarrierState::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        state.on_request(3);
        let waiter = Arc::clone(&state);
        let handle =
            tokio::spawn(async move { waiter.barrier(&tx, Duration::from_secs(2)).await });

        // The ack goes out before the unlock arrives.
        let ack = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack_nonce(&ack), 3);

        state.on_unlock(3);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_barrier_times_out_without_request() {
        let state = BarrierState::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(!state.barrier(&tx, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_barrier_times_out_without_unlock() {
        let state = BarrierState::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.on_request(5);
        assert!(!state.barrier(&tx, Duration::from_millis(20)).await);
        // Timed-out state is cleared.
        assert!(state.unlocks.lock().is_empty());
        assert!(state.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_unlock_resets_and_fails() {
        let state = BarrierState::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.on_request(5);
        state.on_unlock(99);
        assert!(!state.barrier(&tx, Duration::from_millis(100)).await);
        assert!(state.unlocks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_requests_served_oldest_first() {
        let state = BarrierState::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.on_request(1);
        state.on_request(2);
        state.on_unlock(1);

        assert!(state.barrier(&tx, Duration::from_millis(100)).await);
        assert_eq!(ack_nonce(&rx.try_recv().unwrap()), 1);
        // The second request is still queued.
        assert_eq!(state.requests.lock().front(), Some(&2));
    }

    #[tokio::test]
    async fn test_coordinator_collects_acks() {
        let coordinator = Arc::new(BarrierCoordinator::new());
        let nonce = coordinator.allocate();
        let participants: HashSet<u64> = [10, 20].into_iter().collect();

        let waiter = Arc::clone(&coordinator);
        let wanted = participants.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_acks(nonce, &wanted, Duration::from_secs(2))
                .await
        });

        coordinator.on_ack(nonce, 10);
        coordinator.on_ack(nonce, 20);
        assert!(handle.await.unwrap());
        coordinator.finish(nonce);
    }

    #[tokio::test]
    async fn test_coordinator_times_out_on_missing_ack() {
        let coordinator = BarrierCoordinator::new();
        let nonce = coordinator.allocate();
        let participants: HashSet<u64> = [10, 20].into_iter().collect();
        coordinator.on_ack(nonce, 10);
        assert!(
            !coordinator
                .wait_for_acks(nonce, &participants, Duration::from_millis(20))
                .await
        );
    }
}
