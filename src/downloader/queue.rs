//! Shared piece work queue.
//!
//! Fully seeded before any worker starts and closed to new work from then
//! on: workers treat an empty, nothing-in-flight queue as "done". Items are
//! re-offered when the claiming worker could not deliver (peer lacked the
//! piece, or the session died mid-piece). A per-index set of peers that
//! declined bounds the "peer lacks piece" path: once every peer has
//! declined an index, the item is dropped instead of circulating forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::PieceWork;

/// What happened to an item a peer declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipOutcome {
    /// Re-offered; some other peer may still hold the piece.
    Requeued,
    /// Re-offered, but this peer had already declined it once. The caller
    /// should back off before claiming again so it does not spin on an
    /// item only other workers can serve.
    Revisited,
    /// Every peer has declined this index; the item is gone and will show
    /// up as a failed piece.
    Dropped,
}

pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    num_peers: usize,
}

struct QueueState {
    items: VecDeque<PieceWork>,
    in_flight: usize,
    skips: HashMap<usize, HashSet<SocketAddr>>,
}

impl WorkQueue {
    pub(crate) fn new(items: Vec<PieceWork>, num_peers: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: items.into(),
                in_flight: 0,
                skips: HashMap::new(),
            }),
            notify: Notify::new(),
            num_peers: num_peers.max(1),
        }
    }

    /// Take the next work item. Waits while the queue is empty but other
    /// workers still hold items that may be re-offered; returns `None` once
    /// the queue is drained (empty with nothing in flight).
    pub(crate) async fn claim(&self) -> Option<PieceWork> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before inspecting state, so a release
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(work) = state.items.pop_front() {
                    state.in_flight += 1;
                    return Some(work);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// The claimed item was delivered.
    pub(crate) fn complete(&self, _work: &PieceWork) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// The claiming worker cannot continue (session failure); offer the
    /// item to another worker.
    pub(crate) fn requeue(&self, work: PieceWork) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.items.push_back(work);
        drop(state);
        self.notify.notify_waiters();
    }

    /// The claiming peer does not hold this piece. Re-offers the item
    /// unless every distinct peer has declined it.
    pub(crate) fn skip(&self, work: PieceWork, peer: SocketAddr) -> SkipOutcome {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        let (declined_by, first_decline) = {
            let skips = state.skips.entry(work.index).or_default();
            let first = skips.insert(peer);
            (skips.len(), first)
        };

        let outcome = if declined_by >= self.num_peers {
            SkipOutcome::Dropped
        } else {
            state.items.push_back(work);
            if first_decline {
                SkipOutcome::Requeued
            } else {
                SkipOutcome::Revisited
            }
        };
        drop(state);
        self.notify.notify_waiters();
        outcome
    }

    /// The piece failed past its retry budget; it is not re-queued.
    pub(crate) fn abandon(&self, _work: &PieceWork) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn work(index: usize) -> PieceWork {
        PieceWork {
            index,
            hash: [0u8; 20],
            length: 16384,
        }
    }

    fn queue(count: usize, num_peers: usize) -> WorkQueue {
        WorkQueue::new((0..count).map(work).collect(), num_peers)
    }

    #[tokio::test]
    async fn drains_after_all_completed() {
        let q = queue(2, 2);
        let a = q.claim().await.unwrap();
        let b = q.claim().await.unwrap();
        q.complete(&a);
        q.complete(&b);
        assert!(q.claim().await.is_none());
    }

    #[tokio::test]
    async fn requeued_item_is_claimable_again() {
        let q = queue(1, 2);
        let item = q.claim().await.unwrap();
        q.requeue(item);
        let again = q.claim().await.unwrap();
        assert_eq!(again.index, 0);
        q.complete(&again);
        assert!(q.claim().await.is_none());
    }

    #[tokio::test]
    async fn skip_drops_after_each_peer_declined() {
        let q = queue(1, 2);
        let peer_a: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        let peer_b: SocketAddr = "127.0.0.1:1002".parse().unwrap();

        let item = q.claim().await.unwrap();
        assert_eq!(q.skip(item, peer_a), SkipOutcome::Requeued);

        let item = q.claim().await.unwrap();
        assert_eq!(q.skip(item, peer_b), SkipOutcome::Dropped);

        assert!(q.claim().await.is_none());
    }

    #[tokio::test]
    async fn repeated_skip_by_the_same_peer_does_not_drop() {
        let q = queue(1, 2);
        let peer_a: SocketAddr = "127.0.0.1:1001".parse().unwrap();

        let item = q.claim().await.unwrap();
        assert_eq!(q.skip(item, peer_a), SkipOutcome::Requeued);

        // The same peer declining again must not count as a second peer.
        let item = q.claim().await.unwrap();
        assert_eq!(q.skip(item, peer_a), SkipOutcome::Revisited);

        let item = q.claim().await.unwrap();
        assert_eq!(item.index, 0, "item stays claimable for other peers");
        q.complete(&item);
        assert!(q.claim().await.is_none());
    }

    #[tokio::test]
    async fn waiting_claimer_wakes_on_requeue() {
        let q = Arc::new(queue(1, 2));
        let held = q.claim().await.unwrap();

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.claim().await })
        };

        // Give the waiter time to block on the empty queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.requeue(held);

        let claimed = waiter.await.unwrap().unwrap();
        assert_eq!(claimed.index, 0);
        q.complete(&claimed);
    }

    #[tokio::test]
    async fn waiting_claimer_wakes_on_drain() {
        let q = Arc::new(queue(1, 2));
        let held = q.claim().await.unwrap();

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.claim().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.complete(&held);

        assert!(waiter.await.unwrap().is_none());
    }
}
