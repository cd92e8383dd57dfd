//! Fan-out of status diffs to subscribers.
//!
//! Every subscriber owns a bounded backlog of pending diffs. Publishing
//! never blocks the manager: when a backlog is full, the two oldest
//! diffs are folded into one (see [`Diff::merge`]) instead of dropping
//! anything. A subscriber that consumes everything it was handed
//! therefore always reconstructs some snapshot the manager actually
//! held, just possibly skipping intermediate ones.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::diff::Diff;

/// Default per-subscriber backlog capacity.
pub const DEFAULT_BACKLOG: usize = 8;

struct Backlog {
    pending: VecDeque<Diff>,
    /// Set by `Subscription::close`; pending diffs are discarded.
    closed: bool,
    /// Set by the hub when the manager exits; pending diffs drain.
    finished: bool,
}

struct Shared {
    backlog: Mutex<Backlog>,
    notify: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            backlog: Mutex::new(Backlog {
                pending: VecDeque::new(),
                closed: false,
                finished: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queues a diff, coalescing the oldest entries when the backlog is
    /// full. Returns false once the subscription is closed.
    fn push(&self, diff: Diff, capacity: usize) -> bool {
        {
            let mut backlog = self.backlog.lock().unwrap();
            if backlog.closed {
                return false;
            }
            if backlog.pending.len() >= capacity {
                let oldest = backlog.pending.pop_front().unwrap();
                match backlog.pending.pop_front() {
                    Some(next) => {
                        backlog.pending.push_front(oldest.merge(next));
                        backlog.pending.push_back(diff);
                    }
                    // Capacity of one: fold straight into the newcomer.
                    None => backlog.pending.push_back(oldest.merge(diff)),
                }
            } else {
                backlog.pending.push_back(diff);
            }
        }
        self.notify.notify_one();
        true
    }

    fn finish(&self) {
        self.backlog.lock().unwrap().finished = true;
        self.notify.notify_one();
    }
}

/// A live subscription to status diffs.
///
/// Obtained from the manager handle. Dropping the subscription closes
/// it.
pub struct Subscription {
    id: u64,
    shared: Arc<Shared>,
    closer: mpsc::UnboundedSender<u64>,
}

impl Subscription {
    /// Receives the next diff.
    ///
    /// Returns `None` once the subscription is closed or the manager
    /// has exited and the backlog is drained.
    pub async fn recv(&self) -> Option<Diff> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut backlog = self.shared.backlog.lock().unwrap();
                if let Some(diff) = backlog.pending.pop_front() {
                    return Some(diff);
                }
                if backlog.closed || backlog.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the subscription and releases its backlog. Idempotent.
    pub fn close(&self) {
        {
            let mut backlog = self.shared.backlog.lock().unwrap();
            if backlog.closed {
                return;
            }
            backlog.closed = true;
            backlog.pending.clear();
        }
        self.shared.notify.notify_one();
        // The manager may already be gone; then there is nothing left
        // to unregister from.
        let _ = self.closer.send(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Registry of live subscriptions, owned by the manager loop.
pub(crate) struct SubscriptionHub {
    subscribers: HashMap<u64, Arc<Shared>>,
    next_id: u64,
    capacity: usize,
    closed_tx: mpsc::UnboundedSender<u64>,
}

impl SubscriptionHub {
    /// Creates a hub whose subscriptions report their closure on
    /// `closed_tx`.
    pub(crate) fn new(capacity: usize, closed_tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 0,
            capacity,
            closed_tx,
        }
    }

    /// Registers a new subscriber, seeding its backlog with `initial`.
    pub(crate) fn subscribe(&mut self, initial: Option<Diff>) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        let shared = Arc::new(Shared::new());
        if let Some(diff) = initial {
            shared.push(diff, self.capacity);
        }
        self.subscribers.insert(id, Arc::clone(&shared));
        debug!(subscriber = id, "registered status subscriber");
        Subscription {
            id,
            shared,
            closer: self.closed_tx.clone(),
        }
    }

    /// Queues a diff for every live subscriber, dropping closed ones.
    pub(crate) fn publish(&mut self, diff: &Diff) {
        let capacity = self.capacity;
        self.subscribers
            .retain(|_, shared| shared.push(diff.clone(), capacity));
    }

    /// Unregisters a subscriber that reported its closure.
    pub(crate) fn unsubscribe(&mut self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "unregistered status subscriber");
        }
    }

    /// Lets every remaining subscriber drain and terminate.
    pub(crate) fn finish(&mut self) {
        for shared in self.subscribers.values() {
            shared.finish();
        }
        self.subscribers.clear();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PortStatus;
    use std::collections::BTreeMap;

    fn status(local: u16, served: bool) -> PortStatus {
        PortStatus {
            local_port: local,
            global_port: local,
            served,
            exposed: None,
        }
    }

    fn added(local: u16) -> Diff {
        Diff {
            added: vec![status(local, false)],
            ..Diff::default()
        }
    }

    fn apply(snapshot: &mut BTreeMap<u16, PortStatus>, diff: &Diff) {
        for s in diff.added.iter().chain(diff.updated.iter()) {
            snapshot.insert(s.local_port, s.clone());
        }
        for port in &diff.removed {
            snapshot.remove(port);
        }
    }

    fn hub(capacity: usize) -> SubscriptionHub {
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        SubscriptionHub::new(capacity, closed_tx)
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let mut hub = hub(DEFAULT_BACKLOG);
        let sub = hub.subscribe(None);

        hub.publish(&added(8080));
        hub.publish(&added(9229));

        assert_eq!(sub.recv().await.unwrap(), added(8080));
        assert_eq!(sub.recv().await.unwrap(), added(9229));
    }

    #[tokio::test]
    async fn test_initial_diff_is_delivered_first() {
        let mut hub = hub(DEFAULT_BACKLOG);
        let sub = hub.subscribe(Some(added(3000)));
        hub.publish(&added(8080));

        assert_eq!(sub.recv().await.unwrap(), added(3000));
        assert_eq!(sub.recv().await.unwrap(), added(8080));
    }

    #[tokio::test]
    async fn test_overflow_coalesces_instead_of_dropping() {
        let mut hub = hub(2);
        let sub = hub.subscribe(None);

        let diffs = [
            added(1000),
            added(2000),
            Diff {
                updated: vec![status(1000, true)],
                ..Diff::default()
            },
            Diff {
                removed: vec![2000],
                ..Diff::default()
            },
        ];
        let mut want = BTreeMap::new();
        for diff in &diffs {
            apply(&mut want, diff);
            hub.publish(diff);
        }

        // Fewer deliveries than publishes, but the replayed state must
        // match the publisher's final state exactly.
        let pending = sub.shared.backlog.lock().unwrap().pending.len();
        assert!(pending <= 2);
        let mut got = BTreeMap::new();
        for _ in 0..pending {
            apply(&mut got, &sub.recv().await.unwrap());
        }
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reports_once() {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let mut hub = SubscriptionHub::new(DEFAULT_BACKLOG, closed_tx);
        let sub = hub.subscribe(None);

        sub.close();
        sub.close();
        assert!(sub.recv().await.is_none());

        let id = closed_rx.recv().await.unwrap();
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_drops_closed_subscribers() {
        let mut hub = hub(DEFAULT_BACKLOG);
        let sub = hub.subscribe(None);
        sub.close();

        hub.publish(&added(8080));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_finish_drains_then_terminates() {
        let mut hub = hub(DEFAULT_BACKLOG);
        let sub = hub.subscribe(None);

        hub.publish(&added(8080));
        hub.finish();

        assert_eq!(sub.recv().await.unwrap(), added(8080));
        assert!(sub.recv().await.is_none());
    }
}
