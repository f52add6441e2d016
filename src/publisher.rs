//! Live tally updates for connected viewers
//!
//! Subscribers are a registry of bounded channels. A broadcast never waits on
//! a subscriber: a full channel drops that update for that subscriber only,
//! and a closed channel unregisters it. Every new subscriber receives the
//! current snapshot first, so nobody starts from a stale view.
//!
//! The current snapshot only advances through broadcasts made in this
//! process. Commits made by other processes sharing the store reach it when
//! a consumer refreshes from the store, or when `PipelineHandle::subscribe`
//! reloads it for a new viewer.

use crate::types::{TallySnapshot, UpdateMessage};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identifies one live subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<TallySnapshot>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next snapshot; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<Arc<TallySnapshot>> {
        self.receiver.recv().await
    }

    /// Next snapshot if one is already buffered
    pub fn try_recv(&mut self) -> Option<Arc<TallySnapshot>> {
        self.receiver.try_recv().ok()
    }

    /// Next snapshot in wire form
    pub async fn recv_message(&mut self) -> Option<UpdateMessage> {
        self.recv()
            .await
            .map(|snapshot| UpdateMessage::from_snapshot(&snapshot))
    }
}

/// What happened to one broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Subscribers whose buffer was full
    pub dropped: usize,
    /// Subscribers found disconnected and removed
    pub disconnected: usize,
    /// The snapshot was not newer than the current one and was ignored
    pub stale: bool,
}

struct Registry {
    current: Arc<TallySnapshot>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<TallySnapshot>>>,
    closed: bool,
}

pub struct UpdatePublisher {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    buffer: usize,
    dropped_total: AtomicU64,
}

impl UpdatePublisher {
    pub fn new(initial: TallySnapshot, buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry {
                current: Arc::new(initial),
                subscribers: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; the current snapshot is already queued on return
    pub fn subscribe(&self) -> Result<Subscription> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.buffer);

        let mut registry = self.lock()?;
        if registry.closed {
            return Err(Error::Shutdown);
        }
        sender
            .try_send(registry.current.clone())
            .map_err(|_| Error::internal("fresh subscriber channel rejected snapshot"))?;
        registry.subscribers.insert(id, sender);

        tracing::debug!(subscriber = id.0, "Subscriber connected");
        Ok(Subscription { id, receiver })
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<bool> {
        let removed = self.lock()?.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id.0, "Subscriber disconnected");
        }
        Ok(removed)
    }

    /// Push a snapshot to every subscriber without waiting on any of them
    ///
    /// Snapshots that are not newer than the last broadcast one are ignored,
    /// so out-of-order publication from several consumers cannot move a
    /// viewer backwards.
    pub fn broadcast(&self, snapshot: TallySnapshot) -> Result<BroadcastReport> {
        let mut registry = self.lock()?;
        if registry.closed {
            return Err(Error::Shutdown);
        }
        let mut report = BroadcastReport::default();

        if !snapshot.is_newer_than(&registry.current) {
            report.stale = true;
            return Ok(report);
        }

        let snapshot = Arc::new(snapshot);
        registry.current = snapshot.clone();

        let mut closed = Vec::new();
        for (id, sender) in &registry.subscribers {
            match sender.try_send(snapshot.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped += 1,
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in &closed {
            registry.subscribers.remove(id);
        }
        report.disconnected = closed.len();

        if report.dropped > 0 {
            self.dropped_total
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            tracing::debug!(
                version = snapshot.version,
                dropped = report.dropped,
                "Slow subscribers skipped an update"
            );
        }

        Ok(report)
    }

    /// End every subscription and refuse new subscribers and broadcasts
    ///
    /// Snapshots already buffered stay readable; each stream then ends.
    /// Returns how many subscribers were connected.
    pub fn close(&self) -> Result<usize> {
        let mut registry = self.lock()?;
        registry.closed = true;
        let connected = registry.subscribers.len();
        registry.subscribers.clear();
        tracing::debug!(connected, "Publisher closed");
        Ok(connected)
    }

    /// Last snapshot broadcast by this process
    pub fn current(&self) -> Result<Arc<TallySnapshot>> {
        Ok(self.lock()?.current.clone())
    }

    pub fn subscriber_count(&self) -> Result<usize> {
        Ok(self.lock()?.subscribers.len())
    }

    /// Updates dropped on backpressure since startup
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| Error::internal("Publisher registry lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandidateSet;

    fn empty() -> TallySnapshot {
        TallySnapshot::empty(&CandidateSet::new(["A", "B"]).unwrap())
    }

    #[tokio::test]
    async fn test_subscriber_gets_current_snapshot_first() {
        let publisher = UpdatePublisher::new(empty(), 4);
        let one = empty().with_vote("A").unwrap();
        publisher.broadcast(one.clone()).unwrap();

        let mut late = publisher.subscribe().unwrap();
        let first = late.recv().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.count("A"), 1);

        let two = one.with_vote("B").unwrap();
        publisher.broadcast(two).unwrap();
        assert_eq!(late.recv().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_instead_of_blocking() {
        let publisher = UpdatePublisher::new(empty(), 1);
        let mut slow = publisher.subscribe().unwrap(); // buffer already holds the snapshot

        let mut snapshot = empty();
        for _ in 0..5 {
            snapshot = snapshot.with_vote("A").unwrap();
            let report = publisher.broadcast(snapshot.clone()).unwrap();
            assert_eq!(report.dropped, 1);
        }
        assert_eq!(publisher.dropped_total(), 5);

        // Still registered, resumes with the next broadcast once drained
        assert_eq!(slow.try_recv().unwrap().version, 0);
        snapshot = snapshot.with_vote("B").unwrap();
        let report = publisher.broadcast(snapshot).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(slow.try_recv().unwrap().version, 6);
    }

    #[tokio::test]
    async fn test_disconnected_subscribers_are_removed() {
        let publisher = UpdatePublisher::new(empty(), 4);
        let gone = publisher.subscribe().unwrap();
        let _kept = publisher.subscribe().unwrap();
        drop(gone);

        let report = publisher.broadcast(empty().with_vote("A").unwrap()).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.disconnected, 1);
        assert_eq!(publisher.subscriber_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_broadcast_ignored_and_unsubscribe() {
        let publisher = UpdatePublisher::new(empty(), 4);
        let two = empty().with_vote("A").and_then(|s| s.with_vote("A")).unwrap();
        publisher.broadcast(two).unwrap();

        let report = publisher.broadcast(empty().with_vote("B").unwrap()).unwrap();
        assert!(report.stale);
        assert_eq!(publisher.current().unwrap().count("A"), 2);

        let mut sub = publisher.subscribe().unwrap();
        assert!(publisher.unsubscribe(sub.id()).unwrap());
        assert!(!publisher.unsubscribe(sub.id()).unwrap());
        assert_eq!(sub.recv().await.unwrap().version, 2);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_refuses_new_work() {
        let publisher = UpdatePublisher::new(empty(), 4);
        let mut sub = publisher.subscribe().unwrap();

        assert_eq!(publisher.close().unwrap(), 1);
        assert_eq!(publisher.subscriber_count().unwrap(), 0);
        assert_eq!(sub.recv().await.unwrap().version, 0);
        assert!(sub.recv().await.is_none());

        assert!(matches!(publisher.subscribe(), Err(Error::Shutdown)));
        assert!(matches!(
            publisher.broadcast(empty().with_vote("A").unwrap()),
            Err(Error::Shutdown)
        ));
        assert_eq!(publisher.current().unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_wire_message_verifies() {
        let publisher = UpdatePublisher::new(empty().with_vote("B").unwrap(), 4);
        let mut sub = publisher.subscribe().unwrap();
        let message = sub.recv_message().await.unwrap();
        assert!(message.verify());
        assert_eq!(message.snapshot.count("B"), 1);
    }
}
