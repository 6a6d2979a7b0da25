//! Server-Sent Events broker.
//!
//! The broker fans named events out to every connected SSE client. It is a
//! single-writer hub: one spawned task owns the set of subscribers and
//! processes every request (register, unregister, broadcast, count) strictly
//! in the order it was sent.
//!
//! # Architecture
//!
//! - [`Broker`] - Cheap-to-clone handle used by publishers and the SSE endpoint
//! - [`Subscription`] - One subscriber's bounded event queue; dropping it
//!   unsubscribes
//! - [`Event`] - A named event with an opaque, pre-serialized payload
//!
//! Each subscriber has its own bounded queue (capacity
//! [`DEFAULT_QUEUE_CAPACITY`]). The broker task only ever uses `try_send`, so a
//! slow client never stalls other clients or publishers: when a queue is full
//! that subscriber misses the event.
//!
//! # Example
//!
//! ```rust
//! use ngp_server::broker::Broker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Broker::new();
//!     let mut subscription = broker.subscribe();
//!
//!     broker.broadcast("stats-updated", r#"{"trigger":"manual"}"#);
//!
//!     let event = subscription.recv().await.unwrap();
//!     assert_eq!(event.event_type, "stats-updated");
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Default capacity of each subscriber's queue.
///
/// Events published while a subscriber already has this many undelivered
/// events are dropped for that subscriber only.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// A named event delivered to SSE clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event name, sent as the SSE `event:` field. Names containing line
    /// breaks are rejected by [`Broker::publish`].
    pub event_type: String,

    /// Payload, sent as the SSE `data:` field. The broker never inspects it.
    pub data: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }
}

/// Identifier of a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Requests processed by the broker task.
enum Command {
    Register {
        id: SubscriberId,
        queue: mpsc::Sender<Event>,
    },
    Unregister(SubscriberId),
    Broadcast(Event),
    Count(oneshot::Sender<usize>),
    DisconnectAll,
}

/// Handle to the broker task.
///
/// Cloning is cheap; all clones talk to the same task. The task exits once
/// every `Broker` and [`Subscription`] has been dropped.
#[derive(Clone)]
pub struct Broker {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl Broker {
    /// Starts a broker with the default per-subscriber queue capacity.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Starts a broker whose subscriber queues hold `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (commands, inbox) = mpsc::unbounded_channel();
        tokio::spawn(run(inbox));
        debug!(queue_capacity = capacity, "Started event broker");

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: capacity,
        }
    }

    /// Registers a new subscriber.
    ///
    /// Always succeeds. The returned [`Subscription`] yields events published
    /// after the registration is processed, and ends when it is unsubscribed.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, receiver) = mpsc::channel(self.queue_capacity);

        // If the task is gone the queue sender is dropped here and the
        // subscription simply ends immediately.
        let _ = self.commands.send(Command::Register { id, queue });

        Subscription {
            id,
            receiver,
            commands: self.commands.clone(),
            active: true,
        }
    }

    /// Removes a subscriber by id. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unregister(id));
    }

    /// Publishes an event to every registered subscriber.
    ///
    /// Never blocks and never fails. Subscribers whose queue is full miss
    /// this event.
    pub fn broadcast(&self, event_type: impl Into<String>, data: impl Into<String>) {
        self.publish(Event::new(event_type, data));
    }

    /// Publishes an already built [`Event`].
    ///
    /// An event whose name contains `\n` or `\r` cannot be written as an SSE
    /// `event:` line; it is logged and dropped.
    pub fn publish(&self, event: Event) {
        if event.event_type.contains(['\n', '\r']) {
            warn!(event_type = ?event.event_type, "Dropping event with line break in its name");
            return;
        }
        trace!(event_type = %event.event_type, "Queueing broadcast");
        let _ = self.commands.send(Command::Broadcast(event));
    }

    /// Removes every subscriber, ending all open streams.
    ///
    /// Used on shutdown so long-lived SSE responses complete. Subscribers
    /// registered afterwards are unaffected.
    pub fn disconnect_all(&self) {
        let _ = self.commands.send(Command::DisconnectAll);
    }

    /// Returns the number of registered subscribers.
    ///
    /// The answer reflects every request sent before this call, so a
    /// `subscribe` followed by `client_count` always counts that subscriber.
    /// Returns 0 if the broker task is no longer running.
    pub async fn client_count(&self) -> usize {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(Command::Count(reply)).is_err() {
            return 0;
        }
        answer.await.unwrap_or(0)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("queue_capacity", &self.queue_capacity)
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

/// The broker task. Owns the subscriber set for its whole life.
async fn run(mut inbox: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers: HashMap<SubscriberId, mpsc::Sender<Event>> = HashMap::new();

    while let Some(command) = inbox.recv().await {
        match command {
            Command::Register { id, queue } => {
                subscribers.insert(id, queue);
                debug!(subscriber_id = %id, clients = subscribers.len(), "Client connected");
            }
            Command::Unregister(id) => {
                // Dropping the sender closes the queue; the receiver drains
                // what is left and then sees the end of the stream.
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber_id = %id, clients = subscribers.len(), "Client disconnected");
                }
            }
            Command::Broadcast(event) => {
                subscribers.retain(|id, queue| match queue.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        trace!(subscriber_id = %id, event_type = %event.event_type, "Queue full, dropping event");
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(subscriber_id = %id, "Subscriber went away, removing");
                        false
                    }
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(subscribers.len());
            }
            Command::DisconnectAll => {
                debug!(clients = subscribers.len(), "Disconnecting all clients");
                subscribers.clear();
            }
        }
    }

    debug!("Event broker stopped");
}

/// A live subscription to the broker.
///
/// Dropping the subscription unsubscribes it, so a connection handler that
/// is cancelled or panics still releases its slot.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Event>,
    commands: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl Subscription {
    /// This subscription's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription has been removed from the broker
    /// and every event queued before that has been received.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Deregisters this subscription. Calling it more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if std::mem::take(&mut self.active) {
            let _ = self.commands.send(Command::Unregister(self.id));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Drains a subscription until its queue is closed.
    async fn drain(subscription: &mut Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("subscription should close")
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn new_broker_has_no_clients() {
        let broker = Broker::new();
        assert_eq!(broker.client_count().await, 0);
    }

    #[tokio::test]
    async fn subscribe_is_counted_immediately() {
        let broker = Broker::new();
        let _a = broker.subscribe();
        let _b = broker.subscribe();
        assert_eq!(broker.client_count().await, 2);
    }

    #[tokio::test]
    async fn subscription_ids_are_unique() {
        let broker = Broker::new();
        let a = broker.subscribe();
        let b = broker.subscribe();
        assert_ne!(a.id(), b.id());
    }

    /// Every subscriber receives a broadcast event.
    #[tokio::test]
    async fn broadcast_fans_out_to_all_subscribers() {
        let broker = Broker::new();
        let mut subscriptions: Vec<_> = (0..3).map(|_| broker.subscribe()).collect();

        broker.broadcast("stats-updated", "{}");

        for subscription in &mut subscriptions {
            let event = subscription.recv().await.unwrap();
            assert_eq!(event, Event::new("stats-updated", "{}"));
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe();

        for i in 0..5 {
            broker.broadcast("tick", i.to_string());
        }

        for i in 0..5 {
            assert_eq!(subscription.recv().await.unwrap().data, i.to_string());
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_harmless() {
        let broker = Broker::new();
        broker.broadcast("nobody", "listening");
        assert_eq!(broker.client_count().await, 0);
    }

    /// Two subscribers, one unsubscribes: the count drops to one and only the
    /// remaining subscriber sees later events.
    #[tokio::test]
    async fn unsubscribe_removes_only_that_subscriber() {
        let broker = Broker::new();
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();

        first.unsubscribe();
        assert_eq!(broker.client_count().await, 1);

        broker.broadcast("after", "x");
        assert_eq!(second.recv().await.unwrap().event_type, "after");
        assert!(drain(&mut first).await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe();
        let id = subscription.id();

        subscription.unsubscribe();
        subscription.unsubscribe();
        broker.unsubscribe(id);
        drop(subscription);

        assert_eq!(broker.client_count().await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_stream() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe();

        subscription.unsubscribe();

        let next = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("recv should not hang");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn events_queued_before_unsubscribe_are_still_delivered() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe();

        broker.broadcast("before", "1");
        subscription.unsubscribe();
        broker.broadcast("after", "2");

        let events = drain(&mut subscription).await;
        assert_eq!(events, vec![Event::new("before", "1")]);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let broker = Broker::new();
        let subscription = broker.subscribe();
        assert_eq!(broker.client_count().await, 1);

        drop(subscription);
        assert_eq!(broker.client_count().await, 0);
    }

    /// With a queue of one, two back-to-back broadcasts deliver exactly one.
    #[tokio::test]
    async fn full_queue_drops_events_for_slow_subscriber() {
        let broker = Broker::with_queue_capacity(1);
        let mut subscription = broker.subscribe();

        broker.broadcast("first", "1");
        broker.broadcast("second", "2");
        // Ordered after both broadcasts.
        assert_eq!(broker.client_count().await, 1);

        assert_eq!(subscription.try_recv(), Some(Event::new("first", "1")));
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let broker = Broker::with_queue_capacity(2);
        let _stalled = broker.subscribe();
        let mut active = broker.subscribe();

        for i in 0..6 {
            broker.broadcast("tick", i.to_string());
            assert_eq!(active.recv().await.unwrap().data, i.to_string());
        }
        assert_eq!(broker.client_count().await, 2);
    }

    #[tokio::test]
    async fn default_queue_capacity_bounds_backlog() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe();

        for i in 0..(DEFAULT_QUEUE_CAPACITY + 5) {
            broker.broadcast("tick", i.to_string());
        }
        assert_eq!(broker.client_count().await, 1);

        let mut received = 0;
        while subscription.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, DEFAULT_QUEUE_CAPACITY);
    }

    /// Events published after an unsubscribe never reach that subscriber,
    /// even with other publishers running concurrently.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_delivery_after_unsubscribe_under_concurrency() {
        let broker = Broker::new();

        let noise = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for i in 0..2_000 {
                    broker.broadcast("noise", i.to_string());
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut checks = Vec::new();
        for _ in 0..50 {
            let broker = broker.clone();
            checks.push(tokio::spawn(async move {
                let mut subscription = broker.subscribe();
                let marker = subscription.id().to_string();
                tokio::task::yield_now().await;
                subscription.unsubscribe();
                broker.broadcast("after-unsubscribe", marker.clone());
                (marker, drain(&mut subscription).await)
            }));
        }

        for check in checks {
            let (marker, events) = check.await.unwrap();
            assert!(events.iter().all(|e| e.data != marker));
        }
        noise.await.unwrap();
        assert_eq!(broker.client_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_subscribers_are_all_counted() {
        let broker = Broker::new();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move { broker.subscribe() }));
        }

        let mut subscriptions = Vec::new();
        for handle in handles {
            subscriptions.push(handle.await.unwrap());
        }
        assert_eq!(broker.client_count().await, 20);

        subscriptions.clear();
        assert_eq!(broker.client_count().await, 0);
    }

    #[tokio::test]
    async fn event_names_with_line_breaks_are_dropped() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe();

        broker.broadcast("bad\nname", "{}");
        broker.broadcast("bad\rname", "{}");
        broker.broadcast("good", "multi\nline");

        assert_eq!(
            subscription.recv().await,
            Some(Event::new("good", "multi\nline"))
        );
        assert_eq!(broker.client_count().await, 1);
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn disconnect_all_ends_every_stream() {
        let broker = Broker::new();
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.broadcast("last", "1");
        broker.disconnect_all();

        assert_eq!(a.recv().await.map(|e| e.data), Some("1".to_string()));
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_some());
        assert!(b.recv().await.is_none());
        assert_eq!(broker.client_count().await, 0);

        let _late = broker.subscribe();
        assert_eq!(broker.client_count().await, 1);
    }
}
