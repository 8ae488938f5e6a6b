//! A rate-limited work queue feeding a topic bus.
//!
//! Connectors enqueue export events; a single dispatcher paces them through
//! a [`RateLimiter`] and publishes each to the subscribers of its topic.
//! Publishing never blocks: a subscriber whose buffer is full misses the
//! message.

use crate::{
    events::{Message, MessageKey, Topic},
    limit::{ItemBackoff, RateLimiter, TokenBucket},
};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tracing::{debug, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const RATE_PER_SEC: f64 = 10.0;
const BURST: u32 = 100;

/// The number of messages buffered per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Clone)]
pub struct Broker {
    queue: mpsc::UnboundedSender<Message>,
    subscribers: Arc<Mutex<Subscribers>>,
    metrics: BrokerMetrics,
}

/// Paces and publishes enqueued messages. Runs until every [`Broker`] handle
/// is dropped or the process shuts down.
pub struct Dispatcher {
    queue: mpsc::UnboundedReceiver<Message>,
    limiter: RateLimiter<MessageKey>,
    subscribers: Arc<Mutex<Subscribers>>,
    metrics: BrokerMetrics,
}

pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<Message>,
}

#[derive(Clone, Debug)]
pub struct BrokerMetrics {
    enqueued: Counter,
    published: Counter,
    dropped: Counter,
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    by_topic: HashMap<Topic, Vec<(u64, mpsc::Sender<Message>)>>,
}

// === impl Broker ===

impl Broker {
    pub fn new(metrics: BrokerMetrics) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(Mutex::new(Subscribers::default()));
        let limiter = RateLimiter::new(
            ItemBackoff::new(BACKOFF_BASE, BACKOFF_MAX),
            TokenBucket::new(RATE_PER_SEC, BURST, Instant::now()),
        );
        let broker = Self {
            queue: tx,
            subscribers: subscribers.clone(),
            metrics: metrics.clone(),
        };
        let dispatcher = Dispatcher {
            queue: rx,
            limiter,
            subscribers,
            metrics,
        };
        (broker, dispatcher)
    }

    pub fn enqueue(&self, message: Message) {
        debug!(topic = %message.topic, export = %message.event.export_id(), "Enqueued");
        if self.queue.send(message).is_err() {
            warn!("Broker dispatcher has stopped; dropping message");
            return;
        }
        self.metrics.enqueued.inc();
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subs = self.subscribers.lock();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.by_topic.entry(topic).or_default().push((id, tx));
        Subscription { id, topic, rx }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.by_topic.get_mut(&subscription.topic) {
            list.retain(|(id, _)| *id != subscription.id);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .lock()
            .by_topic
            .get(&topic)
            .map_or(0, Vec::len)
    }
}

// === impl Dispatcher ===

impl Dispatcher {
    pub async fn run(mut self, shutdown: drain::Watch) {
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            let message = tokio::select! {
                biased;
                _ = &mut shutdown => return,
                message = self.queue.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };

            let key = message.key();
            let delay = self.limiter.when(&key, Instant::now());
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => return,
                    _ = time::sleep(delay) => {}
                }
            }

            self.publish(message);
            self.limiter.forget(&key);
        }
    }

    fn publish(&self, message: Message) {
        let mut subs = self.subscribers.lock();
        let Some(list) = subs.by_topic.get_mut(&message.topic) else {
            debug!(topic = %message.topic, "No subscribers");
            return;
        };

        list.retain(|(id, tx)| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %message.topic, subscriber = id, "Subscriber is lagging; dropping message");
                self.metrics.dropped.inc();
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        self.metrics.published.inc();
    }
}

// === impl Subscription ===

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

// === impl BrokerMetrics ===

impl BrokerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let enqueued = Counter::default();
        prom.register("enqueued", "Count of messages enqueued", enqueued.clone());

        let published = Counter::default();
        prom.register(
            "published",
            "Count of messages published to subscribers",
            published.clone(),
        );

        let dropped = Counter::default();
        prom.register(
            "dropped",
            "Count of messages dropped because a subscriber's buffer was full",
            dropped.clone(),
        );

        Self {
            enqueued,
            published,
            dropped,
        }
    }
}
