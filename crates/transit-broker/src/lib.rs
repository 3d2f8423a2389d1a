// In-process pub/sub broker.
// Topics are split into partitions; each partition keeps a bounded log of
// offset-numbered records so subscribers can start from the oldest retained
// record, the tail, or an explicit offset.
use ahash::RandomState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("capacity must be non-zero")]
    InvalidCapacity,
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("partition not found: topic={topic} partition={partition} (topic has {partitions})")]
    PartitionNotFound {
        topic: String,
        partition: u32,
        partitions: u32,
    },
    #[error("offset too old (oldest {oldest}, requested {requested})")]
    OffsetTooOld { oldest: u64, requested: u64 },
    #[error("offset out of range (next {next}, requested {requested})")]
    OffsetOutOfRange { next: u64, requested: u64 },
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;
const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubQueuePolicy {
    /// Publish waits for room in a full subscriber queue.
    Block,
    /// A full subscriber queue drops the incoming record.
    #[default]
    DropNew,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub partitions: u32,
}

impl Default for TopicMetadata {
    fn default() -> Self {
        Self { partitions: 1 }
    }
}

/// Position in a partition log: the offset of the next record to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    next_offset: u64,
}

impl Cursor {
    pub fn at(offset: u64) -> Self {
        Self {
            next_offset: offset,
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }
}

/// One record of a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct DeliveryEnvelope {
    offset: u64,
    payload: Bytes,
}

impl DeliveryEnvelope {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_record(self) -> Record {
        Record {
            offset: self.offset,
            payload: self.payload,
        }
    }
}

/// Result of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub offset: u64,
    pub delivered: usize,
}

#[derive(Debug)]
struct LogState {
    // Bounded log; oldest entries are dropped as new ones arrive.
    log: VecDeque<Record>,
    next_offset: u64,
}

#[derive(Debug, Default)]
struct SubscriberRegistry {
    senders: Slab<mpsc::Sender<DeliveryEnvelope>>,
}

#[derive(Debug, Clone)]
struct SubscriberEntry {
    id: usize,
    sender: mpsc::Sender<DeliveryEnvelope>,
}

#[derive(Debug)]
struct PartitionState {
    // Snapshot read by publish: no lock and no allocation per publish.
    subscribers_snapshot: ArcSwap<Vec<SubscriberEntry>>,
    // Mutated only on subscribe/unsubscribe.
    subscribers: Mutex<SubscriberRegistry>,
    log_state: Mutex<LogState>,
    subscriber_capacity: usize,
    subscriber_policy: SubQueuePolicy,
}

impl PartitionState {
    fn new(subscriber_capacity: usize, subscriber_policy: SubQueuePolicy) -> Self {
        Self {
            subscribers_snapshot: ArcSwap::from_pointee(Vec::new()),
            subscribers: Mutex::new(SubscriberRegistry::default()),
            log_state: Mutex::new(LogState {
                log: VecDeque::new(),
                next_offset: 0,
            }),
            subscriber_capacity,
            subscriber_policy,
        }
    }

    fn register_subscriber(&self) -> (usize, mpsc::Receiver<DeliveryEnvelope>) {
        let mut state = self.subscribers.lock();
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = state.senders.insert(tx);
        self.rebuild_subscriber_snapshot(&state);
        (id, rx)
    }

    fn remove_subscribers(&self, ids: &[usize]) {
        let mut state = self.subscribers.lock();
        let mut removed = false;
        for id in ids {
            if state.senders.contains(*id) {
                state.senders.remove(*id);
                removed = true;
            }
        }
        if removed {
            self.rebuild_subscriber_snapshot(&state);
        }
    }

    fn rebuild_subscriber_snapshot(&self, state: &SubscriberRegistry) {
        let snapshot = state
            .senders
            .iter()
            .map(|(id, sender)| SubscriberEntry {
                id,
                sender: sender.clone(),
            })
            .collect();
        self.subscribers_snapshot.store(Arc::new(snapshot));
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().senders.len()
    }

    fn append(&self, payload: Bytes, log_capacity: usize) -> u64 {
        let mut state = self.log_state.lock();
        let offset = state.next_offset;
        state.next_offset += 1;
        state.log.push_back(Record { offset, payload });
        let overflow = state.log.len().saturating_sub(log_capacity);
        if overflow > 0 {
            state.log.drain(..overflow);
        }
        offset
    }

    // Oldest retained offset and the offset the next publish will get.
    fn bounds(&self) -> (u64, u64) {
        let state = self.log_state.lock();
        let oldest = state
            .log
            .front()
            .map(|record| record.offset)
            .unwrap_or(state.next_offset);
        (oldest, state.next_offset)
    }

    fn snapshot_from(&self, from_offset: u64) -> Vec<Record> {
        let state = self.log_state.lock();
        state
            .log
            .iter()
            .filter(|record| record.offset >= from_offset)
            .cloned()
            .collect()
    }

    async fn fan_out(&self, offset: u64, payload: &Bytes) -> usize {
        let senders = self.subscribers_snapshot.load_full();
        let mut closed = Vec::new();
        let mut delivered = 0usize;
        for subscriber in senders.iter() {
            let envelope = DeliveryEnvelope {
                offset,
                payload: payload.clone(),
            };
            match self.subscriber_policy {
                SubQueuePolicy::Block => {
                    if subscriber.sender.send(envelope).await.is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(subscriber.id);
                    }
                }
                SubQueuePolicy::DropNew => match subscriber.sender.try_send(envelope) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics::counter!("transit_broker_dropped_total").increment(1);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                },
            }
        }
        metrics::counter!("transit_broker_enqueued_total").increment(delivered as u64);
        if !closed.is_empty() {
            self.remove_subscribers(&closed);
        }
        delivered
    }
}

/// RAII handle that unregisters a subscriber on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    partition: Weak<PartitionState>,
    subscriber_id: usize,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(partition) = self.partition.upgrade() {
            partition.remove_subscribers(&[self.subscriber_id]);
        }
    }
}

/// Live feed of one partition.
///
/// Records below `skip_below` were already handed out as replay backlog and
/// are dropped when they also arrive live.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<DeliveryEnvelope>,
    skip_below: u64,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<DeliveryEnvelope> {
        loop {
            let envelope = self.receiver.recv().await?;
            if envelope.offset >= self.skip_below {
                return Some(envelope);
            }
        }
    }

    pub fn try_recv(&mut self) -> std::result::Result<DeliveryEnvelope, mpsc::error::TryRecvError> {
        loop {
            let envelope = self.receiver.try_recv()?;
            if envelope.offset >= self.skip_below {
                return Ok(envelope);
            }
        }
    }
}

#[derive(Debug)]
struct Topic {
    partitions: Vec<Arc<PartitionState>>,
}

/// In-process broker for pub/sub messaging.
///
/// ```
/// use bytes::Bytes;
/// use transit_broker::{Broker, TopicMetadata};
///
/// let broker = Broker::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     broker
///         .register_topic("probe", TopicMetadata::default())
///         .await
///         .expect("register");
///     let mut sub = broker.subscribe("probe", 0).await.expect("subscribe");
///     broker
///         .publish("probe", 0, Bytes::from_static(b"0"))
///         .await
///         .expect("publish");
///     let envelope = sub.recv().await.expect("recv");
///     assert_eq!(envelope.offset(), 0);
///     assert_eq!(envelope.payload(), &Bytes::from_static(b"0"));
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    topics: RwLock<HashMap<String, Arc<Topic>, RandomState>>,
    // Per-subscriber queue depth.
    subscriber_capacity: usize,
    // Records retained per partition for replay.
    log_capacity: usize,
    subscriber_policy: SubQueuePolicy,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            subscriber_policy: SubQueuePolicy::default(),
        }
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BrokerError::InvalidCapacity);
        }
        self.subscriber_capacity = capacity;
        Ok(self)
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BrokerError::InvalidCapacity);
        }
        self.log_capacity = capacity;
        Ok(self)
    }

    pub fn with_subscriber_policy(mut self, policy: SubQueuePolicy) -> Self {
        self.subscriber_policy = policy;
        self
    }

    /// Creates the topic if missing. Re-registering keeps the existing
    /// partitions and their logs.
    pub async fn register_topic(
        &self,
        topic: impl Into<String>,
        metadata: TopicMetadata,
    ) -> Result<()> {
        if metadata.partitions == 0 {
            return Err(BrokerError::InvalidCapacity);
        }
        let topic = topic.into();
        let mut topics = self.topics.write().await;
        topics.entry(topic).or_insert_with_key(|name| {
            tracing::debug!(topic = %name, partitions = metadata.partitions, "topic registered");
            Arc::new(Topic {
                partitions: (0..metadata.partitions)
                    .map(|_| {
                        Arc::new(PartitionState::new(
                            self.subscriber_capacity,
                            self.subscriber_policy,
                        ))
                    })
                    .collect(),
            })
        });
        Ok(())
    }

    pub async fn topic_exists(&self, topic: &str) -> bool {
        self.topics.read().await.contains_key(topic)
    }

    pub async fn partition_count(&self, topic: &str) -> Result<u32> {
        let topics = self.topics.read().await;
        let entry = topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        Ok(entry.partitions.len() as u32)
    }

    /// Appends to the partition log, then fans out to live subscribers.
    ///
    /// Records are fanned out in offset order as long as a partition has a
    /// single publisher.
    pub async fn publish(&self, topic: &str, partition: u32, payload: Bytes) -> Result<Published> {
        let state = self.partition(topic, partition).await?;
        let offset = state.append(payload.clone(), self.log_capacity);
        let delivered = state.fan_out(offset, &payload).await;
        Ok(Published { offset, delivered })
    }

    /// Subscribes to records published from now on.
    pub async fn subscribe(&self, topic: &str, partition: u32) -> Result<Subscription> {
        let state = self.partition(topic, partition).await?;
        let (subscriber_id, receiver) = state.register_subscriber();
        Ok(Subscription {
            receiver,
            skip_below: 0,
            _guard: SubscriptionGuard {
                partition: Arc::downgrade(&state),
                subscriber_id,
            },
        })
    }

    /// Subscribes from an earlier position: returns the retained backlog from
    /// `cursor` on plus a live subscription that continues after it.
    pub async fn subscribe_at(
        &self,
        topic: &str,
        partition: u32,
        cursor: Cursor,
    ) -> Result<(Vec<Record>, Subscription)> {
        let state = self.partition(topic, partition).await?;
        let (oldest, next) = state.bounds();
        let requested = cursor.next_offset;
        if requested < oldest {
            return Err(BrokerError::OffsetTooOld { oldest, requested });
        }
        if requested > next {
            return Err(BrokerError::OffsetOutOfRange { next, requested });
        }
        // Register before snapshotting so nothing published in between is lost;
        // the overlap is filtered by offset on the live side.
        let (subscriber_id, receiver) = state.register_subscriber();
        let backlog = state.snapshot_from(requested);
        let skip_below = backlog
            .last()
            .map(|record| record.offset + 1)
            .unwrap_or(requested);
        Ok((
            backlog,
            Subscription {
                receiver,
                skip_below,
                _guard: SubscriptionGuard {
                    partition: Arc::downgrade(&state),
                    subscriber_id,
                },
            },
        ))
    }

    /// Cursor at the oldest record still retained.
    pub async fn cursor_head(&self, topic: &str, partition: u32) -> Result<Cursor> {
        let state = self.partition(topic, partition).await?;
        Ok(Cursor::at(state.bounds().0))
    }

    /// Cursor at the next offset to be published.
    pub async fn cursor_tail(&self, topic: &str, partition: u32) -> Result<Cursor> {
        let state = self.partition(topic, partition).await?;
        Ok(Cursor::at(state.bounds().1))
    }

    async fn partition(&self, topic: &str, partition: u32) -> Result<Arc<PartitionState>> {
        let topics = self.topics.read().await;
        let entry = topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        entry
            .partitions
            .get(partition as usize)
            .cloned()
            .ok_or_else(|| BrokerError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
                partitions: entry.partitions.len() as u32,
            })
    }
}
