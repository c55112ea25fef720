//! In-process ordered log.
//!
//! Each topic is split into a fixed number of partitions and a record lands
//! on the partition chosen by hashing its key, so records sharing a key are
//! totally ordered. Consumer groups track their own committed offsets per
//! partition; a group that re-subscribes from its committed position gets
//! every record it had not committed yet (at-least-once).
//!
//! A group is registered on its first subscribe. Records below the lowest
//! committed offset of every registered group are dropped from memory.

use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::LogError;
use crate::models::VoteRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// A record handed to a consumer, with its position in the topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub partition: usize,
    pub offset: u64,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Earliest,
    Latest,
    /// The group's committed offsets, or the beginning for partitions it has
    /// never committed.
    Committed,
}

#[derive(Default)]
struct PartitionLog {
    base: u64,
    records: VecDeque<Record>,
}

impl PartitionLog {
    /// Offset the next appended record will get.
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Record> {
        let index = offset.checked_sub(self.base)?;
        self.records.get(index as usize)
    }

    fn truncate_before(&mut self, offset: u64) {
        while self.base < offset && self.records.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Default)]
struct TopicState {
    partitions: Vec<PartitionLog>,
    committed: HashMap<String, Vec<u64>>,
    closed: bool,
}

struct Topic {
    state: Mutex<TopicState>,
    appended: Notify,
}

impl Topic {
    fn new(partitions: usize) -> Self {
        Self {
            state: Mutex::new(TopicState {
                partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
                ..Default::default()
            }),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        // A panic while holding the lock cannot leave a half-written record,
        // every mutation is a single push, pop or assignment.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Broker {
    topics: HashMap<String, Arc<Topic>>,
    num_partitions: usize,
}

impl Broker {
    pub fn new(topics: &[&str], num_partitions: usize) -> Self {
        let num_partitions = num_partitions.max(1);
        let topics = topics
            .iter()
            .map(|name| (name.to_string(), Arc::new(Topic::new(num_partitions))))
            .collect();

        Self {
            topics,
            num_partitions,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.num_partitions as u64) as usize
    }

    fn topic(&self, name: &str) -> Result<&Arc<Topic>, LogError> {
        self.topics
            .get(name)
            .ok_or_else(|| LogError::UnknownTopic(name.to_string()))
    }

    /// Append a record, returning its partition and offset.
    pub fn append(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<(usize, u64), LogError> {
        let partition = self.partition_for(key);
        let topic = self.topic(topic)?;

        let offset = {
            let mut state = topic.lock();
            if state.closed {
                return Err(LogError::Closed);
            }
            let log = &mut state.partitions[partition];
            let offset = log.end();
            log.records.push_back(Record {
                key: key.to_string(),
                value,
                timestamp: Utc::now(),
            });
            offset
        };

        topic.appended.notify_waiters();
        Ok((partition, offset))
    }

    pub fn append_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(usize, u64), LogError> {
        let bytes = serde_json::to_vec(value)?;
        self.append(topic, key, bytes)
    }

    pub fn subscribe(&self, topic: &str, group: &str, start: StartFrom) -> Result<Subscription, LogError> {
        let topic = Arc::clone(self.topic(topic)?);

        let positions = {
            let mut state = topic.lock();
            let bases: Vec<u64> = state.partitions.iter().map(|p| p.base).collect();
            let ends: Vec<u64> = state.partitions.iter().map(PartitionLog::end).collect();

            let registered = state
                .committed
                .entry(group.to_string())
                .or_insert_with(|| match start {
                    StartFrom::Latest => ends.clone(),
                    StartFrom::Earliest | StartFrom::Committed => bases.clone(),
                })
                .clone();

            match start {
                StartFrom::Earliest => bases,
                StartFrom::Latest => ends,
                StartFrom::Committed => registered,
            }
        };

        Ok(Subscription {
            topic,
            group: group.to_string(),
            positions,
            next_partition: 0,
        })
    }

    /// Records still held in memory for a topic.
    pub fn len(&self, topic: &str) -> Result<usize, LogError> {
        let topic = self.topic(topic)?;
        let state = topic.lock();
        Ok(state.partitions.iter().map(|p| p.records.len()).sum())
    }

    /// Total number of records ever appended to a topic.
    pub fn appended(&self, topic: &str) -> Result<u64, LogError> {
        let topic = self.topic(topic)?;
        let state = topic.lock();
        Ok(state.partitions.iter().map(PartitionLog::end).sum())
    }

    pub fn committed(&self, topic: &str, group: &str) -> Result<Option<Vec<u64>>, LogError> {
        let topic = self.topic(topic)?;
        let state = topic.lock();
        Ok(state.committed.get(group).cloned())
    }

    /// Reject further appends and wake every subscriber. Subscribers drain
    /// what is left and then end.
    pub fn close(&self) {
        for name in self.topics.keys() {
            // every key is a known topic
            let _ = self.close_topic(name);
        }
    }

    pub fn close_topic(&self, name: &str) -> Result<(), LogError> {
        let topic = self.topic(name)?;
        topic.lock().closed = true;
        topic.appended.notify_waiters();
        Ok(())
    }
}

pub struct Subscription {
    topic: Arc<Topic>,
    group: String,
    positions: Vec<u64>,
    next_partition: usize,
}

impl Subscription {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for the next record. Returns `None` once the broker is closed
    /// and this subscription has caught up.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            let topic = Arc::clone(&self.topic);
            let notified = topic.appended.notified();
            tokio::pin!(notified);
            // Register before checking, so an append between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            {
                let state = topic.lock();
                if let Some(delivery) = self.poll(&state) {
                    return Some(delivery);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    // Round-robin over partitions, one record at a time.
    fn poll(&mut self, state: &TopicState) -> Option<Delivery> {
        let count = state.partitions.len();
        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            let log = &state.partitions[partition];
            // Another group may have let the log move past us.
            let offset = self.positions[partition].max(log.base);
            if let Some(record) = log.get(offset) {
                self.positions[partition] = offset + 1;
                self.next_partition = (partition + 1) % count;
                return Some(Delivery {
                    partition,
                    offset,
                    record: record.clone(),
                });
            }
        }
        None
    }

    /// Mark a delivery as handled for this consumer group, then drop
    /// whatever every group has now committed past.
    pub fn commit(&self, delivery: &Delivery) {
        let mut state = self.topic.lock();
        let partition = delivery.partition;
        let count = state.partitions.len();
        let offsets = state
            .committed
            .entry(self.group.clone())
            .or_insert_with(|| vec![0; count]);
        let next = delivery.offset + 1;
        if offsets[partition] < next {
            offsets[partition] = next;
        }

        let floor = state
            .committed
            .values()
            .map(|offsets| offsets[partition])
            .min()
            .unwrap_or(0);
        state.partitions[partition].truncate_before(floor);
    }
}

/// Append port used by the submission gateway.
#[async_trait]
pub trait VoteLog: Send + Sync {
    async fn append(&self, partition_key: &str, record: &VoteRecord) -> Result<(), LogError>;
}

/// Writes JSON values to one broker topic.
#[derive(Clone)]
pub struct TopicWriter {
    broker: Arc<Broker>,
    topic: String,
}

impl TopicWriter {
    pub fn new(broker: Arc<Broker>, topic: &str) -> Self {
        Self {
            broker,
            topic: topic.to_string(),
        }
    }

    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(usize, u64), LogError> {
        self.broker.append_json(&self.topic, key, value)
    }
}

#[async_trait]
impl VoteLog for TopicWriter {
    async fn append(&self, partition_key: &str, record: &VoteRecord) -> Result<(), LogError> {
        self.write(partition_key, record).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn broker() -> Broker {
        Broker::new(&["raw-votes", "poll-updates"], 4)
    }

    fn value_of(delivery: &Delivery) -> String {
        String::from_utf8(delivery.record.value.clone()).unwrap()
    }

    #[test]
    fn partition_is_deterministic_and_in_range() {
        let broker = broker();
        for i in 0..100 {
            let key = format!("poll_{}", i);
            let p = broker.partition_for(&key);
            assert_eq!(p, broker.partition_for(&key));
            assert!(p < broker.num_partitions());
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let broker = broker();
        assert_eq!(
            broker.append("nope", "k", vec![]),
            Err(LogError::UnknownTopic("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn same_key_is_delivered_in_append_order() {
        let broker = broker();
        for i in 0..20 {
            broker.append("raw-votes", "poll-1", format!("v{}", i).into_bytes()).unwrap();
            broker.append("raw-votes", "poll-2", format!("w{}", i).into_bytes()).unwrap();
        }

        let mut sub = broker.subscribe("raw-votes", "g", StartFrom::Earliest).unwrap();
        let mut poll_1 = Vec::new();
        for _ in 0..40 {
            let delivery = sub.next().await.unwrap();
            if delivery.record.key == "poll-1" {
                poll_1.push(value_of(&delivery));
            }
        }
        let expected: Vec<String> = (0..20).map(|i| format!("v{}", i)).collect();
        assert_eq!(poll_1, expected);
    }

    #[tokio::test]
    async fn groups_consume_independently() {
        let broker = broker();
        broker.append("poll-updates", "1", b"a".to_vec()).unwrap();

        let mut first = broker.subscribe("poll-updates", "one", StartFrom::Earliest).unwrap();
        let mut second = broker.subscribe("poll-updates", "two", StartFrom::Earliest).unwrap();

        let d1 = first.next().await.unwrap();
        first.commit(&d1);
        let d2 = second.next().await.unwrap();
        assert_eq!(d1.record, d2.record);
        assert_eq!(
            broker.committed("poll-updates", "two").unwrap(),
            Some(vec![0; 4])
        );
        // "two" has not committed, so the record is still held for it
        assert_eq!(broker.len("poll-updates").unwrap(), 1);
    }

    #[tokio::test]
    async fn committed_records_are_released() {
        let broker = broker();
        let mut sub = broker.subscribe("raw-votes", "agg", StartFrom::Committed).unwrap();
        for i in 0..1000 {
            broker
                .append("raw-votes", &format!("poll-{}", i % 7), format!("{}", i).into_bytes())
                .unwrap();
        }

        for _ in 0..1000 {
            let delivery = sub.next().await.unwrap();
            sub.commit(&delivery);
        }

        assert_eq!(broker.len("raw-votes").unwrap(), 0);
        assert_eq!(broker.appended("raw-votes").unwrap(), 1000);

        // Offsets keep counting from where the log was cut
        let (partition, offset) = broker.append("raw-votes", "poll-0", b"next".to_vec()).unwrap();
        let delivery = sub.next().await.unwrap();
        assert_eq!((delivery.partition, delivery.offset), (partition, offset));
        assert_eq!(value_of(&delivery), "next");
    }

    #[tokio::test]
    async fn slowest_group_holds_records() {
        let broker = broker();
        let mut fast = broker.subscribe("raw-votes", "fast", StartFrom::Earliest).unwrap();
        let mut slow = broker.subscribe("raw-votes", "slow", StartFrom::Earliest).unwrap();
        for i in 0..10 {
            broker.append("raw-votes", "1", vec![i]).unwrap();
        }

        for _ in 0..10 {
            let delivery = fast.next().await.unwrap();
            fast.commit(&delivery);
        }
        assert_eq!(broker.len("raw-votes").unwrap(), 10);

        for _ in 0..4 {
            let delivery = slow.next().await.unwrap();
            slow.commit(&delivery);
        }
        assert_eq!(broker.len("raw-votes").unwrap(), 6);

        // A late group starting from the beginning sees only what is left
        let mut late = broker.subscribe("raw-votes", "late", StartFrom::Earliest).unwrap();
        let first = late.next().await.unwrap();
        assert_eq!(first.offset, 4);
        assert_eq!(first.record.value, vec![4]);
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered() {
        let broker = broker();
        for i in 0..3 {
            broker.append("raw-votes", "1", vec![i]).unwrap();
        }

        let mut sub = broker.subscribe("raw-votes", "agg", StartFrom::Committed).unwrap();
        let first = sub.next().await.unwrap();
        sub.commit(&first);
        let _second = sub.next().await.unwrap();
        drop(sub);

        let mut resumed = broker.subscribe("raw-votes", "agg", StartFrom::Committed).unwrap();
        let again = resumed.next().await.unwrap();
        assert_eq!(again.record.value, vec![1]);
        assert_eq!(again.offset, 1);
    }

    #[tokio::test]
    async fn latest_skips_existing_records() {
        let broker = broker();
        broker.append("raw-votes", "1", b"old".to_vec()).unwrap();
        let mut sub = broker.subscribe("raw-votes", "g", StartFrom::Latest).unwrap();
        broker.append("raw-votes", "1", b"new".to_vec()).unwrap();
        assert_eq!(value_of(&sub.next().await.unwrap()), "new");
    }

    #[tokio::test]
    async fn next_waits_for_append() {
        let broker = Arc::new(broker());
        let mut sub = broker.subscribe("raw-votes", "g", StartFrom::Earliest).unwrap();

        let writer = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("raw-votes", "1", b"late".to_vec()).unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value_of(&delivery), "late");
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let broker = broker();
        broker.append("raw-votes", "1", b"last".to_vec()).unwrap();
        let mut sub = broker.subscribe("raw-votes", "g", StartFrom::Earliest).unwrap();
        broker.close();

        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
        assert_eq!(broker.append("raw-votes", "1", vec![]), Err(LogError::Closed));
    }
}
