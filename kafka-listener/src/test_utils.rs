//! Test support: record builders and an in-memory broker.
//!
//! Used by the crate's own tests; exported so downstream crates can drive a
//! container against scripted batches without a real broker.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{OwnedHeaders, OwnedMessage};
use rdkafka::{Message, Timestamp};

use crate::broker::{BrokerConsumer, OffsetCommitMode, OffsetCommitter};
use crate::error::{BrokerError, ListenerError};
use crate::rebalance::RebalanceCoordinator;
use crate::recovery::ErrorHandler;
use crate::types::{Partition, PartitionOffset};

/// Build an owned record with the given coordinates and a string payload.
pub fn test_record(topic: &str, partition: i32, offset: i64, payload: &str) -> OwnedMessage {
    OwnedMessage::new(
        Some(payload.as_bytes().to_vec()),
        Some(format!("key-{offset}").into_bytes()),
        topic.to_string(),
        Timestamp::now(),
        partition,
        offset,
        Some(OwnedHeaders::new()),
    )
}

/// Error handler that records the coordinates of every routed record.
#[derive(Default)]
pub struct RecordingErrorHandler {
    handled: Mutex<Vec<(String, i32, i64)>>,
}

impl RecordingErrorHandler {
    pub fn handled(&self) -> Vec<(String, i32, i64)> {
        self.handled.lock().unwrap().clone()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn handle(&self, _error: &ListenerError, record: &OwnedMessage) {
        self.handled.lock().unwrap().push((
            record.topic().to_string(),
            record.partition(),
            record.offset(),
        ));
    }
}

/// In-memory broker consumer fed from scripted batches.
///
/// Partitions are auto-assigned through the coordinator the first time a
/// batch delivers them, mirroring a cooperative assign on first poll.
/// `revoke` drives the coordinator's revocation path with this broker as
/// the committer, the way a real rebalance callback would.
#[derive(Default)]
pub struct MockBroker {
    batches: Mutex<VecDeque<Vec<OwnedMessage>>>,
    commits: Mutex<Vec<(Vec<PartitionOffset>, OffsetCommitMode)>>,
    coordinator: Mutex<Option<Arc<RebalanceCoordinator>>>,
    auto_assigned: Mutex<HashSet<Partition>>,
    subscribe_calls: AtomicUsize,
    fail_commits: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, batch: Vec<OwnedMessage>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    /// Every commit observed, in order, with the mode it was issued under.
    pub fn commits(&self) -> Vec<(Vec<PartitionOffset>, OffsetCommitMode)> {
        self.commits.lock().unwrap().clone()
    }

    /// Flattened committed offsets, in commit order.
    pub fn committed(&self) -> Vec<PartitionOffset> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(offsets, _)| offsets.clone())
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Simulate the broker revoking `partitions` from this consumer.
    pub fn revoke(&self, partitions: &[Partition]) {
        let coordinator = self
            .coordinator
            .lock()
            .unwrap()
            .clone()
            .expect("revoke before subscribe");
        coordinator.on_partitions_revoked(partitions, self);
        let mut assigned = self.auto_assigned.lock().unwrap();
        for partition in partitions {
            assigned.remove(partition);
        }
    }
}

impl OffsetCommitter for MockBroker {
    fn commit(
        &self,
        offsets: &[PartitionOffset],
        mode: OffsetCommitMode,
    ) -> Result<(), BrokerError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("commit refused".to_string()));
        }
        self.commits.lock().unwrap().push((offsets.to_vec(), mode));
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for MockBroker {
    fn subscribe(
        &self,
        _topics: &[String],
        coordinator: Arc<RebalanceCoordinator>,
    ) -> Result<(), BrokerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *self.coordinator.lock().unwrap() = Some(coordinator);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<OwnedMessage>, BrokerError> {
        let batch = self.batches.lock().unwrap().pop_front();
        match batch {
            Some(batch) => {
                if let Some(coordinator) = self.coordinator.lock().unwrap().clone() {
                    let mut assigned = self.auto_assigned.lock().unwrap();
                    let fresh: Vec<Partition> = batch
                        .iter()
                        .map(|record| {
                            Partition::new(record.topic().to_string(), record.partition())
                        })
                        .filter(|partition| assigned.insert(partition.clone()))
                        .collect();
                    drop(assigned);
                    if !fresh.is_empty() {
                        coordinator.on_partitions_assigned(&fresh);
                    }
                }
                Ok(batch)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }
}
