//! Offset acknowledgment policy.
//!
//! [`AckPolicy`] decides when offsets recorded by the poll loop become
//! durably committed. It owns all pending (uncommitted) offsets, keyed by
//! partition and ordered by offset within each partition, so the committable
//! position per partition is always the highest contiguous acknowledged
//! prefix and never skips an unacknowledged gap.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::broker::{OffsetCommitMode, OffsetCommitter};
use crate::error::{BrokerError, ContainerError};
use crate::metrics_consts::{OFFSET_COMMITS, PENDING_OFFSETS_DISCARDED};
use crate::types::{Partition, PartitionOffset};

/// Offset commit behavior, set once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Commit after each record is processed by the listener.
    Record,
    /// Commit whatever a poll batch produced before the next poll.
    Batch,
    /// Commit pending offsets once the configured ack time has elapsed.
    Time,
    /// Commit pending offsets once the configured ack count is reached.
    Count,
    /// Commit when either the ack count or the ack time triggers first.
    CountTime,
    /// Like `CountTime`, but only for offsets the listener explicitly
    /// acknowledged.
    Manual,
    /// Commit asynchronously the instant a manual acknowledgment is issued.
    ManualImmediate,
    /// Like `ManualImmediate`, but the commit blocks until the broker
    /// confirms and failures propagate to the acknowledging caller.
    ManualImmediateSync,
}

impl AckMode {
    /// Manual modes only commit offsets the listener explicitly acknowledged.
    pub fn is_manual(&self) -> bool {
        matches!(
            self,
            Self::Manual | Self::ManualImmediate | Self::ManualImmediateSync
        )
    }
}

impl FromStr for AckMode {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "record" => Ok(Self::Record),
            "batch" => Ok(Self::Batch),
            "time" => Ok(Self::Time),
            "count" => Ok(Self::Count),
            "count_time" => Ok(Self::CountTime),
            "manual" => Ok(Self::Manual),
            "manual_immediate" => Ok(Self::ManualImmediate),
            "manual_immediate_sync" => Ok(Self::ManualImmediateSync),
            other => Err(ContainerError::InvalidAckMode(other.to_string())),
        }
    }
}

/// A recorded, not-yet-committed offset.
struct PendingAck {
    recorded_at: Instant,
    acked: bool,
}

struct AckInner {
    /// Pending entries per partition, ordered by offset.
    pending: HashMap<Partition, BTreeMap<i64, PendingAck>>,
    /// Acknowledged-but-uncommitted record count, for count-based triggers.
    acked_since_commit: u32,
    /// Start of the current ack-time window, for time-based triggers.
    last_commit: Instant,
}

/// The offset-commit decision engine.
///
/// Pure state machine: it never talks to the broker itself. The poll loop
/// (and, for immediate manual modes, [`Acknowledgment`]) asks it what is
/// committable and hands the result to an [`OffsetCommitter`].
pub struct AckPolicy {
    mode: AckMode,
    ack_time: Duration,
    ack_count: u32,
    inner: Mutex<AckInner>,
}

impl AckPolicy {
    pub fn new(mode: AckMode, ack_time: Duration, ack_count: u32) -> Self {
        Self {
            mode,
            ack_time,
            // A zero ack count would commit on every record; treat it as 1.
            ack_count: ack_count.max(1),
            inner: Mutex::new(AckInner {
                pending: HashMap::new(),
                acked_since_commit: 0,
                last_commit: Instant::now(),
            }),
        }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// Record a successfully handled record. In automatic modes the entry is
    /// immediately acknowledged; in manual modes it stays pending until the
    /// listener acknowledges it.
    pub fn record_processed(&self, partition: &Partition, offset: i64) {
        let acked = !self.mode.is_manual();
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.pending.entry(partition.clone()).or_default();
        if entries.contains_key(&offset) {
            // Duplicate delivery; the existing entry may already be
            // acknowledged and must not be regressed.
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Offset already recorded, keeping existing entry"
            );
            return;
        }
        entries.insert(
            offset,
            PendingAck {
                recorded_at: Instant::now(),
                acked,
            },
        );
        if acked {
            inner.acked_since_commit += 1;
        }
    }

    /// Mark a pending offset as acknowledged (manual modes).
    pub fn acknowledge(&self, partition: &Partition, offset: i64) {
        let mut inner = self.inner.lock().unwrap();
        let newly_acked = match inner
            .pending
            .get_mut(partition)
            .and_then(|entries| entries.get_mut(&offset))
        {
            Some(entry) if entry.acked => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Offset already acknowledged"
                );
                false
            }
            Some(entry) => {
                entry.acked = true;
                true
            }
            None => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Acknowledgment for unknown offset ignored"
                );
                false
            }
        };
        if newly_acked {
            inner.acked_since_commit += 1;
        }
    }

    /// Whether the configured trigger fired for the current pending state.
    ///
    /// Immediate manual modes always return false here: their commits happen
    /// inside [`Acknowledgment::acknowledge`]. `Batch` returns false as well;
    /// the poll loop flushes it at the batch boundary.
    pub fn should_commit_now(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let count = inner.acked_since_commit;
        let elapsed = inner.last_commit.elapsed();
        match self.mode {
            AckMode::Record => count > 0,
            AckMode::Batch | AckMode::ManualImmediate | AckMode::ManualImmediateSync => false,
            AckMode::Time => count > 0 && elapsed >= self.ack_time,
            AckMode::Count => count >= self.ack_count,
            AckMode::CountTime | AckMode::Manual => {
                count >= self.ack_count || (count > 0 && elapsed >= self.ack_time)
            }
        }
    }

    /// Drain the committable offsets: per partition, the highest contiguous
    /// acknowledged prefix. Entries behind an unacknowledged gap stay pending.
    pub fn take_committable(&self) -> Vec<PartitionOffset> {
        let mut inner = self.inner.lock().unwrap();
        let mut committable = Vec::new();
        for (partition, entries) in inner.pending.iter_mut() {
            if let Some(offset) = drain_acked_prefix(entries) {
                committable.push(PartitionOffset::new(partition.clone(), offset));
            }
        }
        inner.pending.retain(|_, entries| !entries.is_empty());
        if !committable.is_empty() {
            inner.last_commit = Instant::now();
            inner.acked_since_commit = remaining_acked(&inner.pending);
        }
        committable
    }

    /// Reconcile pending state for partitions leaving this consumer: the
    /// acknowledged prefix of each is returned for an immediate commit,
    /// everything else is discarded. Nothing stays pending for a partition
    /// that is about to belong to another consumer.
    pub fn flush_partitions(&self, partitions: &[Partition]) -> (Vec<PartitionOffset>, usize) {
        let mut inner = self.inner.lock().unwrap();
        let mut committable = Vec::new();
        let mut discarded = 0;
        for partition in partitions {
            let Some(mut entries) = inner.pending.remove(partition) else {
                continue;
            };
            if let Some(offset) = drain_acked_prefix(&mut entries) {
                committable.push(PartitionOffset::new(partition.clone(), offset));
            }
            if let Some((offset, entry)) = entries.first_key_value() {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    first_offset = offset,
                    age_ms = entry.recorded_at.elapsed().as_millis() as u64,
                    count = entries.len(),
                    "Discarding pending offsets for revoked partition"
                );
            }
            discarded += entries.len();
        }
        if discarded > 0 {
            metrics::counter!(PENDING_OFFSETS_DISCARDED).increment(discarded as u64);
        }
        inner.acked_since_commit = remaining_acked(&inner.pending);
        (committable, discarded)
    }

    /// Number of recorded, uncommitted offsets across all partitions.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.pending.values().map(BTreeMap::len).sum()
    }
}

/// Pop the leading acknowledged run and return its last offset.
fn drain_acked_prefix(entries: &mut BTreeMap<i64, PendingAck>) -> Option<i64> {
    let mut last = None;
    loop {
        match entries.first_key_value() {
            Some((_, entry)) if entry.acked => {}
            _ => break,
        }
        if let Some((offset, _)) = entries.pop_first() {
            last = Some(offset);
        }
    }
    last
}

fn remaining_acked(pending: &HashMap<Partition, BTreeMap<i64, PendingAck>>) -> u32 {
    pending
        .values()
        .flat_map(BTreeMap::values)
        .filter(|entry| entry.acked)
        .count() as u32
}

/// Manual-commit handle passed to acknowledging listeners.
///
/// Cheap to clone; a fresh clone is handed to every listener invocation
/// attempt. Acknowledging the same offset twice logs a warning and is
/// otherwise a no-op.
#[derive(Clone)]
pub struct Acknowledgment {
    partition: Partition,
    offset: i64,
    policy: Arc<AckPolicy>,
    committer: Arc<dyn OffsetCommitter>,
}

impl Acknowledgment {
    pub(crate) fn new(
        partition: Partition,
        offset: i64,
        policy: Arc<AckPolicy>,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            partition,
            offset,
            policy,
            committer,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Mark this record's offset as ready to commit.
    ///
    /// In `ManualImmediate` mode the committable set is committed
    /// asynchronously right away and failures are only logged; in
    /// `ManualImmediateSync` the commit blocks until the broker confirms and
    /// the error is returned to the caller. Deferred manual mode leaves the
    /// commit to the container's count/time triggers.
    pub fn acknowledge(&self) -> Result<(), BrokerError> {
        self.policy.acknowledge(&self.partition, self.offset);
        match self.policy.mode() {
            AckMode::ManualImmediate => {
                let offsets = self.policy.take_committable();
                if offsets.is_empty() {
                    return Ok(());
                }
                match self.committer.commit(&offsets, OffsetCommitMode::Async) {
                    Ok(()) => {
                        metrics::counter!(OFFSET_COMMITS, "trigger" => "manual_immediate")
                            .increment(1);
                    }
                    Err(e) => {
                        warn!(error = %e, "Async commit on manual acknowledgment failed");
                    }
                }
                Ok(())
            }
            AckMode::ManualImmediateSync => {
                let offsets = self.policy.take_committable();
                if offsets.is_empty() {
                    return Ok(());
                }
                self.committer.commit(&offsets, OffsetCommitMode::Sync)?;
                metrics::counter!(OFFSET_COMMITS, "trigger" => "manual_immediate_sync")
                    .increment(1);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
