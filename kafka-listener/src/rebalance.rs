//! Rebalance coordination.
//!
//! The coordinator tracks which partitions this consumer currently owns and
//! reconciles pending offsets when ownership changes. On revocation the
//! acknowledged prefix of every revoked partition is force-committed and the
//! rest is discarded before the user listener runs: once the callback
//! returns, those partitions belong to another consumer and any offset still
//! pending would be a durability bug.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::{error, info};

use crate::ack::AckPolicy;
use crate::broker::{OffsetCommitMode, OffsetCommitter};
use crate::metrics_consts::{
    ASSIGNED_PARTITIONS, OFFSET_COMMITS, REBALANCE_ASSIGNMENTS, REBALANCE_REVOCATIONS,
};
use crate::types::Partition;

/// User callback observing partition ownership changes.
///
/// Implementations must not panic; the container invokes them inside the
/// broker's rebalance callback. The default methods make a log-only listener
/// out of any empty impl.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, _partitions: &[Partition]) {}
    fn on_partitions_assigned(&self, _partitions: &[Partition]) {}
}

/// Default listener, installed when the caller supplies none: logs and
/// nothing else.
pub struct LoggingRebalanceListener;

impl RebalanceListener for LoggingRebalanceListener {
    fn on_partitions_revoked(&self, partitions: &[Partition]) {
        info!(count = partitions.len(), "Partitions revoked");
    }

    fn on_partitions_assigned(&self, partitions: &[Partition]) {
        info!(count = partitions.len(), "Partitions assigned");
    }
}

/// Tracks assigned partitions and reconciles pending offsets on revocation.
pub struct RebalanceCoordinator {
    assigned: DashSet<Partition>,
    ack: Arc<AckPolicy>,
    listener: Arc<dyn RebalanceListener>,
}

impl RebalanceCoordinator {
    /// The listener is fixed here for the container's lifetime; a log-only
    /// default is installed when none is supplied.
    pub fn new(ack: Arc<AckPolicy>, listener: Option<Arc<dyn RebalanceListener>>) -> Self {
        Self {
            assigned: DashSet::new(),
            ack,
            listener: listener.unwrap_or_else(|| Arc::new(LoggingRebalanceListener)),
        }
    }

    /// Partition ownership is transferring away. Pending offsets for the
    /// revoked partitions are committed (acknowledged prefix, sync) or
    /// discarded before the user listener observes the revocation.
    pub fn on_partitions_revoked(&self, partitions: &[Partition], committer: &dyn OffsetCommitter) {
        if partitions.is_empty() {
            return;
        }

        let (committable, discarded) = self.ack.flush_partitions(partitions);
        if !committable.is_empty() {
            match committer.commit(&committable, OffsetCommitMode::Sync) {
                Ok(()) => {
                    metrics::counter!(OFFSET_COMMITS, "trigger" => "revocation").increment(1);
                }
                Err(e) => {
                    // Must not unwind out of the rebalance callback; the new
                    // owner will reprocess from the last committed offset.
                    error!(error = %e, "Failed to commit offsets for revoked partitions");
                }
            }
        }

        for partition in partitions {
            self.assigned.remove(partition);
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.assigned.len() as f64);
        metrics::counter!(REBALANCE_REVOCATIONS).increment(1);
        info!(
            revoked = partitions.len(),
            committed = committable.len(),
            discarded = discarded,
            remaining = self.assigned.len(),
            "Reconciled pending offsets for revoked partitions"
        );

        self.listener.on_partitions_revoked(partitions);
    }

    pub fn on_partitions_assigned(&self, partitions: &[Partition]) {
        if partitions.is_empty() {
            return;
        }

        for partition in partitions {
            self.assigned.insert(partition.clone());
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.assigned.len() as f64);
        metrics::counter!(REBALANCE_ASSIGNMENTS).increment(1);
        info!(
            assigned = partitions.len(),
            total = self.assigned.len(),
            "Partitions assigned"
        );

        self.listener.on_partitions_assigned(partitions);
    }

    /// Read by the poll loop to skip records from partitions revoked after
    /// the batch was fetched.
    pub fn is_assigned(&self, partition: &Partition) -> bool {
        self.assigned.contains(partition)
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }
}
