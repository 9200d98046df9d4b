//! Broker client abstraction and the rdkafka-backed implementation.
//!
//! The container only ever talks to the broker through [`BrokerConsumer`],
//! so the poll/commit/subscribe surface stays mockable in tests. The
//! production implementation wraps a `StreamConsumer` whose consumer context
//! forwards librdkafka rebalance callbacks to the container's
//! [`RebalanceCoordinator`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::rebalance::RebalanceCoordinator;
use crate::types::{partitions_of, PartitionOffset};

/// Whether a commit call blocks until the broker confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetCommitMode {
    Sync,
    Async,
}

impl From<OffsetCommitMode> for CommitMode {
    fn from(mode: OffsetCommitMode) -> Self {
        match mode {
            OffsetCommitMode::Sync => CommitMode::Sync,
            OffsetCommitMode::Async => CommitMode::Async,
        }
    }
}

/// Commit capability, split out so rebalance callbacks (which hold only a
/// borrowed consumer) can commit through the same seam as the poll loop.
pub trait OffsetCommitter: Send + Sync {
    /// Commit processed offsets. Implementations translate to the broker's
    /// next-offset convention.
    fn commit(&self, offsets: &[PartitionOffset], mode: OffsetCommitMode)
        -> Result<(), BrokerError>;
}

/// The broker capability set the container consumes.
#[async_trait]
pub trait BrokerConsumer: OffsetCommitter + 'static {
    /// Join the consumer group for `topics`, installing the coordinator as
    /// the partition-assignment notifier.
    fn subscribe(
        &self,
        topics: &[String],
        coordinator: Arc<RebalanceCoordinator>,
    ) -> Result<(), BrokerError>;

    /// Fetch the next batch of records, waiting at most `timeout`. An empty
    /// batch means the timeout elapsed without data.
    async fn poll(&self, timeout: Duration) -> Result<Vec<OwnedMessage>, BrokerError>;
}

fn commit_list(offsets: &[PartitionOffset]) -> Result<TopicPartitionList, BrokerError> {
    let mut list = TopicPartitionList::new();
    for offset in offsets {
        list.add_partition_offset(
            offset.topic(),
            offset.partition_number(),
            Offset::Offset(offset.offset() + 1),
        )?;
    }
    Ok(list)
}

/// Consumer context bridging librdkafka rebalance callbacks to the
/// container's coordinator. The coordinator is installed late (at
/// `subscribe`) because the rdkafka consumer must exist before the container
/// that owns the coordinator is wired up.
pub struct ListenerConsumerContext {
    coordinator: Arc<OnceCell<Arc<RebalanceCoordinator>>>,
}

impl ClientContext for ListenerConsumerContext {}

impl ConsumerContext for ListenerConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                let Some(coordinator) = self.coordinator.get() else {
                    warn!("Rebalance before subscribe, no coordinator installed");
                    return;
                };
                let revoked = partitions_of(partitions);
                // Revoked partitions must be reconciled before this callback
                // returns; the borrowed consumer is the only legal committer
                // in this context.
                coordinator.on_partitions_revoked(
                    &revoked,
                    &CallbackCommitter {
                        consumer: base_consumer,
                    },
                );
            }
            Rebalance::Assign(partitions) => {
                debug!(count = partitions.count(), "Pre-rebalance assign event");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }
                let Some(coordinator) = self.coordinator.get() else {
                    warn!("Rebalance before subscribe, no coordinator installed");
                    return;
                };
                coordinator.on_partitions_assigned(&partitions_of(partitions));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "Post-rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                debug!(partitions = offsets.count(), "Offsets committed");
            }
            Err(e) => {
                warn!(error = %e, "Offset commit failed");
            }
        }
    }
}

/// Committer over the borrowed consumer handed to rebalance callbacks.
struct CallbackCommitter<'a> {
    consumer: &'a BaseConsumer<ListenerConsumerContext>,
}

impl OffsetCommitter for CallbackCommitter<'_> {
    fn commit(
        &self,
        offsets: &[PartitionOffset],
        mode: OffsetCommitMode,
    ) -> Result<(), BrokerError> {
        let list = commit_list(offsets)?;
        self.consumer.commit(&list, mode.into())?;
        Ok(())
    }
}

/// Production broker client backed by an rdkafka `StreamConsumer`.
pub struct KafkaConsumerClient {
    consumer: StreamConsumer<ListenerConsumerContext>,
    coordinator: Arc<OnceCell<Arc<RebalanceCoordinator>>>,
}

impl KafkaConsumerClient {
    pub fn from_config(config: &ClientConfig) -> Result<Self, BrokerError> {
        let coordinator = Arc::new(OnceCell::new());
        let context = ListenerConsumerContext {
            coordinator: coordinator.clone(),
        };
        let consumer: StreamConsumer<ListenerConsumerContext> =
            config.create_with_context(context)?;
        Ok(Self {
            consumer,
            coordinator,
        })
    }
}

impl OffsetCommitter for KafkaConsumerClient {
    fn commit(
        &self,
        offsets: &[PartitionOffset],
        mode: OffsetCommitMode,
    ) -> Result<(), BrokerError> {
        let list = commit_list(offsets)?;
        self.consumer.commit(&list, mode.into())?;
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumerClient {
    fn subscribe(
        &self,
        topics: &[String],
        coordinator: Arc<RebalanceCoordinator>,
    ) -> Result<(), BrokerError> {
        if self.coordinator.set(coordinator).is_err() {
            debug!("Rebalance coordinator already installed");
        }
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs)?;
        info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<OwnedMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(vec![message.detach()]),
            Ok(Err(e)) => Err(BrokerError::Kafka(e)),
            Err(_) => Ok(Vec::new()),
        }
    }
}
