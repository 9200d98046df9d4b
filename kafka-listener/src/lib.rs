//! Managed Kafka consumer-group containers.
//!
//! A [`ListenerContainer`](container::ListenerContainer) wraps one consumer
//! in a consumer group and drives a user [`MessageListener`](listener::MessageListener)
//! through a poll loop, taking over the three concerns that make hand-rolled
//! consumers go wrong:
//!
//! - **Offset commits** governed by an [`AckMode`](ack::AckMode) policy, from
//!   per-record commits to fully manual acknowledgment with out-of-order
//!   tolerance.
//! - **Rebalances**: pending offsets for revoked partitions are committed or
//!   discarded before the partitions move, with an optional user
//!   [`RebalanceListener`](rebalance::RebalanceListener) hook.
//! - **Failures**: listener errors are retried with exponential backoff and
//!   routed to a recovery callback once exhausted, so one poison record
//!   never wedges a partition.
//!
//! The broker sits behind the [`BrokerConsumer`](broker::BrokerConsumer)
//! trait; production uses the rdkafka-backed
//! [`KafkaConsumerClient`](broker::KafkaConsumerClient), tests use the
//! in-memory broker from [`test_utils`].

pub mod ack;
pub mod broker;
pub mod config;
pub mod container;
pub mod error;
pub mod listener;
pub mod metrics_consts;
pub mod rebalance;
pub mod recovery;
pub mod test_utils;
pub mod types;

pub use ack::{AckMode, AckPolicy, Acknowledgment};
pub use broker::{BrokerConsumer, KafkaConsumerClient, OffsetCommitMode, OffsetCommitter};
pub use config::{ConsumerConfigBuilder, ContainerConfig, ContainerProperties};
pub use container::{ContainerState, ListenerContainer, ShutdownOutcome};
pub use error::{BrokerError, ContainerError, ListenerError};
pub use listener::{AcknowledgingMessageListener, MessageListener};
pub use rebalance::{RebalanceCoordinator, RebalanceListener};
pub use recovery::{
    BackoffPolicy, ErrorHandler, RecoveryCallback, RecoveryContext, RecoveryOutcome,
    RecoveryPipeline, RetryPolicy,
};
pub use types::{Partition, PartitionOffset};
