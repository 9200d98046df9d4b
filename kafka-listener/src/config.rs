use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::ack::AckMode;
use crate::error::ContainerError;
use crate::rebalance::RebalanceListener;
use crate::recovery::{BackoffPolicy, ErrorHandler, RecoveryCallback, RetryPolicy};

#[derive(Envconfig, Clone)]
pub struct ContainerConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // We default to "earliest" for this, but if you're bringing up a new
    // service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "batch")]
    pub ack_mode: String,

    #[envconfig(default = "5000")]
    pub ack_time_ms: u64,

    #[envconfig(default = "1")]
    pub ack_count: u32,

    #[envconfig(default = "10000")]
    pub shutdown_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub auto_startup: bool,

    #[envconfig(default = "0")]
    pub phase: i32,

    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(default = "100")]
    pub retry_initial_backoff_ms: u64,

    #[envconfig(default = "2.0")]
    pub retry_backoff_multiplier: f64,

    #[envconfig(default = "5000")]
    pub retry_max_backoff_ms: u64,
}

impl ContainerConfig {
    /// Turn the environment-sourced config into runtime container properties.
    /// Fails on an unrecognized ack mode.
    pub fn container_properties(&self) -> Result<ContainerProperties, ContainerError> {
        let ack_mode: AckMode = self.ack_mode.parse()?;
        Ok(ContainerProperties {
            name: format!("listener-{}", self.kafka_consumer_group),
            topics: vec![self.kafka_consumer_topic.clone()],
            ack_mode,
            ack_time: Duration::from_millis(self.ack_time_ms),
            ack_count: self.ack_count,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            auto_startup: self.auto_startup,
            phase: self.phase,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff: BackoffPolicy::new(
                    Duration::from_millis(self.retry_initial_backoff_ms),
                    self.retry_backoff_multiplier,
                    Duration::from_millis(self.retry_max_backoff_ms),
                ),
            },
            rebalance_listener: None,
            error_handler: None,
            recovery_callback: None,
        })
    }

    /// rdkafka client config with group-consumer defaults.
    pub fn client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .build()
    }
}

/// Kafka consumer configuration builder with group-consumer defaults.
///
/// Offset storing and auto commit are disabled because the container owns
/// every commit decision; session/heartbeat/max.poll get conservative
/// defaults that individual services can override with `set`.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // Group-consumer defaults
        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for the Kafka connection.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset: "earliest" or
    /// "latest".
    pub fn with_offset_reset(mut self, reset: &str) -> Self {
        self.config.set("auto.offset.reset", reset);
        self
    }

    /// Add any custom configuration.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Runtime configuration surface of one listener container.
///
/// Everything here is fixed before `start()`; the optional collaborators
/// (rebalance listener, error handler, recovery callback) default to the
/// container's built-in behaviors when left unset.
#[derive(Clone)]
pub struct ContainerProperties {
    /// Name used in log fields to tell containers apart.
    pub name: String,
    pub topics: Vec<String>,
    pub ack_mode: AckMode,
    pub ack_time: Duration,
    pub ack_count: u32,
    pub shutdown_timeout: Duration,
    pub poll_timeout: Duration,
    /// Ordering hints for environments managing multiple containers; not
    /// part of the lifecycle state machine.
    pub auto_startup: bool,
    pub phase: i32,
    pub retry: RetryPolicy,
    pub rebalance_listener: Option<Arc<dyn RebalanceListener>>,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    pub recovery_callback: Option<Arc<dyn RecoveryCallback>>,
}

impl ContainerProperties {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            name: "listener-container".to_string(),
            topics: vec![topic.into()],
            ack_mode: AckMode::Batch,
            ack_time: Duration::from_secs(5),
            ack_count: 1,
            shutdown_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(1),
            auto_startup: true,
            phase: 0,
            retry: RetryPolicy::default(),
            rebalance_listener: None,
            error_handler: None,
            recovery_callback: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_ack_time(mut self, ack_time: Duration) -> Self {
        self.ack_time = ack_time;
        self
    }

    pub fn with_ack_count(mut self, ack_count: u32) -> Self {
        self.ack_count = ack_count;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    pub fn with_phase(mut self, phase: i32) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rebalance_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.rebalance_listener = Some(listener);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_recovery_callback(mut self, callback: Arc<dyn RecoveryCallback>) -> Self {
        self.recovery_callback = Some(callback);
        self
    }
}
