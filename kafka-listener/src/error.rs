use rdkafka::error::KafkaError;
use thiserror::Error;

/// Fatal configuration errors surfaced by container setup and `start()`.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("no message listener configured, cannot start container")]
    MissingListener,

    #[error("unknown ack mode '{0}'")]
    InvalidAckMode(String),

    #[error("container is not stopped, configuration is immutable")]
    MutableWhileRunning,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Errors returned by a broker client: poll failures or rejected commits.
///
/// Commit failures are logged and survived everywhere except a
/// `ManualImmediateSync` acknowledgment, where they propagate to the caller
/// of [`Acknowledgment::acknowledge`](crate::ack::Acknowledgment::acknowledge).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A listener invocation failure, classified for the recovery pipeline.
///
/// `Retryable` failures are retried per the container's retry policy before
/// being routed to recovery; `Fatal` failures skip retries entirely.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("retryable listener failure: {0}")]
    Retryable(#[source] anyhow::Error),

    #[error("non-retryable listener failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl ListenerError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_error_classification() {
        let transient = ListenerError::retryable(anyhow::anyhow!("downstream 503"));
        assert!(transient.is_retryable());

        let fatal = ListenerError::fatal(anyhow::anyhow!("malformed payload"));
        assert!(!fatal.is_retryable());
    }
}
