use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::message::OwnedMessage;

use crate::ack::Acknowledgment;
use crate::error::ListenerError;

/// User callback processing one record at a time.
///
/// Return `Ok(())` to let the container record the offset as committable,
/// or a classified [`ListenerError`] to route the record through the
/// recovery pipeline.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, record: &OwnedMessage) -> Result<(), ListenerError>;
}

/// User callback that defers offset commits to explicit acknowledgment.
///
/// Only meaningful with the `Manual*` ack modes: the container records the
/// offset as pending before invocation and commits it only once the listener
/// calls [`Acknowledgment::acknowledge`].
#[async_trait]
pub trait AcknowledgingMessageListener: Send + Sync {
    async fn on_message(
        &self,
        record: &OwnedMessage,
        ack: Acknowledgment,
    ) -> Result<(), ListenerError>;
}

/// The single listener bound to a container, set before `start()`.
#[derive(Clone)]
pub enum ListenerBinding {
    Record(Arc<dyn MessageListener>),
    Acknowledging(Arc<dyn AcknowledgingMessageListener>),
}

impl ListenerBinding {
    pub fn is_acknowledging(&self) -> bool {
        matches!(self, Self::Acknowledging(_))
    }
}
