//! Container lifecycle and the poll loop.
//!
//! A [`ListenerContainer`] owns one broker consumer, one listener binding,
//! and one poll-loop task. Lifecycle transitions happen under a single
//! lifecycle lock; the hot path reads state lock-free from an atomic.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::{debug, error, info, warn};

use crate::ack::{AckMode, AckPolicy, Acknowledgment};
use crate::broker::{BrokerConsumer, OffsetCommitMode, OffsetCommitter};
use crate::config::ContainerProperties;
use crate::error::ContainerError;
use crate::listener::{AcknowledgingMessageListener, ListenerBinding, MessageListener};
use crate::metrics_consts::{OFFSET_COMMITS, OFFSET_COMMIT_FAILURES, RECORDS_PROCESSED};
use crate::rebalance::RebalanceCoordinator;
use crate::recovery::{RecoveryOutcome, RecoveryPipeline};
use crate::types::Partition;

const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

/// Lock-free state cell. Transitions are serialized by the container's
/// lifecycle lock; the poll loop only ever reads.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ContainerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ContainerState {
        match self.0.load(Ordering::SeqCst) {
            0 => ContainerState::Stopped,
            1 => ContainerState::Starting,
            2 => ContainerState::Running,
            _ => ContainerState::Stopping,
        }
    }

    fn store(&self, state: ContainerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// How a bounded `stop()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The poll loop drained, committed, and exited within the timeout.
    Clean,
    /// The timeout elapsed first; state was forced to `Stopped` and the loop
    /// task was abandoned mid-flight.
    TimedOut,
}

struct ContainerInner<C: BrokerConsumer> {
    broker: Arc<C>,
    properties: ContainerProperties,
    ack: Arc<AckPolicy>,
    coordinator: Arc<RebalanceCoordinator>,
    pipeline: RecoveryPipeline,
    state: StateCell,
    /// Poll-loop generation, bumped under the lifecycle lock at each start.
    /// A loop abandoned by a timed-out stop sees a newer generation and
    /// exits instead of racing the replacement loop for the consumer.
    generation: AtomicU64,
    binding: Mutex<Option<ListenerBinding>>,
    stop_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// A managed consumer-group container: subscribes one consumer, drives the
/// bound listener record by record, and owns every offset commit decision.
pub struct ListenerContainer<C: BrokerConsumer> {
    inner: Arc<ContainerInner<C>>,
    lifecycle: Mutex<()>,
}

impl<C: BrokerConsumer> ListenerContainer<C> {
    pub fn new(broker: Arc<C>, properties: ContainerProperties) -> Self {
        let ack = Arc::new(AckPolicy::new(
            properties.ack_mode,
            properties.ack_time,
            properties.ack_count,
        ));
        let coordinator = Arc::new(RebalanceCoordinator::new(
            ack.clone(),
            properties.rebalance_listener.clone(),
        ));
        let pipeline = RecoveryPipeline::new(properties.retry);
        if let Some(callback) = &properties.recovery_callback {
            pipeline.set_recovery(callback.clone());
        }
        Self {
            inner: Arc::new(ContainerInner {
                broker,
                properties,
                ack,
                coordinator,
                pipeline,
                state: StateCell::new(ContainerState::Stopped),
                generation: AtomicU64::new(0),
                binding: Mutex::new(None),
                stop_callbacks: Mutex::new(Vec::new()),
            }),
            lifecycle: Mutex::new(()),
        }
    }

    /// Bind a record listener. Only allowed while stopped.
    pub fn set_listener(&self, listener: Arc<dyn MessageListener>) -> Result<(), ContainerError> {
        self.set_binding(ListenerBinding::Record(listener))
    }

    /// Bind an acknowledging listener for the `Manual*` ack modes. Only
    /// allowed while stopped.
    pub fn set_acknowledging_listener(
        &self,
        listener: Arc<dyn AcknowledgingMessageListener>,
    ) -> Result<(), ContainerError> {
        self.set_binding(ListenerBinding::Acknowledging(listener))
    }

    fn set_binding(&self, binding: ListenerBinding) -> Result<(), ContainerError> {
        let _guard = self.lifecycle.lock().unwrap();
        if self.inner.state.load() != ContainerState::Stopped {
            return Err(ContainerError::MutableWhileRunning);
        }
        *self.inner.binding.lock().unwrap() = Some(binding);
        Ok(())
    }

    /// Subscribe and spawn the poll loop. Idempotent: calling on a container
    /// that is already starting or running is a no-op. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), ContainerError> {
        let _guard = self.lifecycle.lock().unwrap();
        match self.inner.state.load() {
            ContainerState::Running | ContainerState::Starting => {
                debug!(name = %self.inner.properties.name, "Container already running");
                return Ok(());
            }
            ContainerState::Stopping => {
                warn!(
                    name = %self.inner.properties.name,
                    "start() while stopping, ignoring; wait for stop to complete"
                );
                return Ok(());
            }
            ContainerState::Stopped => {}
        }

        let binding = self
            .inner
            .binding
            .lock()
            .unwrap()
            .clone()
            .ok_or(ContainerError::MissingListener)?;
        if self.inner.properties.ack_mode.is_manual() && !binding.is_acknowledging() {
            warn!(
                name = %self.inner.properties.name,
                "Manual ack mode with a non-acknowledging listener; offsets will never commit"
            );
        }

        self.inner
            .pipeline
            .install_default_recovery(self.inner.properties.error_handler.clone());

        self.inner.state.store(ContainerState::Starting);
        if let Err(e) = self
            .inner
            .broker
            .subscribe(&self.inner.properties.topics, self.inner.coordinator.clone())
        {
            self.inner.state.store(ContainerState::Stopped);
            return Err(e.into());
        }
        self.inner.state.store(ContainerState::Running);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            poll_loop(inner, binding, generation).await;
        });

        info!(
            name = %self.inner.properties.name,
            topics = ?self.inner.properties.topics,
            ack_mode = ?self.inner.properties.ack_mode,
            "Listener container started"
        );
        Ok(())
    }

    /// Request a stop and get notified when the loop has fully drained.
    /// On an already-stopped container the callback runs immediately.
    pub fn stop_with_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        let _guard = self.lifecycle.lock().unwrap();
        match self.inner.state.load() {
            ContainerState::Stopped => {
                drop(_guard);
                callback();
            }
            _ => {
                self.inner.stop_callbacks.lock().unwrap().push(callback);
                self.inner.state.store(ContainerState::Stopping);
                info!(name = %self.inner.properties.name, "Listener container stopping");
            }
        }
    }

    /// Stop and wait at most `shutdown_timeout` for the poll loop to finish
    /// in-flight work and commit. A timeout is an outcome, not an error: the
    /// container is forced to `Stopped` and uncommitted work is redelivered
    /// to the group after the next rebalance.
    pub async fn stop(&self) -> ShutdownOutcome {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.stop_with_callback(Box::new(move || {
            let _ = tx.send(());
        }));

        match tokio::time::timeout(self.inner.properties.shutdown_timeout, rx).await {
            Ok(Ok(())) => ShutdownOutcome::Clean,
            _ => {
                warn!(
                    name = %self.inner.properties.name,
                    timeout_ms = self.inner.properties.shutdown_timeout.as_millis() as u64,
                    "Shutdown timed out, forcing stopped state"
                );
                self.inner.state.store(ContainerState::Stopped);
                ShutdownOutcome::TimedOut
            }
        }
    }

    pub fn state(&self) -> ContainerState {
        self.inner.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load() == ContainerState::Running
    }

    pub fn is_auto_startup(&self) -> bool {
        self.inner.properties.auto_startup
    }

    pub fn phase(&self) -> i32 {
        self.inner.properties.phase
    }

    pub fn rebalance_coordinator(&self) -> Arc<RebalanceCoordinator> {
        self.inner.coordinator.clone()
    }

    pub fn ack_policy(&self) -> Arc<AckPolicy> {
        self.inner.ack.clone()
    }
}

async fn poll_loop<C: BrokerConsumer>(
    inner: Arc<ContainerInner<C>>,
    binding: ListenerBinding,
    generation: u64,
) {
    loop {
        if !inner.is_current(generation) {
            break;
        }

        let batch = match inner.broker.poll(inner.properties.poll_timeout).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(name = %inner.properties.name, error = %e, "Broker poll failed");
                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                continue;
            }
        };

        if batch.is_empty() {
            // Idle poll; time-based modes can still become due.
            if inner.ack.should_commit_now() {
                inner.commit_pending(OffsetCommitMode::Async, "interval");
            }
            continue;
        }

        let mut interrupted = false;
        for record in &batch {
            let partition = Partition::new(record.topic().to_string(), record.partition());
            if !inner.coordinator.is_assigned(&partition) {
                warn!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    "Skipping record from unassigned partition"
                );
                continue;
            }

            inner.process_record(&binding, record, &partition).await;

            if !inner.is_current(generation) {
                // Remaining records stay unprocessed and uncommitted; the
                // group redelivers them on the next start.
                interrupted = true;
                break;
            }
            if inner.ack.should_commit_now() {
                inner.commit_pending(OffsetCommitMode::Async, "threshold");
            }
        }

        if !interrupted {
            match inner.ack.mode() {
                // Time-based modes commit only when their window or count
                // threshold is met, no matter where the batch boundary falls.
                AckMode::Time | AckMode::CountTime | AckMode::Manual => {
                    if inner.ack.should_commit_now() {
                        inner.commit_pending(OffsetCommitMode::Async, "threshold");
                    }
                }
                // Immediate modes commit in acknowledge(); their batch-end
                // flush only picks up offsets recorded for recovered records.
                AckMode::Record
                | AckMode::Batch
                | AckMode::Count
                | AckMode::ManualImmediate
                | AckMode::ManualImmediateSync => {
                    inner.commit_pending(OffsetCommitMode::Async, "batch");
                }
            }
        }
    }

    if inner.generation.load(Ordering::SeqCst) != generation {
        // A newer loop owns the consumer now (restart after a timed-out
        // stop). Touching shared state or the broker here would race it.
        debug!(
            name = %inner.properties.name,
            generation,
            "Superseded poll loop exiting"
        );
        return;
    }

    inner.commit_pending(OffsetCommitMode::Sync, "final");
    inner.state.store(ContainerState::Stopped);
    info!(name = %inner.properties.name, "Listener container stopped");

    let callbacks: Vec<_> = inner.stop_callbacks.lock().unwrap().drain(..).collect();
    for callback in callbacks {
        callback();
    }
}

impl<C: BrokerConsumer> ContainerInner<C> {
    fn is_current(&self, generation: u64) -> bool {
        self.state.load() == ContainerState::Running
            && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn process_record(
        &self,
        binding: &ListenerBinding,
        record: &OwnedMessage,
        partition: &Partition,
    ) {
        let offset = record.offset();
        let manual = self.ack.mode().is_manual();
        // Manual modes track the record as pending before invocation so an
        // in-listener acknowledge finds its entry.
        if manual {
            self.ack.record_processed(partition, offset);
        }

        let outcome = match binding {
            ListenerBinding::Record(listener) => {
                self.pipeline
                    .invoke(record, || listener.on_message(record))
                    .await
            }
            ListenerBinding::Acknowledging(listener) => {
                let committer: Arc<dyn OffsetCommitter> = self.broker.clone();
                let ack =
                    Acknowledgment::new(partition.clone(), offset, self.ack.clone(), committer);
                self.pipeline
                    .invoke(record, || listener.on_message(record, ack.clone()))
                    .await
            }
        };

        match outcome {
            RecoveryOutcome::Processed { .. } => {
                if !manual {
                    self.ack.record_processed(partition, offset);
                }
                metrics::counter!(RECORDS_PROCESSED, "outcome" => "processed").increment(1);
            }
            RecoveryOutcome::Recovered { .. } => {
                // A recovered record counts as handled. In manual modes the
                // listener never got to acknowledge it, so close the gap on
                // its behalf or the partition would stall forever.
                if manual {
                    self.ack.acknowledge(partition, offset);
                } else {
                    self.ack.record_processed(partition, offset);
                }
                metrics::counter!(RECORDS_PROCESSED, "outcome" => "recovered").increment(1);
            }
        }
    }

    fn commit_pending(&self, mode: OffsetCommitMode, trigger: &'static str) {
        let offsets = self.ack.take_committable();
        if offsets.is_empty() {
            return;
        }
        match self.broker.commit(&offsets, mode) {
            Ok(()) => {
                metrics::counter!(OFFSET_COMMITS, "trigger" => trigger).increment(1);
                debug!(
                    name = %self.properties.name,
                    partitions = offsets.len(),
                    trigger,
                    "Committed offsets"
                );
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMIT_FAILURES, "trigger" => trigger).increment(1);
                error!(name = %self.properties.name, error = %e, trigger, "Offset commit failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_round_trips_all_states() {
        let cell = StateCell::new(ContainerState::Stopped);
        for state in [
            ContainerState::Starting,
            ContainerState::Running,
            ContainerState::Stopping,
            ContainerState::Stopped,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }
}
