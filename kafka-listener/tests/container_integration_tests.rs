//! End-to-end container tests against the in-memory broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;

use kafka_listener::ack::{AckMode, Acknowledgment};
use kafka_listener::broker::OffsetCommitMode;
use kafka_listener::container::{ContainerState, ListenerContainer, ShutdownOutcome};
use kafka_listener::error::{ContainerError, ListenerError};
use kafka_listener::listener::{AcknowledgingMessageListener, MessageListener};
use kafka_listener::recovery::{BackoffPolicy, RetryPolicy};
use kafka_listener::test_utils::{test_record, MockBroker, RecordingErrorHandler};
use kafka_listener::types::{Partition, PartitionOffset};
use kafka_listener::ContainerProperties;

const TOPIC: &str = "events";

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

fn base_properties() -> ContainerProperties {
    setup_tracing();
    ContainerProperties::new(TOPIC)
        .with_poll_timeout(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        backoff: BackoffPolicy::new(Duration::from_millis(1), 1.0, Duration::from_millis(1)),
    }
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Succeeds on every record, counting invocations.
#[derive(Default)]
struct CountingListener {
    seen: AtomicUsize,
}

#[async_trait]
impl MessageListener for CountingListener {
    async fn on_message(&self, _record: &OwnedMessage) -> Result<(), ListenerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails every delivery of one specific offset, succeeds otherwise.
struct FailingListener {
    fail_offset: i64,
    seen: AtomicUsize,
}

#[async_trait]
impl MessageListener for FailingListener {
    async fn on_message(&self, record: &OwnedMessage) -> Result<(), ListenerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if record.offset() == self.fail_offset {
            return Err(ListenerError::retryable(anyhow::anyhow!("bad record")));
        }
        Ok(())
    }
}

/// Stashes every acknowledgment handle instead of acking, so tests control
/// ack order from outside.
#[derive(Default)]
struct StashingListener {
    acks: Mutex<Vec<Acknowledgment>>,
}

impl StashingListener {
    fn stashed(&self) -> Vec<Acknowledgment> {
        self.acks.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcknowledgingMessageListener for StashingListener {
    async fn on_message(
        &self,
        _record: &OwnedMessage,
        ack: Acknowledgment,
    ) -> Result<(), ListenerError> {
        self.acks.lock().unwrap().push(ack);
        Ok(())
    }
}

/// Blocks its first invocation on a gate, passes every later one through.
struct GatedListener {
    gate: Arc<tokio::sync::Notify>,
    entered: Arc<tokio::sync::Notify>,
    first: AtomicBool,
}

#[async_trait]
impl MessageListener for GatedListener {
    async fn on_message(&self, _record: &OwnedMessage) -> Result<(), ListenerError> {
        if !self.first.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        Ok(())
    }
}

/// Signals arrival of the first record, then never returns.
struct BlockingListener {
    started: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl MessageListener for BlockingListener {
    async fn on_message(&self, _record: &OwnedMessage) -> Result<(), ListenerError> {
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn batch(partition: i32, offsets: std::ops::Range<i64>) -> Vec<OwnedMessage> {
    offsets
        .map(|offset| test_record(TOPIC, partition, offset, "payload"))
        .collect()
}

#[tokio::test]
async fn test_batch_mode_commits_last_processed_offset() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..3));

    let container = ListenerContainer::new(broker.clone(), base_properties());
    container
        .set_listener(Arc::new(CountingListener::default()))
        .unwrap();
    container.start().unwrap();

    wait_for("batch commit", || broker.commit_count() >= 1).await;
    assert_eq!(container.stop().await, ShutdownOutcome::Clean);

    let commits = broker.commits();
    assert_eq!(commits[0].1, OffsetCommitMode::Async);
    assert_eq!(
        commits[0].0,
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 2)]
    );
}

#[tokio::test]
async fn test_manual_out_of_order_ack_never_commits_past_a_gap() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..3));

    let properties = base_properties()
        .with_ack_mode(AckMode::Manual)
        .with_ack_count(1);
    let container = ListenerContainer::new(broker.clone(), properties);
    let listener = Arc::new(StashingListener::default());
    container.set_acknowledging_listener(listener.clone()).unwrap();
    container.start().unwrap();

    wait_for("records delivered", || listener.stashed().len() == 3).await;

    // Ack the last record first: the gap at offsets 0..1 must hold commits.
    let acks = listener.stashed();
    acks[2].acknowledge().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.commit_count(), 0);

    acks[0].acknowledge().unwrap();
    acks[1].acknowledge().unwrap();
    wait_for("contiguous prefix commit", || broker.commit_count() >= 1).await;

    let committed = broker.committed();
    assert_eq!(
        committed,
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 2)]
    );
    container.stop().await;
}

#[tokio::test]
async fn test_double_start_subscribes_once() {
    let broker = Arc::new(MockBroker::new());
    let container = ListenerContainer::new(broker.clone(), base_properties());
    container
        .set_listener(Arc::new(CountingListener::default()))
        .unwrap();

    container.start().unwrap();
    container.start().unwrap();

    assert_eq!(broker.subscribe_count(), 1);
    assert!(container.is_running());
    container.stop().await;
}

#[tokio::test]
async fn test_start_without_listener_fails() {
    let broker = Arc::new(MockBroker::new());
    let container = ListenerContainer::new(broker, base_properties());
    assert!(matches!(
        container.start(),
        Err(ContainerError::MissingListener)
    ));
    assert_eq!(container.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn test_binding_is_immutable_while_running() {
    let broker = Arc::new(MockBroker::new());
    let container = ListenerContainer::new(broker, base_properties());
    container
        .set_listener(Arc::new(CountingListener::default()))
        .unwrap();
    container.start().unwrap();

    assert!(matches!(
        container.set_listener(Arc::new(CountingListener::default())),
        Err(ContainerError::MutableWhileRunning)
    ));
    container.stop().await;
}

#[tokio::test]
async fn test_stop_while_stopped_is_a_noop() {
    let broker = Arc::new(MockBroker::new());
    let container = ListenerContainer::new(broker, base_properties());

    let started = Instant::now();
    assert_eq!(container.stop().await, ShutdownOutcome::Clean);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(container.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn test_revocation_commits_acked_prefix_and_discards_the_rest() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..3));
    broker.push_batch(batch(1, 0..2));

    // Thresholds high enough that nothing auto-commits.
    let properties = base_properties()
        .with_ack_mode(AckMode::Manual)
        .with_ack_count(100)
        .with_ack_time(Duration::from_secs(3600));
    let container = ListenerContainer::new(broker.clone(), properties);
    let listener = Arc::new(StashingListener::default());
    container.set_acknowledging_listener(listener.clone()).unwrap();
    container.start().unwrap();

    wait_for("all five records delivered", || {
        listener.stashed().len() == 5
    })
    .await;

    // Partition 0 has offsets 0 and 1 acked with 2 pending; partition 1 has
    // nothing acked.
    let acks = listener.stashed();
    for ack in &acks {
        if ack.partition().partition_number() == 0 && ack.offset() < 2 {
            ack.acknowledge().unwrap();
        }
    }

    let revoked = vec![
        Partition::new(TOPIC.to_string(), 0),
        Partition::new(TOPIC.to_string(), 1),
    ];
    broker.revoke(&revoked);

    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].1, OffsetCommitMode::Sync);
    assert_eq!(
        commits[0].0,
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 1)]
    );
    assert_eq!(container.ack_policy().pending_count(), 0);
    assert_eq!(container.rebalance_coordinator().assigned_count(), 0);
    container.stop().await;
}

#[tokio::test]
async fn test_count_mode_commits_at_threshold_and_batch_end() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..5));

    let properties = base_properties()
        .with_ack_mode(AckMode::Count)
        .with_ack_count(3);
    let container = ListenerContainer::new(broker.clone(), properties);
    container
        .set_listener(Arc::new(CountingListener::default()))
        .unwrap();
    container.start().unwrap();

    wait_for("two commits", || broker.commit_count() >= 2).await;
    container.stop().await;

    let committed = broker.committed();
    assert_eq!(
        committed,
        vec![
            PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 2),
            PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 4),
        ]
    );
}

#[tokio::test]
async fn test_time_mode_holds_commits_until_ack_time_elapses() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..2));

    let properties = base_properties()
        .with_ack_mode(AckMode::Time)
        .with_ack_time(Duration::from_secs(3600));
    let container = ListenerContainer::new(broker.clone(), properties);
    let listener = Arc::new(CountingListener::default());
    container.set_listener(listener.clone()).unwrap();
    container.start().unwrap();

    wait_for("records processed", || {
        listener.seen.load(Ordering::SeqCst) == 2
    })
    .await;

    // Several batch boundaries and idle polls pass; the ack-time window has
    // not elapsed, so nothing may be committed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.commit_count(), 0);

    // The final drain on shutdown still flushes, synchronously.
    assert_eq!(container.stop().await, ShutdownOutcome::Clean);
    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].1, OffsetCommitMode::Sync);
    assert_eq!(
        commits[0].0,
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 1)]
    );
}

#[tokio::test]
async fn test_time_mode_commits_once_ack_time_elapses() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..2));

    let properties = base_properties()
        .with_ack_mode(AckMode::Time)
        .with_ack_time(Duration::from_millis(50));
    let container = ListenerContainer::new(broker.clone(), properties);
    container
        .set_listener(Arc::new(CountingListener::default()))
        .unwrap();
    container.start().unwrap();

    wait_for("time-based commit", || broker.commit_count() >= 1).await;
    assert_eq!(
        broker.committed(),
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 1)]
    );
    container.stop().await;
}

#[tokio::test]
async fn test_restart_after_timed_out_stop_keeps_a_single_poller() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..1));

    let gate = Arc::new(tokio::sync::Notify::new());
    let entered = Arc::new(tokio::sync::Notify::new());
    let properties = base_properties().with_shutdown_timeout(Duration::from_millis(50));
    let container = ListenerContainer::new(broker.clone(), properties);
    container
        .set_listener(Arc::new(GatedListener {
            gate: gate.clone(),
            entered: entered.clone(),
            first: AtomicBool::new(false),
        }))
        .unwrap();
    container.start().unwrap();
    entered.notified().await;

    // The loop is wedged in the listener; stop gives up after the timeout
    // and the restart takes over the consumer.
    assert_eq!(container.stop().await, ShutdownOutcome::TimedOut);
    container.start().unwrap();
    assert_eq!(broker.subscribe_count(), 2);
    assert!(container.is_running());

    // The abandoned loop wakes up, notices it was superseded, and exits
    // without committing or tearing down the restarted container.
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(container.is_running());
    assert_eq!(broker.commit_count(), 0);

    // Only the new loop consumes from here on.
    broker.push_batch(batch(0, 1..2));
    wait_for("commit from the new loop", || broker.commit_count() >= 1).await;
    assert_eq!(
        broker.committed(),
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 1)]
    );
    assert_eq!(broker.commit_count(), 1);
    assert_eq!(container.stop().await, ShutdownOutcome::Clean);
}

#[tokio::test]
async fn test_failed_record_is_recovered_and_the_loop_continues() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..3));

    let handler = Arc::new(RecordingErrorHandler::default());
    let properties = base_properties()
        .with_retry(no_retry())
        .with_error_handler(handler.clone());
    let container = ListenerContainer::new(broker.clone(), properties);
    let listener = Arc::new(FailingListener {
        fail_offset: 1,
        seen: AtomicUsize::new(0),
    });
    container.set_listener(listener.clone()).unwrap();
    container.start().unwrap();

    wait_for("first batch committed", || broker.commit_count() >= 1).await;

    // The failed record was routed to the handler and its offset committed
    // with the rest of the batch.
    assert_eq!(handler.handled(), vec![(TOPIC.to_string(), 0, 1)]);
    assert_eq!(
        broker.committed(),
        vec![PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 2)]
    );

    // The loop keeps consuming after a recovery.
    broker.push_batch(batch(0, 3..4));
    wait_for("second batch committed", || broker.commit_count() >= 2).await;
    assert_eq!(
        broker.committed().last(),
        Some(&PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), 3))
    );
    assert_eq!(listener.seen.load(Ordering::SeqCst), 4);
    container.stop().await;
}

#[tokio::test]
async fn test_stop_times_out_when_a_record_is_stuck() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..1));

    let started = Arc::new(tokio::sync::Notify::new());
    let properties = base_properties().with_shutdown_timeout(Duration::from_millis(50));
    let container = ListenerContainer::new(broker, properties);
    container
        .set_listener(Arc::new(BlockingListener {
            started: started.clone(),
        }))
        .unwrap();
    container.start().unwrap();

    started.notified().await;

    assert_eq!(container.stop().await, ShutdownOutcome::TimedOut);
    assert_eq!(container.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn test_commit_failures_do_not_stop_the_loop() {
    let broker = Arc::new(MockBroker::new());
    broker.push_batch(batch(0, 0..2));
    broker.set_fail_commits(true);

    let container = ListenerContainer::new(broker.clone(), base_properties());
    let listener = Arc::new(CountingListener::default());
    container.set_listener(listener.clone()).unwrap();
    container.start().unwrap();

    wait_for("first batch processed", || {
        listener.seen.load(Ordering::SeqCst) == 2
    })
    .await;
    assert!(container.is_running());

    broker.set_fail_commits(false);
    broker.push_batch(batch(0, 2..3));
    wait_for("commit after broker recovers", || broker.commit_count() >= 1).await;
    container.stop().await;
}
