//! Listener invocation with retry, backoff, and terminal recovery.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::{error, warn};

use crate::error::ListenerError;
use crate::metrics_consts::{LISTENER_RETRIES, RECORDS_RECOVERED};

/// Exponential backoff between listener retry attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let pow = self.multiplier.powi(attempt as i32);
        let scaled = if pow.is_finite() {
            self.initial_delay.mul_f64(pow)
        } else {
            self.max_delay
        };
        scaled.min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// How many times a retryable failure is re-attempted, and how.
///
/// `max_retries` counts re-invocations after the initial attempt; zero means
/// a single invocation before the failure is routed to recovery.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Everything a recovery callback may key its logic on: the failed record,
/// the last error thrown, and how many invocations were attempted.
pub struct RecoveryContext<'a> {
    pub record: &'a OwnedMessage,
    pub error: &'a ListenerError,
    pub attempts: u32,
}

/// Terminal recovery behavior, invoked once retries are exhausted (or the
/// failure was non-retryable). After it returns the record counts as handled.
pub trait RecoveryCallback: Send + Sync {
    fn recover(&self, ctx: RecoveryContext<'_>);
}

/// Pluggable sink for terminally failed records.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &ListenerError, record: &OwnedMessage);
}

/// Default recovery: route to the configured error handler, or log at error
/// severity when none is configured. Either way the record is skipped rather
/// than reprocessed forever.
struct DefaultRecovery {
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl RecoveryCallback for DefaultRecovery {
    fn recover(&self, ctx: RecoveryContext<'_>) {
        match &self.error_handler {
            Some(handler) => handler.handle(ctx.error, ctx.record),
            None => {
                error!(
                    topic = ctx.record.topic(),
                    partition = ctx.record.partition(),
                    offset = ctx.record.offset(),
                    attempts = ctx.attempts,
                    error = ?ctx.error,
                    "Listener failed and no error handler is configured, skipping record"
                );
            }
        }
    }
}

/// Result of driving one record through the pipeline. Both variants mean the
/// record is handled and its offset may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The listener returned successfully (possibly after retries).
    Processed { attempts: u32 },
    /// Retries were exhausted or the failure was non-retryable; the recovery
    /// callback ran and the record is skipped.
    Recovered { attempts: u32 },
}

/// Wraps listener invocation with retry/backoff and terminal recovery.
pub struct RecoveryPipeline {
    retry: RetryPolicy,
    recovery: Mutex<Option<Arc<dyn RecoveryCallback>>>,
}

impl RecoveryPipeline {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            recovery: Mutex::new(None),
        }
    }

    /// Install a custom recovery behavior at configuration time.
    pub fn set_recovery(&self, callback: Arc<dyn RecoveryCallback>) {
        *self.recovery.lock().unwrap() = Some(callback);
    }

    /// Install the default log-or-error-handler recovery if the caller never
    /// configured one. Called on every container start; only the first call
    /// on an unconfigured pipeline has an effect.
    pub(crate) fn install_default_recovery(&self, error_handler: Option<Arc<dyn ErrorHandler>>) {
        let mut recovery = self.recovery.lock().unwrap();
        if recovery.is_none() {
            *recovery = Some(Arc::new(DefaultRecovery { error_handler }));
        }
    }

    pub fn has_recovery(&self) -> bool {
        self.recovery.lock().unwrap().is_some()
    }

    /// Drive one record through the listener with retry and recovery.
    ///
    /// `attempt` performs a single listener invocation; it is re-called for
    /// every retry. Retries happen synchronously in the caller's context so
    /// offset order stays coupled to listener completion order.
    pub async fn invoke<F, Fut>(&self, record: &OwnedMessage, mut attempt: F) -> RecoveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ListenerError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match attempt().await {
                Ok(()) => return RecoveryOutcome::Processed { attempts },
                Err(error) => {
                    if error.is_retryable() && attempts <= self.retry.max_retries {
                        let delay = self.retry.backoff.next_delay(attempts - 1);
                        warn!(
                            topic = record.topic(),
                            partition = record.partition(),
                            offset = record.offset(),
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = ?error,
                            "Listener failed, retrying"
                        );
                        metrics::counter!(LISTENER_RETRIES).increment(1);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.recover(record, &error, attempts);
                    return RecoveryOutcome::Recovered { attempts };
                }
            }
        }
    }

    fn recover(&self, record: &OwnedMessage, error: &ListenerError, attempts: u32) {
        let callback = self.recovery.lock().unwrap().clone();
        match callback {
            Some(callback) => callback.recover(RecoveryContext {
                record,
                error,
                attempts,
            }),
            None => {
                // start() installs a default before the loop runs; this only
                // triggers when the pipeline is driven standalone.
                error!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    error = ?error,
                    "Listener failed with no recovery behavior installed, skipping record"
                );
            }
        }
        metrics::counter!(RECORDS_RECOVERED).increment(1);
    }
}
