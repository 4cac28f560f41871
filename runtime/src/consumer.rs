//! The long-running consumer: connect, consume, reconnect, stop.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONSUMING -> (connection lost) -> DISCONNECTED
//!                                         \-> (shutdown)        -> STOPPED
//! ```
//!
//! Connection-level failures never escape [`OrderConsumer::run`]: they are
//! logged and retried after a fixed backoff. The only fatal error is a
//! topology mismatch, which no amount of reconnecting can fix.
//!
//! Within a connection, deliveries are processed concurrently. A local
//! semaphore sized to the prefetch count keeps at most that many deliveries
//! in flight, and each task settles its own delivery after the processor has
//! decided the outcome.

use crate::metrics::ConsumerMetrics;
use crate::processor::{Disposition, OrderProcessor, ProcessingError, ProcessingOutcome};
use crate::throughput::ThroughputMeter;
use futures::FutureExt;
use order_ingest_core::{Delivery, QueueError, QueueGateway, QueueSession};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;

/// Lifecycle of the consumer, observable through [`OrderConsumer::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not connected; waiting out the reconnect backoff.
    Disconnected,
    /// Opening a connection and declaring the topology.
    Connecting,
    /// Receiving deliveries.
    Consuming,
    /// The run loop has exited.
    Stopped,
}

impl ConsumerState {
    /// Upper-case name, as exposed by health checks.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Consuming => "CONSUMING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that stop the consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The broker holds queues declared with other parameters.
    #[error("queue topology rejected by the broker: {0}")]
    Topology(QueueError),
}

/// Consumer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries allowed per connection
    pub prefetch: u16,
    /// Fixed wait between connection attempts
    pub reconnect_interval: Duration,
    /// Commits between throughput log lines
    pub throughput_log_interval: u64,
    /// Time allowed for in-flight deliveries on shutdown
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            reconnect_interval: Duration::from_secs(10),
            throughput_log_interval: 1000,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Set the prefetch count (at least 1)
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the reconnect backoff
    #[must_use]
    pub const fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set how many commits separate throughput logs
    #[must_use]
    pub const fn with_throughput_log_interval(mut self, interval: u64) -> Self {
        self.throughput_log_interval = interval;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Background consumer of the orders queue.
///
/// # Example
///
/// ```ignore
/// let (consumer, shutdown) = OrderConsumer::new(gateway, processor, ConsumerConfig::default());
/// let handle = tokio::spawn(consumer.run());
///
/// // later
/// shutdown.send(true).ok();
/// handle.await??;
/// ```
pub struct OrderConsumer {
    gateway: Arc<dyn QueueGateway>,
    processor: Arc<OrderProcessor>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConsumerState>,
    meter: Arc<ThroughputMeter>,
}

impl OrderConsumer {
    /// Creates the consumer and the sender that stops it.
    ///
    /// Send `true` to stop the run loop.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn QueueGateway>,
        processor: Arc<OrderProcessor>,
        config: ConsumerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        let consumer = Self {
            gateway,
            processor,
            meter: Arc::new(ThroughputMeter::new(config.throughput_log_interval)),
            config,
            shutdown: shutdown_rx,
            state,
        };
        (consumer, shutdown_tx)
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Consumer state changed");
        }
    }

    /// Runs until shutdown is signalled.
    ///
    /// # Errors
    ///
    /// [`ConsumerError::Topology`] if the broker rejects the topology.
    pub async fn run(self) -> Result<(), ConsumerError> {
        let mut shutdown = self.shutdown.clone();
        tracing::info!(
            queue = %self.gateway.topology().queue,
            prefetch = self.config.prefetch,
            "Starting order consumer"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            self.set_state(ConsumerState::Connecting);
            let connected = tokio::select! {
                biased;
                () = shutdown_signal(&mut shutdown) => break Ok(()),
                connected = self.gateway.consume(self.config.prefetch) => connected,
            };

            match connected {
                Ok(session) => {
                    self.set_state(ConsumerState::Consuming);
                    self.meter.reset();
                    tracing::info!(
                        queue = %self.gateway.topology().queue,
                        "Connected; consuming orders"
                    );
                    match self.drive(session, &mut shutdown).await {
                        SessionEnd::Shutdown => break Ok(()),
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, "Broker connection lost");
                        }
                    }
                }
                Err(error) if error.is_fatal() => {
                    tracing::error!(error = %error, "Queue topology mismatch; consumer stopping");
                    break Err(ConsumerError::Topology(error));
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Failed to connect to broker");
                }
            }

            self.set_state(ConsumerState::Disconnected);
            ConsumerMetrics::record_reconnect();
            tracing::info!(
                backoff_secs = self.config.reconnect_interval.as_secs(),
                "Reconnecting after backoff"
            );
            tokio::select! {
                biased;
                () = shutdown_signal(&mut shutdown) => break Ok(()),
                () = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        };

        self.set_state(ConsumerState::Stopped);
        tracing::info!(
            committed = self.meter.total(),
            elapsed_ms = self.meter.lifetime().as_millis(),
            "Order consumer stopped"
        );
        result
    }

    /// Consumes one session until it ends.
    async fn drive(
        &self,
        mut session: Box<dyn QueueSession>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let slots = Arc::new(Semaphore::new(usize::from(self.config.prefetch.max(1))));
        let mut tasks = JoinSet::new();

        let end = loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let permit = tokio::select! {
                biased;
                () = shutdown_signal(shutdown) => break SessionEnd::Shutdown,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break SessionEnd::Lost("delivery slots closed".to_string()),
                },
            };

            let next = tokio::select! {
                biased;
                () = shutdown_signal(shutdown) => break SessionEnd::Shutdown,
                next = session.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    tasks.spawn(handle_delivery(
                        Arc::clone(&self.processor),
                        Arc::clone(&self.meter),
                        delivery,
                        permit,
                    ));
                }
                Some(Err(error)) => break SessionEnd::Lost(error.to_string()),
                None => break SessionEnd::Lost("consumer cancelled by broker".to_string()),
            }
        };

        match end {
            SessionEnd::Shutdown => {
                let in_flight = tasks.len();
                if in_flight > 0 {
                    tracing::info!(in_flight, "Waiting for in-flight orders");
                }
                let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                    while let Some(joined) = tasks.join_next().await {
                        log_join_error(joined);
                    }
                })
                .await;
                if drained.is_err() {
                    tracing::warn!(
                        abandoned = tasks.len(),
                        "Shutdown grace elapsed; unacknowledged orders will be redelivered"
                    );
                    tasks.abort_all();
                }
            }
            // Their settlements will fail; the broker redelivers what was not acked.
            SessionEnd::Lost(_) => tasks.detach_all(),
        }

        let sample = self.meter.sample();
        tracing::info!(
            committed = sample.count,
            elapsed_ms = sample.elapsed.as_millis(),
            orders_per_sec = sample.per_second(),
            "Connection throughput"
        );

        if let Err(error) = session.close().await {
            tracing::debug!(error = %error, "Closing broker session failed");
        }
        end
    }
}

/// Processes and settles one delivery, then frees its slot.
async fn handle_delivery(
    processor: Arc<OrderProcessor>,
    meter: Arc<ThroughputMeter>,
    delivery: Delivery,
    permit: OwnedSemaphorePermit,
) {
    ConsumerMetrics::record_started();
    let tag = delivery.tag();

    let outcome = AssertUnwindSafe(processor.process(delivery.body()))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let error = ProcessingError::Panicked(panic_message(panic.as_ref()));
            tracing::error!(
                delivery_tag = tag,
                error = %error,
                payload = %String::from_utf8_lossy(delivery.body()),
                "Order processing panicked"
            );
            ProcessingOutcome::Rejected(error)
        });

    let settled = match outcome.disposition() {
        Disposition::Ack => delivery.ack().await,
        Disposition::DeadLetter => delivery.reject().await,
    };
    if let Err(error) = settled {
        tracing::warn!(
            delivery_tag = tag,
            error = %error,
            "Failed to settle delivery; the broker will redeliver it"
        );
    }

    if matches!(outcome, ProcessingOutcome::Committed(_)) {
        if let Some(sample) = meter.record_commit() {
            tracing::info!(
                committed = sample.count,
                elapsed_ms = sample.elapsed.as_millis(),
                orders_per_sec = sample.per_second(),
                "Consumer throughput"
            );
        }
    }

    ConsumerMetrics::record_finished();
    drop(permit);
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        if !error.is_cancelled() {
            tracing::error!(error = %error, "Delivery task failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
