//! In-memory broker implementing [`QueueGateway`].
//!
//! Models the parts of an AMQP broker the consumer depends on:
//!
//! - a primary queue and a dead-letter queue; `reject` moves a message to the
//!   dead-letter queue
//! - per-connection prefetch: a session is never handed more unacknowledged
//!   messages than its prefetch count
//! - connection loss: [`InMemoryBroker::sever_connections`] drops every open
//!   connection and requeues its unacknowledged messages as redelivered
//! - failure injection for connects and a pre-existing, conflicting topology
//!
//! State changes are broadcast on a `watch` channel so that waiting sessions
//! and [`InMemoryBroker::wait_until`] wake without polling.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use order_ingest_core::{
    Acknowledger, Delivery, QueueError, QueueGateway, QueueSession, QueueTopology,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Connection {
    prefetch: u16,
    unacked: HashMap<u64, Message>,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<Message>,
    dead_letter: Vec<Vec<u8>>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    next_tag: u64,
    declared: bool,
    conflicting: Option<String>,
    unreachable: bool,
    failing_connects: usize,
    published: usize,
    acked: usize,
    connects: usize,
    consume_attempts: Vec<Instant>,
    declarations: usize,
    max_outstanding: usize,
}

impl BrokerState {
    fn declare(&mut self) -> Result<(), QueueError> {
        if let Some(name) = &self.conflicting {
            return Err(QueueError::TopologyMismatch {
                name: name.clone(),
                reason: "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange'"
                    .to_string(),
            });
        }
        self.declared = true;
        self.declarations += 1;
        Ok(())
    }

    fn reachable(&mut self) -> Result<(), QueueError> {
        if self.unreachable {
            return Err(QueueError::ConnectionFailed("connection refused".to_string()));
        }
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(QueueError::ConnectionFailed("injected connect failure".to_string()));
        }
        Ok(())
    }

    fn drop_connection(&mut self, id: u64) {
        if let Some(connection) = self.connections.remove(&id) {
            let mut unacked: Vec<_> = connection.unacked.into_iter().collect();
            unacked.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in unacked.into_iter().rev() {
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            ready: self.ready.len(),
            unacked: self.connections.values().map(|c| c.unacked.len()).sum(),
            dead_lettered: self.dead_letter.len(),
            published: self.published,
            acked: self.acked,
            connects: self.connects,
            declarations: self.declarations,
            open_connections: self.connections.len(),
            max_outstanding: self.max_outstanding,
        }
    }
}

/// Point-in-time counters of an [`InMemoryBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    /// Messages waiting in the primary queue.
    pub ready: usize,
    /// Messages delivered and not yet settled, over all connections.
    pub unacked: usize,
    /// Messages in the dead-letter queue.
    pub dead_lettered: usize,
    /// Messages published through the gateway or injected.
    pub published: usize,
    /// Messages acknowledged.
    pub acked: usize,
    /// Successful consumer connections.
    pub connects: usize,
    /// Successful topology declarations.
    pub declarations: usize,
    /// Connections currently open.
    pub open_connections: usize,
    /// Highest number of unacknowledged messages seen on one connection.
    pub max_outstanding: usize,
}

#[derive(Debug)]
struct Inner {
    topology: QueueTopology,
    state: Mutex<BrokerState>,
    changes: watch::Sender<u64>,
}

impl Inner {
    fn bump(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// In-memory [`QueueGateway`].
///
/// # Example
///
/// ```
/// use order_ingest_core::QueueGateway;
/// use order_ingest_testing::InMemoryBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.publish(br#"{"ExternalId":"A"}"#.to_vec()).await?;
///
/// let mut session = broker.consume(10).await?;
/// let delivery = session.next_delivery().await.unwrap()?;
/// delivery.reject().await?;
///
/// assert_eq!(broker.dead_letters().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty, reachable broker with the default topology
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                topology: QueueTopology::default(),
                state: Mutex::new(BrokerState::default()),
                changes,
            }),
        }
    }

    /// A broker where `name` already exists with different arguments, so
    /// every declaration fails with [`QueueError::TopologyMismatch`].
    #[must_use]
    pub fn with_conflicting_topology(name: &str) -> Self {
        let broker = Self::new();
        broker.inner.state.lock().unwrap().conflicting = Some(name.to_string());
        broker
    }

    /// Make every connection attempt fail until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.state.lock().unwrap().unreachable = unreachable;
        self.inner.bump();
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.state.lock().unwrap().failing_connects = n;
    }

    /// When each consume call was made, failed attempts included.
    #[must_use]
    pub fn consume_attempts(&self) -> Vec<Instant> {
        self.inner.state.lock().unwrap().consume_attempts.clone()
    }

    /// Drops every open connection, as a network partition would.
    ///
    /// Unacknowledged messages go back to the head of the queue flagged as
    /// redelivered; acks issued on the dropped connections fail.
    pub fn sever_connections(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            for id in ids {
                state.drop_connection(id);
            }
        }
        self.inner.bump();
    }

    /// Enqueues a raw body, bypassing validation and publish failures.
    pub fn inject(&self, body: impl Into<Vec<u8>>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.published += 1;
            state.ready.push_back(Message {
                body: body.into(),
                redelivered: false,
            });
        }
        self.inner.bump();
    }

    /// Bodies currently in the dead-letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().unwrap().dead_letter.clone()
    }

    /// Bodies waiting in the primary queue.
    #[must_use]
    pub fn ready_messages(&self) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .ready
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.inner.state.lock().unwrap().stats()
    }

    /// Waits until `condition` holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        condition: impl Fn(&BrokerStats) -> bool,
    ) -> bool {
        let mut changes = self.inner.changes.subscribe();
        let wait = async {
            loop {
                changes.borrow_and_update();
                if condition(&self.stats()) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok() && condition(&self.stats())
    }
}

impl QueueGateway for InMemoryBroker {
    fn topology(&self) -> &QueueTopology {
        &self.inner.topology
    }

    fn declare_topology(&self) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            state.reachable()?;
            state.declare()
        })
    }

    fn publish(
        &self,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.unreachable {
                    return Err(QueueError::PublishFailed {
                        queue: self.inner.topology.queue.clone(),
                        reason: "connection refused".to_string(),
                    });
                }
                if !state.declared {
                    state.declare()?;
                }
                state.published += 1;
                state.ready.push_back(Message {
                    body,
                    redelivered: false,
                });
            }
            self.inner.bump();
            Ok(())
        })
    }

    fn consume(
        &self,
        prefetch: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn QueueSession>, QueueError>> + Send + '_>> {
        Box::pin(async move {
            let id = {
                let mut state = self.inner.state.lock().unwrap();
                state.consume_attempts.push(Instant::now());
                state.reachable()?;
                state.declare()?;
                state.connects += 1;
                let id = state.next_connection;
                state.next_connection += 1;
                state.connections.insert(
                    id,
                    Connection {
                        prefetch: prefetch.max(1),
                        unacked: HashMap::new(),
                    },
                );
                id
            };
            self.inner.bump();

            let session: Box<dyn QueueSession> = Box::new(InMemorySession {
                inner: Arc::clone(&self.inner),
                connection: id,
                changes: self.inner.changes.subscribe(),
            });
            Ok(session)
        })
    }
}

struct InMemorySession {
    inner: Arc<Inner>,
    connection: u64,
    changes: watch::Receiver<u64>,
}

enum Poll {
    Ready(Delivery),
    Lost,
    Wait,
}

impl InMemorySession {
    fn try_take(&self) -> Poll {
        let mut state = self.inner.state.lock().unwrap();
        let (prefetch, outstanding) = match state.connections.get(&self.connection) {
            Some(connection) => (usize::from(connection.prefetch), connection.unacked.len()),
            None => return Poll::Lost,
        };
        if outstanding >= prefetch {
            return Poll::Wait;
        }
        let Some(message) = state.ready.pop_front() else {
            return Poll::Wait;
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery::new(
            tag,
            message.body.clone(),
            message.redelivered,
            InMemoryAcker {
                inner: Arc::clone(&self.inner),
                connection: self.connection,
                tag,
            },
        );
        let outstanding = state
            .connections
            .get_mut(&self.connection)
            .map_or(0, |connection| {
                connection.unacked.insert(tag, message);
                connection.unacked.len()
            });
        state.max_outstanding = state.max_outstanding.max(outstanding);
        Poll::Ready(delivery)
    }
}

impl QueueSession for InMemorySession {
    fn next_delivery(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Delivery, QueueError>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                self.changes.borrow_and_update();
                match self.try_take() {
                    Poll::Ready(delivery) => {
                        self.inner.bump();
                        return Some(Ok(delivery));
                    }
                    Poll::Lost => {
                        return Some(Err(QueueError::ConnectionLost(
                            "connection severed".to_string(),
                        )));
                    }
                    Poll::Wait => {}
                }
                if self.changes.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        Box::pin(async move {
            self.inner.state.lock().unwrap().drop_connection(self.connection);
            self.inner.bump();
            Ok(())
        })
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    connection: u64,
    tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, dead_letter: bool) -> Result<(), QueueError> {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            let message = state
                .connections
                .get_mut(&self.connection)
                .and_then(|connection| connection.unacked.remove(&self.tag));
            match message {
                Some(message) if dead_letter => {
                    state.dead_letter.push(message.body);
                    Ok(())
                }
                Some(_) => {
                    state.acked += 1;
                    Ok(())
                }
                None => Err(QueueError::AcknowledgeFailed {
                    delivery_tag: self.tag,
                    reason: "channel closed".to_string(),
                }),
            }
        };
        self.inner.bump();
        result
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move { self.settle(false) })
    }

    fn reject(&self) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move { self.settle(true) })
    }
}
