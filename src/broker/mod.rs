// ============================================================================
// In-process acknowledgement-capable broker
// ============================================================================
//
// A small durable-queue core with AMQP-shaped semantics:
// - topic/fanout exchanges with pattern bindings
// - per-queue dead-letter wiring and message TTL
// - publisher confirms and mandatory returns, delivered asynchronously
// - consumer handles with a prefetch window and manual ack/nack
//
// Publishers and consumers in this crate talk only to this boundary; any
// durable, acknowledgement-capable queue with a dead-letter mechanism can
// stand in behind the same surface.
//
// ============================================================================

pub mod routing;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::config::BrokerConfig;
use crate::message::DeliveryMode;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
}

/// Queue declaration arguments (dead-letter wiring + TTL)
#[derive(Debug, Clone, Default)]
pub struct QueueArgs {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
}

/// Broker acknowledged (or rejected) persistence of a publish
#[derive(Debug, Clone)]
pub struct ConfirmEvent {
    pub correlation_id: String,
    pub ack: bool,
    pub cause: Option<String>,
}

/// Broker could not route a mandatory publish to any queue
#[derive(Debug, Clone)]
pub struct ReturnEvent {
    pub exchange: String,
    pub routing_key: String,
    pub reply_text: String,
    pub correlation_id: String,
}

/// Asynchronous publish outcomes; consumed by the publisher's listener tasks
pub struct BrokerEvents {
    pub confirms: mpsc::UnboundedReceiver<ConfirmEvent>,
    pub returns: mpsc::UnboundedReceiver<ReturnEvent>,
}

#[derive(Debug, Clone)]
pub struct Publication {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub delivery_mode: DeliveryMode,
    /// Mandatory publishes raise a return event when unroutable
    pub mandatory: bool,
}

/// A message handed to a consumer, unacked until `ack`/`nack`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    correlation_id: String,
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    delivery_mode: DeliveryMode,
    enqueued_at: Instant,
    redelivered: bool,
}

struct QueueState {
    args: QueueArgs,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    /// consumer id -> delivery tag -> (queue, message)
    unacked: HashMap<u64, HashMap<u64, (String, StoredMessage)>>,
}

struct Shared {
    state: Mutex<BrokerState>,
    /// Woken on publish and on ack (a prefetch slot freed up)
    notify: Notify,
    confirm_tx: mpsc::UnboundedSender<ConfirmEvent>,
    return_tx: mpsc::UnboundedSender<ReturnEvent>,
    next_tag: AtomicU64,
    next_consumer_id: AtomicU64,
}

#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    pub fn new() -> (Self, BrokerEvents) {
        let (confirm_tx, confirms) = mpsc::unbounded_channel();
        let (return_tx, returns) = mpsc::unbounded_channel();

        let broker = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                confirm_tx,
                return_tx,
                next_tag: AtomicU64::new(1),
                next_consumer_id: AtomicU64::new(1),
            }),
        };
        (broker, BrokerEvents { confirms, returns })
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        let mut state = self.shared.state.lock().await;
        state.exchanges.insert(name.to_string(), kind);
    }

    pub async fn declare_queue(&self, name: &str, args: QueueArgs) {
        let mut state = self.shared.state.lock().await;
        state.queues.entry(name.to_string()).or_insert(QueueState {
            args,
            ready: VecDeque::new(),
        });
    }

    pub async fn bind_queue(&self, exchange: &str, queue: &str, pattern: &str) {
        let mut state = self.shared.state.lock().await;
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        });
    }

    /// Declare the reference chat topology: one durable topic exchange, the
    /// broadcast and private queues (dead-letter wiring + TTL), and the
    /// fanout dead-letter exchange with its queue.
    pub async fn install_topology(&self, config: &BrokerConfig) {
        self.declare_exchange(&config.exchange, ExchangeKind::Topic)
            .await;
        self.declare_exchange(&config.dead_letter.exchange, ExchangeKind::Fanout)
            .await;

        let work_queue_args = QueueArgs {
            dead_letter_exchange: Some(config.dead_letter.exchange.clone()),
            dead_letter_routing_key: Some(config.dead_letter.routing_key.clone()),
            message_ttl: Some(Duration::from_millis(config.message_ttl_ms)),
        };
        self.declare_queue(&config.general_queue, work_queue_args.clone())
            .await;
        self.declare_queue(&config.private_queue, work_queue_args)
            .await;
        self.declare_queue(&config.dead_letter.queue, QueueArgs::default())
            .await;

        self.bind_queue(&config.exchange, &config.general_queue, &config.general_pattern)
            .await;
        self.bind_queue(&config.exchange, &config.private_queue, &config.private_pattern)
            .await;
        self.bind_queue(
            &config.dead_letter.exchange,
            &config.dead_letter.queue,
            &config.dead_letter.routing_key,
        )
        .await;

        tracing::info!(
            exchange = %config.exchange,
            general_queue = %config.general_queue,
            private_queue = %config.private_queue,
            dead_letter_exchange = %config.dead_letter.exchange,
            "Broker topology installed"
        );
    }

    /// Publish a message.
    ///
    /// Routing happens synchronously; the confirm (and a return, for an
    /// unroutable mandatory publish) arrive on the event channels so the
    /// caller never blocks on the outcome.
    pub async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().await;

        if !state.exchanges.contains_key(&publication.exchange) {
            let _ = self.shared.confirm_tx.send(ConfirmEvent {
                correlation_id: publication.correlation_id.clone(),
                ack: false,
                cause: Some(format!("unknown exchange: {}", publication.exchange)),
            });
            return Err(BrokerError::UnknownExchange(publication.exchange));
        }

        let message = StoredMessage {
            correlation_id: publication.correlation_id.clone(),
            exchange: publication.exchange.clone(),
            routing_key: publication.routing_key.clone(),
            payload: publication.payload,
            delivery_mode: publication.delivery_mode,
            enqueued_at: Instant::now(),
            redelivered: false,
        };

        let routed = Self::route_locked(
            &mut state,
            &publication.exchange,
            &publication.routing_key,
            message,
        );

        if routed == 0 && publication.mandatory {
            let _ = self.shared.return_tx.send(ReturnEvent {
                exchange: publication.exchange.clone(),
                routing_key: publication.routing_key.clone(),
                reply_text: "NO_ROUTE".to_string(),
                correlation_id: publication.correlation_id.clone(),
            });
        }

        // A returned message was still accepted by the broker
        let _ = self.shared.confirm_tx.send(ConfirmEvent {
            correlation_id: publication.correlation_id,
            ack: true,
            cause: None,
        });

        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Create a consumer over `queues` holding at most `prefetch` unacked
    /// deliveries at a time.
    pub async fn consumer(&self, queues: Vec<String>, prefetch: u32) -> BrokerConsumer {
        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock().await;
        state.unacked.insert(id, HashMap::new());
        BrokerConsumer {
            broker: self.clone(),
            id,
            queues,
            prefetch,
        }
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        let state = self.shared.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    pub async fn queue_count(&self) -> usize {
        self.shared.state.lock().await.queues.len()
    }

    /// Route a message into every queue bound with a matching pattern.
    /// Returns the number of queues the message landed in.
    fn route_locked(
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> usize {
        let kind = match state.exchanges.get(exchange) {
            Some(kind) => *kind,
            None => return 0,
        };

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => routing::topic_matches(&b.pattern, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();

        let mut routed = 0;
        for queue_name in targets {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(message.clone());
                routed += 1;
            }
        }
        routed
    }

    /// Move an expired or rejected message to its queue's dead-letter
    /// exchange; dropped when the queue has no dead-letter wiring.
    fn dead_letter_locked(state: &mut BrokerState, queue_name: &str, mut message: StoredMessage) {
        let (dlx, dlrk) = match state.queues.get(queue_name) {
            Some(queue) => (
                queue.args.dead_letter_exchange.clone(),
                queue.args.dead_letter_routing_key.clone(),
            ),
            None => (None, None),
        };

        match dlx {
            Some(exchange) => {
                let routing_key = dlrk.unwrap_or_else(|| message.routing_key.clone());
                tracing::debug!(
                    correlation_id = %message.correlation_id,
                    queue = %queue_name,
                    dead_letter_exchange = %exchange,
                    "Routing message to dead-letter exchange"
                );
                message.enqueued_at = Instant::now();
                Self::route_locked(state, &exchange, &routing_key, message);
            }
            None => {
                tracing::warn!(
                    correlation_id = %message.correlation_id,
                    queue = %queue_name,
                    "Dropping message: queue has no dead-letter exchange"
                );
            }
        }
    }
}

/// Consumer handle bound to a set of queues.
///
/// `recv` blocks until a delivery is available and the prefetch window has
/// room; every delivery must be settled exactly once with `ack` or `nack`.
pub struct BrokerConsumer {
    broker: Broker,
    id: u64,
    queues: Vec<String>,
    prefetch: u32,
}

impl BrokerConsumer {
    pub async fn recv(&self) -> Delivery {
        loop {
            // register for wakeups before checking, so a publish landing
            // between the check and the await is not missed
            let notified = self.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_recv().await {
                return delivery;
            }
            notified.await;
        }
    }

    /// Non-blocking pull; also applies queue TTL, dead-lettering expired
    /// heads instead of delivering them.
    pub async fn try_recv(&self) -> Option<Delivery> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock().await;

        let outstanding = state
            .unacked
            .get(&self.id)
            .map(|m| m.len() as u32)
            .unwrap_or(0);
        if outstanding >= self.prefetch {
            return None;
        }

        let now = Instant::now();
        for queue_name in &self.queues {
            loop {
                let (message, expired) = {
                    let queue = match state.queues.get_mut(queue_name) {
                        Some(q) => q,
                        None => break,
                    };
                    let ttl = queue.args.message_ttl;
                    match queue.ready.pop_front() {
                        Some(message) => {
                            let expired = ttl
                                .map(|ttl| now.duration_since(message.enqueued_at) >= ttl)
                                .unwrap_or(false);
                            (message, expired)
                        }
                        None => break,
                    }
                };

                if expired {
                    tracing::info!(
                        correlation_id = %message.correlation_id,
                        queue = %queue_name,
                        "Message TTL expired"
                    );
                    Broker::dead_letter_locked(&mut state, queue_name, message);
                    continue;
                }

                let tag = shared.next_tag.fetch_add(1, Ordering::SeqCst);
                let delivery = Delivery {
                    tag,
                    queue: queue_name.clone(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    correlation_id: message.correlation_id.clone(),
                    payload: message.payload.clone(),
                    redelivered: message.redelivered,
                };
                state
                    .unacked
                    .entry(self.id)
                    .or_default()
                    .insert(tag, (queue_name.clone(), message));
                return Some(delivery);
            }
        }
        None
    }

    /// Settle a delivery as processed
    pub async fn ack(&self, tag: u64) {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock().await;
        if let Some(pending) = state.unacked.get_mut(&self.id) {
            if pending.remove(&tag).is_none() {
                tracing::warn!(tag = tag, "Ack for unknown delivery tag");
            }
        }
        drop(state);
        // A prefetch slot freed up
        shared.notify.notify_waiters();
    }

    /// Reject a delivery; requeued at the front (redelivered) or routed to
    /// the queue's dead-letter exchange.
    pub async fn nack(&self, tag: u64, requeue: bool) {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock().await;
        let entry = state
            .unacked
            .get_mut(&self.id)
            .and_then(|pending| pending.remove(&tag));

        if let Some((queue_name, mut message)) = entry {
            if requeue {
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    queue.ready.push_front(message);
                }
            } else {
                Broker::dead_letter_locked(&mut state, &queue_name, message);
            }
        }
        drop(state);
        shared.notify.notify_waiters();
    }

    /// Number of unacked deliveries this consumer is holding
    pub async fn outstanding(&self) -> usize {
        let state = self.broker.shared.state.lock().await;
        state.unacked.get(&self.id).map(|m| m.len()).unwrap_or(0)
    }
}
