use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    clients::broker::{Broker, Subscription},
    models::{message::InboundMessage, topology::TopologyConfig},
};

const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    redelivered: bool,
    deaths: HashMap<String, u32>,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
struct QueueSpec {
    dead_letter: Option<(String, String)>,
    ttl: Option<Duration>,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
    enqueued_total: u64,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, HashMap<String, Vec<String>>>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_message_id: u64,
    next_delivery_tag: u64,
    closed: bool,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, Error> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let bindings = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| anyhow!("Exchange '{}' does not exist", exchange))?;

        Ok(bindings.get(routing_key).cloned().unwrap_or_default())
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker with RabbitMQ's direct-exchange, dead-lettering and
/// per-queue TTL semantics. Used for local runs and tests.
///
/// TTL expiry runs on tokio timers, so tests with a paused clock can step
/// through the retry loop deterministically.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Ready messages in `queue`, excluding unacknowledged deliveries.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages ever routed into `queue`.
    pub fn enqueued_total(&self, queue: &str) -> u64 {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.enqueued_total)
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.state().unacked.len()
    }

    /// Ends every open subscription.
    pub fn close(&self) {
        self.inner.state().closed = true;
        self.inner.notify.notify_waiters();
    }

    fn declare_queue(&self, name: &str, spec: QueueSpec) -> Result<(), Error> {
        let mut state = self.inner.state();

        match state.queues.get(name) {
            Some(existing) if existing.spec != spec => Err(anyhow!(
                "Queue '{}' already exists with different arguments",
                name
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        spec,
                        messages: VecDeque::new(),
                        enqueued_total: 0,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        let mut state = self.inner.state();
        let queues = state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .entry(routing_key.to_string())
            .or_default();

        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
    }

    /// Routes `message` through `exchange` and schedules TTL expiry for every
    /// queue it lands in.
    fn deliver_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, Error> {
        let mut expiries = Vec::new();

        let routed = {
            let mut state = self.inner.state();
            let targets = state.route(exchange, routing_key)?;

            for target in &targets {
                let mut copy = message.clone();
                copy.routing_key = routing_key.to_string();

                if let Some(queue) = state.queues.get_mut(target) {
                    if let Some(ttl) = queue.spec.ttl {
                        expiries.push((target.clone(), copy.id, ttl));
                    }
                    queue.messages.push_back(copy);
                    queue.enqueued_total += 1;
                }
            }

            targets.len()
        };

        for (queue, message_id, ttl) in expiries {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue, message_id);
            });
        }

        if routed > 0 {
            self.inner.notify.notify_waiters();
        }

        Ok(routed)
    }

    fn expire(&self, queue: &str, message_id: u64) {
        let expired = {
            let mut state = self.inner.state();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(position) = queue_state.messages.iter().position(|m| m.id == message_id)
            else {
                return;
            };
            let message = queue_state.messages.remove(position);
            message.map(|m| (m, queue_state.spec.dead_letter.clone()))
        };

        if let Some((message, dead_letter)) = expired {
            debug!(queue, message_id, "Message expired");
            self.dead_letter(queue, message, dead_letter);
        }
    }

    fn dead_letter(
        &self,
        source_queue: &str,
        mut message: StoredMessage,
        dead_letter: Option<(String, String)>,
    ) {
        let Some((exchange, routing_key)) = dead_letter else {
            debug!(queue = source_queue, "Message discarded, no dead-letter exchange");
            return;
        };

        *message.deaths.entry(source_queue.to_string()).or_insert(0) += 1;
        message.redelivered = false;

        if let Err(e) = self.deliver_to_exchange(&exchange, &routing_key, message) {
            warn!(queue = source_queue, error = %e, "Dead-lettering failed");
        }
    }

    fn take_next(&self, queue: &str) -> Option<InboundMessage> {
        let mut state = self.inner.state();
        let message = state.queues.get_mut(queue)?.messages.pop_front()?;

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let inbound = InboundMessage {
            delivery_tag,
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            death_count: message.deaths.get(queue).copied().unwrap_or(0),
            data: message.data.clone(),
        };

        state
            .unacked
            .insert(delivery_tag, (queue.to_string(), message));

        Some(inbound)
    }
}

struct InMemorySubscription {
    broker: InMemoryBroker,
    queue: String,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, Error>> {
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.broker.take_next(&self.queue) {
                return Some(Ok(message));
            }

            if self.broker.inner.state().closed {
                return None;
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_topology(&self, topology: &TopologyConfig) -> Result<(), Error> {
        self.inner
            .state()
            .exchanges
            .entry(topology.exchange.clone())
            .or_default();

        self.declare_queue(
            &topology.main_queue,
            QueueSpec {
                dead_letter: Some((
                    topology.exchange.clone(),
                    topology.retry_routing_key.clone(),
                )),
                ttl: None,
            },
        )?;
        self.declare_queue(
            &topology.retry_queue,
            QueueSpec {
                dead_letter: Some((
                    topology.exchange.clone(),
                    topology.main_routing_key.clone(),
                )),
                ttl: Some(topology.retry_ttl),
            },
        )?;

        self.bind(
            &topology.main_queue,
            &topology.exchange,
            &topology.main_routing_key,
        );
        self.bind(
            &topology.retry_queue,
            &topology.exchange,
            &topology.retry_routing_key,
        );

        if let Some(parking_queue) = &topology.parking_queue {
            self.declare_queue(
                parking_queue,
                QueueSpec {
                    dead_letter: None,
                    ttl: None,
                },
            )?;
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let message = {
            let mut state = self.inner.state();
            state.next_message_id += 1;
            StoredMessage {
                id: state.next_message_id,
                routing_key: routing_key.to_string(),
                redelivered: false,
                deaths: HashMap::new(),
                data: payload.to_vec(),
            }
        };

        let routed = self.deliver_to_exchange(exchange, routing_key, message)?;
        if routed == 0 {
            return Err(anyhow!(
                "Message to '{}' with routing key '{}' was unroutable",
                exchange,
                routing_key
            ));
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Box<dyn Subscription>, Error> {
        if !self.inner.state().queues.contains_key(queue) {
            return Err(anyhow!("Queue '{}' does not exist", queue));
        }

        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.inner
            .state()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| anyhow!("Unknown delivery tag {}", delivery_tag))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        let (queue, mut message, dead_letter) = {
            let mut state = self.inner.state();
            let (queue, message) = state
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| anyhow!("Unknown delivery tag {}", delivery_tag))?;
            let dead_letter = state
                .queues
                .get(&queue)
                .and_then(|q| q.spec.dead_letter.clone());
            (queue, message, dead_letter)
        };

        if requeue {
            message.redelivered = true;
            if let Some(queue_state) = self.inner.state().queues.get_mut(&queue) {
                queue_state.messages.push_front(message);
            }
            self.inner.notify.notify_waiters();
            return Ok(());
        }

        self.dead_letter(&queue, message, dead_letter);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        if self.inner.state().closed {
            Err(anyhow!("In-memory broker is closed"))
        } else {
            Ok(())
        }
    }
}
