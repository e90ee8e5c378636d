use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use fitness_service::{
    clients::{
        broker::{Broker, Subscription},
        memory::InMemoryBroker,
    },
    consumer::{NotificationConsumer, spawn_workers},
    models::{
        message::{InboundMessage, ParkedMessage},
        status::DeliveryOutcome,
        topology::TopologyConfig,
    },
    producer::NotificationProducer,
    trace::TraceContext,
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::common::{
    RETRY_TTL, ScriptedDeliverer, declared_broker, parking_topology, sample_command,
    test_topology,
};

async fn next(subscription: &mut Box<dyn Subscription>) -> Result<InboundMessage> {
    subscription
        .next_message()
        .await
        .ok_or_else(|| anyhow!("subscription closed"))?
}

fn producer(broker: &InMemoryBroker, topology: &TopologyConfig) -> NotificationProducer {
    NotificationProducer::new(Arc::new(broker.clone()), topology)
}

/// Polls until `done` holds, letting the paused clock advance in small steps.
async fn wait_until(mut done: impl FnMut() -> bool, limit: Duration) -> Result<()> {
    let step = RETRY_TTL / 10;
    let mut waited = Duration::ZERO;
    while !done() {
        if waited >= limit {
            return Err(anyhow!("condition not met within {:?}", limit));
        }
        sleep(step).await;
        waited += step;
    }
    Ok(())
}

/// Test: a rejected message is held in the retry queue for the full TTL and
/// then comes back to the main queue
#[tokio::test(start_paused = true)]
async fn test_rejected_message_returns_after_ttl() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    producer(&broker, &topology)
        .publish(&sample_command("runner@example.com"))
        .await?;

    let mut subscription = broker.subscribe(&topology.main_queue, "test").await?;
    let first = next(&mut subscription).await?;
    assert_eq!(first.death_count, 0);
    broker.reject(first.delivery_tag, false).await?;

    assert_eq!(broker.queue_depth(&topology.main_queue), 0);
    assert_eq!(broker.queue_depth(&topology.retry_queue), 1);

    let early = timeout(RETRY_TTL - Duration::from_millis(1), next(&mut subscription)).await;
    assert!(early.is_err(), "redelivered before the retry TTL elapsed");

    let second = timeout(Duration::from_millis(10), next(&mut subscription)).await??;
    assert_eq!(second.death_count, 1);
    assert_eq!(second.data, first.data);
    assert_eq!(broker.queue_depth(&topology.retry_queue), 0);

    Ok(())
}

/// Test: an acknowledged message never comes back
#[tokio::test(start_paused = true)]
async fn test_acknowledged_message_is_not_redelivered() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    producer(&broker, &topology)
        .publish(&sample_command("runner@example.com"))
        .await?;

    let mut subscription = broker.subscribe(&topology.main_queue, "test").await?;
    let message = next(&mut subscription).await?;
    broker.acknowledge(message.delivery_tag).await?;

    let again = timeout(RETRY_TTL * 10, next(&mut subscription)).await;
    assert!(again.is_err());
    assert_eq!(broker.enqueued_total(&topology.main_queue), 1);
    assert_eq!(broker.enqueued_total(&topology.retry_queue), 0);
    assert_eq!(broker.unacked_count(), 0);

    Ok(())
}

/// Test: a command that fails twice and then succeeds re-enters the main
/// queue exactly twice, each attempt at least one TTL after the previous
#[tokio::test(start_paused = true)]
async fn test_fail_twice_then_deliver() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let deliverer = ScriptedDeliverer::failing(2);
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        deliverer.clone(),
        &topology,
    );

    let shutdown = CancellationToken::new();
    let worker = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run("worker-0", shutdown).await })
    };

    let command = sample_command("runner@example.com");
    producer(&broker, &topology).publish(&command).await?;

    wait_until(|| deliverer.attempt_count() >= 3, RETRY_TTL * 5).await?;

    // Nothing further happens once the command is acknowledged.
    sleep(RETRY_TTL * 10).await;
    shutdown.cancel();
    worker.await?;

    let attempts = deliverer.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.command_id == command.id));
    for pair in attempts.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= RETRY_TTL);
    }

    assert_eq!(broker.enqueued_total(&topology.main_queue), 3);
    assert_eq!(broker.enqueued_total(&topology.retry_queue), 2);
    assert_eq!(broker.queue_depth(&topology.main_queue), 0);
    assert_eq!(broker.queue_depth(&topology.retry_queue), 0);
    assert_eq!(broker.unacked_count(), 0);

    Ok(())
}

/// Test: without an attempt limit a command that never succeeds keeps
/// cycling
#[tokio::test(start_paused = true)]
async fn test_unbounded_retry_keeps_cycling() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let deliverer = ScriptedDeliverer::always_failing();
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        deliverer.clone(),
        &topology,
    );

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, 1, shutdown.clone());

    producer(&broker, &topology)
        .publish(&sample_command("runner@example.com"))
        .await?;

    wait_until(|| deliverer.attempt_count() >= 6, RETRY_TTL * 10).await?;
    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }

    assert!(broker.enqueued_total(&topology.retry_queue) >= 5);
    assert_eq!(broker.queue_depth(&topology.main_queue), 0);

    Ok(())
}

/// Test: with an attempt limit the command is parked after the last failure
/// instead of looping
#[tokio::test(start_paused = true)]
async fn test_attempt_limit_parks_command() -> Result<()> {
    let topology = parking_topology();
    let parking_queue = topology.parking_queue.clone().unwrap();
    let broker = declared_broker(&topology).await?;
    let deliverer = ScriptedDeliverer::always_failing();
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        deliverer.clone(),
        &topology,
    )
    .with_attempt_limit(&topology, 3);

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, 1, shutdown.clone());

    let command = sample_command("runner@example.com");
    producer(&broker, &topology).publish(&command).await?;

    wait_until(|| broker.queue_depth(&parking_queue) == 1, RETRY_TTL * 10).await?;
    sleep(RETRY_TTL * 5).await;
    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }

    assert_eq!(deliverer.attempt_count(), 3);
    assert_eq!(broker.enqueued_total(&topology.retry_queue), 2);
    assert_eq!(broker.queue_depth(&topology.main_queue), 0);
    assert_eq!(broker.unacked_count(), 0);

    let mut subscription = broker.subscribe(&parking_queue, "inspector").await?;
    let parked: ParkedMessage = serde_json::from_slice(&next(&mut subscription).await?.data)?;
    assert_eq!(parked.attempts, 3);
    assert_eq!(parked.original_message["id"], command.id.to_string());
    assert!(parked.failure_reason.contains("provider unavailable"));

    Ok(())
}

/// Test: a payload that isn't a command goes through the retry loop like
/// any other failure
#[tokio::test(start_paused = true)]
async fn test_undecodable_payload_is_dead_lettered() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let deliverer = ScriptedDeliverer::succeeding();
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        deliverer.clone(),
        &topology,
    );

    broker
        .publish(&topology.exchange, &topology.main_routing_key, b"{not json")
        .await?;

    let mut subscription = broker.subscribe(&topology.main_queue, "test").await?;
    let message = next(&mut subscription).await?;

    assert_eq!(consumer.handle(message).await?, DeliveryOutcome::DeadLettered);
    assert_eq!(deliverer.attempt_count(), 0);
    assert_eq!(broker.queue_depth(&topology.retry_queue), 1);
    assert_eq!(broker.unacked_count(), 0);

    Ok(())
}

/// Test: the consumer processes a command under the correlation id the
/// producer captured from the originating scope
#[tokio::test(start_paused = true)]
async fn test_correlation_id_follows_the_command() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let deliverer = ScriptedDeliverer::succeeding();
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        deliverer.clone(),
        &topology,
    );
    let publisher = producer(&broker, &topology);

    TraceContext::with_correlation_id("req000000042")
        .scope(publisher.publish(&sample_command("runner@example.com")))
        .await?;

    let mut subscription = broker.subscribe(&topology.main_queue, "test").await?;
    let message = next(&mut subscription).await?;

    assert_eq!(consumer.handle(message).await?, DeliveryOutcome::Delivered);
    let attempts = deliverer.attempts();
    assert_eq!(attempts[0].correlation_id.as_deref(), Some("req000000042"));
    assert_eq!(TraceContext::current_correlation_id(), None);

    Ok(())
}

/// Test: an explicit correlation id on the command is kept by the producer
#[tokio::test]
async fn test_producer_keeps_explicit_correlation_id() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let command = sample_command("runner@example.com")
        .with_correlation_id(Some("fromcaller01".to_string()));

    TraceContext::with_correlation_id("req000000042")
        .scope(producer(&broker, &topology).publish(&command))
        .await?;

    let mut subscription = broker.subscribe(&topology.main_queue, "test").await?;
    let message = next(&mut subscription).await?;
    let value: serde_json::Value = serde_json::from_slice(&message.data)?;
    assert_eq!(value["correlation_id"], "fromcaller01");

    Ok(())
}

/// Test: publishing before the topology exists fails instead of dropping
/// the command
#[tokio::test]
async fn test_publish_without_topology_fails() {
    let topology = test_topology();
    let broker = InMemoryBroker::new();

    let result = producer(&broker, &topology)
        .publish(&sample_command("runner@example.com"))
        .await;

    assert!(result.is_err());
}

/// Test: a routing key with no bound queue is reported as unroutable
#[tokio::test]
async fn test_unroutable_publish_fails() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;

    let result = broker
        .publish(&topology.exchange, "notification.unknown", b"{}")
        .await;

    assert!(result.is_err());
    Ok(())
}

/// Test: several workers share the queue and every command is delivered
/// exactly once
#[tokio::test(start_paused = true)]
async fn test_workers_share_the_queue() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let deliverer = ScriptedDeliverer::succeeding();
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        deliverer.clone(),
        &topology,
    );

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, 3, shutdown.clone());

    let publisher = producer(&broker, &topology);
    let mut ids = HashSet::new();
    for i in 0..20 {
        let command = sample_command(&format!("athlete{}@example.com", i));
        ids.insert(command.id);
        publisher.publish(&command).await?;
    }

    wait_until(|| deliverer.attempt_count() >= 20, RETRY_TTL).await?;
    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }

    assert_eq!(deliverer.attempt_count(), 20);
    for id in ids {
        assert_eq!(deliverer.attempts_for(id), 1);
    }
    assert_eq!(broker.unacked_count(), 0);

    Ok(())
}

/// Test: a closed subscription doesn't end the workers, they keep
/// resubscribing until shutdown
#[tokio::test(start_paused = true)]
async fn test_workers_outlive_closed_subscriptions() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let consumer = NotificationConsumer::new(
        Arc::new(broker.clone()),
        ScriptedDeliverer::succeeding(),
        &topology,
    );

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, 2, shutdown.clone());
    tokio::task::yield_now().await;
    broker.close();

    sleep(Duration::from_secs(120)).await;
    assert!(workers.iter().all(|worker| !worker.is_finished()));
    assert!(broker.health_check().await.is_err());

    shutdown.cancel();
    for worker in workers {
        timeout(Duration::from_secs(5), worker).await??;
    }

    Ok(())
}

/// Test: declaring the same topology twice is harmless, a conflicting
/// declaration is refused
#[tokio::test]
async fn test_topology_redeclaration() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;

    broker.declare_topology(&topology).await?;

    let conflicting = TopologyConfig {
        retry_ttl: RETRY_TTL * 2,
        ..topology.clone()
    };
    assert!(broker.declare_topology(&conflicting).await.is_err());

    Ok(())
}

/// Wraps the in-memory broker, failing the first few acks and subscribes and
/// recording the correlation id in scope whenever a message is settled.
struct UnreliableBroker {
    inner: InMemoryBroker,
    failing_acks: AtomicU32,
    failing_subscribes: AtomicU32,
    settled_under: Mutex<Vec<Option<String>>>,
}

impl UnreliableBroker {
    fn new(inner: InMemoryBroker, failing_acks: u32, failing_subscribes: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_acks: AtomicU32::new(failing_acks),
            failing_subscribes: AtomicU32::new(failing_subscribes),
            settled_under: Mutex::new(Vec::new()),
        })
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record_settlement(&self) {
        self.settled_under
            .lock()
            .unwrap()
            .push(TraceContext::current_correlation_id());
    }

    fn settled_under(&self) -> Vec<Option<String>> {
        self.settled_under.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for UnreliableBroker {
    async fn declare_topology(&self, topology: &TopologyConfig) -> Result<(), Error> {
        self.inner.declare_topology(topology).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.inner.publish(exchange, routing_key, payload).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn Subscription>, Error> {
        if Self::take_failure(&self.failing_subscribes) {
            return Err(anyhow!("connection reset by peer"));
        }
        self.inner.subscribe(queue, consumer_tag).await
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.record_settlement();
        if Self::take_failure(&self.failing_acks) {
            return Err(anyhow!("channel closed"));
        }
        self.inner.acknowledge(delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.record_settlement();
        self.inner.reject(delivery_tag, requeue).await
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.inner.health_check().await
    }
}

/// Test: a failed acknowledgement is logged and the worker keeps consuming
#[tokio::test(start_paused = true)]
async fn test_worker_survives_failed_acknowledgement() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let unreliable = UnreliableBroker::new(broker.clone(), 1, 0);
    let deliverer = ScriptedDeliverer::succeeding();
    let consumer = NotificationConsumer::new(unreliable.clone(), deliverer.clone(), &topology);

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, 1, shutdown.clone());

    let publisher = producer(&broker, &topology);
    let first = sample_command("runner@example.com");
    let second = sample_command("swimmer@example.com");
    publisher.publish(&first).await?;
    publisher.publish(&second).await?;

    wait_until(|| deliverer.attempt_count() >= 2, RETRY_TTL).await?;
    assert!(workers.iter().all(|worker| !worker.is_finished()));

    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }

    assert_eq!(deliverer.attempts_for(first.id), 1);
    assert_eq!(deliverer.attempts_for(second.id), 1);
    assert_eq!(unreliable.settled_under().len(), 2);
    // Only the first delivery is still waiting on the broker.
    assert_eq!(broker.unacked_count(), 1);

    Ok(())
}

/// Test: a worker that can't subscribe retries with backoff instead of
/// giving up
#[tokio::test(start_paused = true)]
async fn test_worker_resubscribes_after_failure() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let unreliable = UnreliableBroker::new(broker.clone(), 0, 3);
    let deliverer = ScriptedDeliverer::succeeding();
    let consumer = NotificationConsumer::new(unreliable.clone(), deliverer.clone(), &topology);

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, 1, shutdown.clone());

    let command = sample_command("runner@example.com");
    producer(&broker, &topology).publish(&command).await?;

    wait_until(|| deliverer.attempt_count() >= 1, RETRY_TTL).await?;
    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }

    assert_eq!(deliverer.attempts_for(command.id), 1);
    assert_eq!(broker.unacked_count(), 0);

    Ok(())
}

/// Test: a payload that doesn't decode is still settled under a correlation id
#[tokio::test(start_paused = true)]
async fn test_undecodable_payload_is_settled_under_correlation_id() -> Result<()> {
    let topology = test_topology();
    let broker = declared_broker(&topology).await?;
    let unreliable = UnreliableBroker::new(broker.clone(), 0, 0);
    let consumer = NotificationConsumer::new(
        unreliable.clone(),
        ScriptedDeliverer::succeeding(),
        &topology,
    );

    broker
        .publish(&topology.exchange, &topology.main_routing_key, b"not a command")
        .await?;
    let mut subscription = broker.subscribe(&topology.main_queue, "test").await?;
    let message = next(&mut subscription).await?;

    assert_eq!(consumer.handle(message).await?, DeliveryOutcome::DeadLettered);

    let settled = unreliable.settled_under();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].as_ref().map(String::len), Some(12));
    assert_eq!(TraceContext::current_correlation_id(), None);

    Ok(())
}
