use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use fitness_service::{
    api::{AppState, run_api_server},
    auth::Authenticator,
    clients::{
        broker::Broker,
        health::HealthChecker,
        identity::{IdentityStore, PostgresIdentityStore},
        memory::InMemoryBroker,
        push::{ChannelRouter, FcmDeliverer, IdempotentDeliverer, WebhookDeliverer},
        rbmq::RabbitMqClient,
        redis::RedisClient,
    },
    config::{BrokerBackend, Config},
    consumer::{NotificationConsumer, spawn_workers},
    logging::init_tracing,
    models::message::Channel,
    passcode::PasscodeStore,
    producer::NotificationProducer,
    rate_limit::RateLimiters,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    let _ = rustls::crypto::ring::default_provider().install_default();

    let topology = config.topology();

    let (publisher, subscriber): (Arc<dyn Broker>, Arc<dyn Broker>) = match config.broker_backend {
        BrokerBackend::Rabbitmq => {
            let publisher: Arc<dyn Broker> = Arc::new(RabbitMqClient::connect(&config).await?);
            let subscriber: Arc<dyn Broker> = Arc::new(RabbitMqClient::connect(&config).await?);
            (publisher, subscriber)
        }
        BrokerBackend::Memory => {
            warn!("Using in-memory broker, queued notifications are lost on restart");
            let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
            (broker.clone(), broker)
        }
    };

    publisher.declare_topology(&topology).await?;

    let identity_store: Arc<dyn IdentityStore> =
        Arc::new(PostgresIdentityStore::connect(&config.database_url).await?);
    let redis_client = RedisClient::connect(&config).await?;

    let mut channels =
        ChannelRouter::new().with_route(Channel::Push, Arc::new(FcmDeliverer::new(&config)));
    match &config.relay_webhook_url {
        Some(url) => {
            let relay = Arc::new(WebhookDeliverer::new(url.clone())?);
            channels = channels
                .with_route(Channel::Email, relay.clone())
                .with_route(Channel::Sms, relay);
        }
        None => warn!("RELAY_WEBHOOK_URL not set, email and sms notifications will keep retrying"),
    }
    let deliverer = Arc::new(IdempotentDeliverer::new(
        Arc::new(channels),
        redis_client.clone(),
    ));

    let consumer_broker = subscriber.clone();
    let mut consumer = NotificationConsumer::new(subscriber, deliverer, &topology);
    if let Some(max_attempts) = config.max_delivery_attempts {
        consumer = consumer.with_attempt_limit(&topology, max_attempts);
    }

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(consumer, config.worker_concurrency, shutdown.clone());

    let state = Arc::new(AppState {
        authenticator: Arc::new(Authenticator::from_config(&config, identity_store.clone())),
        rate_limiters: RateLimiters::from_config(&config),
        producer: NotificationProducer::new(publisher.clone(), &topology),
        passcodes: PasscodeStore::with_cleanup_threshold(
            Duration::from_secs(config.passcode_ttl_seconds),
            config.rate_limit_cleanup_threshold,
        ),
        health_checker: HealthChecker::new(publisher, identity_store, Some(redis_client))
            .with_consumer_broker(consumer_broker),
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    if let Err(e) = run_api_server(state, config.server_port, shutdown.clone()).await {
        error!(error = %e, "API server failed");
        shutdown.cancel();
    }

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Notification worker panicked");
        }
    }

    Ok(())
}
