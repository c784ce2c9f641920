//! Order Relay - order intake and integration fan-out service

use anyhow::{anyhow, Result};
use order_relay::api::{self, AppState};
use order_relay::broker::{connect_with_backoff, Broker, QueueName, Topology};
use order_relay::codec::EnvelopeCodec;
use order_relay::config::AppConfig;
use order_relay::consumers::backup::{run_retention_sweep, BackupConsumer};
use order_relay::consumers::crm::{CrmPoller, CrmSyncConsumer};
use order_relay::consumers::erp::ErpExportConsumer;
use order_relay::consumers::reconciler::StatusReconciler;
use order_relay::consumers::{run_consumer, ConsumerSettings, MessageHandler};
use order_relay::crm::{SalesforceClient, TrackedRecords};
use order_relay::erp::{FileSink, IdocMapper};
use order_relay::intake::OrderIntake;
use order_relay::publisher::{OrderPublisher, StatusReporter};
use order_relay::retry::{RetryError, RetryPolicy};
use order_relay::store::PgStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deliveries a failing status write may take before it is dead-lettered.
const STATUS_WRITE_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Arc::new(AppConfig::from_env()?);
    let shutdown = CancellationToken::new();

    let db = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    let store = PgStore::new(db);

    let broker = match connect_with_backoff(&config.broker_url, &RetryPolicy::reconnect(), &shutdown).await {
        Ok(broker) => Arc::new(broker) as Arc<dyn Broker>,
        Err(RetryError::Exhausted(e)) => return Err(e.into()),
        Err(RetryError::Cancelled) => return Err(anyhow!("broker connection cancelled")),
    };
    let topology = Arc::new(Topology::standard(config.dead_letter_ttl));
    broker.declare(&topology).await?;

    let codec = EnvelopeCodec::from_passphrase(&config.secret_key);
    let publisher = OrderPublisher::new(broker.clone(), codec.clone());
    let reporter = StatusReporter::new(broker.clone(), codec.clone());
    let settings = ConsumerSettings { concurrency: config.consumer_concurrency, shutdown_grace: config.shutdown_grace, ..ConsumerSettings::default() };

    let backup: Arc<dyn MessageHandler> = Arc::new(BackupConsumer::new(Arc::new(store.clone()), codec.clone(), config.backup_max_attempts));
    let erp: Arc<dyn MessageHandler> = Arc::new(ErpExportConsumer::new(
        codec.clone(),
        IdocMapper::new(config.default_country.clone()),
        Arc::new(FileSink::new(config.erp_output_dir.clone())),
    ));
    let reconciler: Arc<dyn MessageHandler> = Arc::new(StatusReconciler::new(Arc::new(store.clone()), codec.clone(), STATUS_WRITE_ATTEMPTS));
    let mut handlers = vec![(QueueName::Backup, backup), (QueueName::Erp, erp), (QueueName::Response, reconciler)];

    let mut tasks = JoinSet::new();
    match &config.crm {
        Some(credentials) => {
            let crm = Arc::new(SalesforceClient::new(credentials.clone())?);
            let tracked = TrackedRecords::new();
            let sync: Arc<dyn MessageHandler> = Arc::new(CrmSyncConsumer::new(crm.clone(), codec.clone(), reporter.clone(), tracked.clone(), Arc::new(store.clone())));
            handlers.push((QueueName::Crm, sync.clone()));
            handlers.push((QueueName::CrmDeadLetter, sync));
            let poller = CrmPoller::new(crm, tracked, reporter.clone());
            tasks.spawn(poller.run(config.crm_poll_interval, shutdown.clone()));
        }
        None => tracing::warn!("CRM credentials not configured; CRM sync and polling disabled"),
    }

    for (queue, handler) in handlers {
        let (broker, topology, settings, shutdown) = (broker.clone(), topology.clone(), settings.clone(), shutdown.clone());
        tasks.spawn(async move {
            tracing::info!(queue = %queue, handler = handler.name(), "Consumer started");
            if let Err(e) = run_consumer(broker, topology, queue, handler, settings, shutdown).await {
                tracing::error!(queue = %queue, error = %e, "Consumer stopped");
            }
        });
    }
    tasks.spawn(run_retention_sweep(Arc::new(store.clone()), config.backup_retention_days, config.backup_sweep_interval, shutdown.clone()));

    let state = AppState {
        intake: OrderIntake::new(Arc::new(store.clone()), publisher.clone(), config.currency.clone()),
        orders: Arc::new(store.clone()),
        quarantine: Arc::new(store.clone()),
        publisher,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Order relay listening");
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    tracing::info!("Order relay stopped");
    Ok(())
}
