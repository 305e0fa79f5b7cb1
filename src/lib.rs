use std::sync::Arc;

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use broker::{amqp::AmqpBroker, Broker};
use config::Config;
use producer::Producer;
use store::Store;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};
use worker::{Processor, Supervisor};

pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod message;
pub mod producer;
pub mod store;
pub mod worker;

/// Installs the global tracing subscriber. Pretty output in debug builds,
/// JSON in release builds; the filter is read from `COURIER_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("COURIER_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

fn amqp_broker(config: &Config) -> Arc<dyn Broker> {
    Arc::new(AmqpBroker::new(config.amqp_uri()))
}

/// Runs the HTTP producer API.
///
/// Without an explicit config it is loaded from the environment; without an
/// explicit broker an AMQP client is built from the config.
#[bon::builder(finish_fn = start)]
pub async fn serve(config: Option<Config>, broker: Option<Arc<dyn Broker>>) -> eyre::Result<()> {
    init_tracing()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let store = Store::connect_with(&config).await?;
    let broker = broker.unwrap_or_else(|| amqp_broker(&config));

    let producer = Producer::new(store, broker.clone(), "api");
    producer.ensure_queue(config.queue()).await?;

    tracing::info!(
        queue = config.queue(),
        db_path = config.db_path(),
        "API server initialized"
    );

    let data = Data::new(api::State {
        producer,
        queue: config.queue().to_owned(),
    });

    HttpServer::new(move || {
        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .service(api::index)
            .service(api::health::service())
            .service(api::users::service())
            .service(api::messages::service())
            .app_data(data.clone())
            .app_data(json_cfg)
    })
    .bind((config.host(), config.port()))?
    .run()
    .await?;

    broker.close().await?;

    Ok(())
}

/// Runs the worker supervisor until Ctrl-C.
#[bon::builder(finish_fn = start)]
pub async fn work(config: Option<Config>, broker: Option<Arc<dyn Broker>>) -> eyre::Result<()> {
    init_tracing()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let store = Store::connect_with(&config).await?;
    let broker = broker.unwrap_or_else(|| amqp_broker(&config));

    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
        }
    });

    tracing::info!(
        queue = config.queue(),
        amqp_host = config.amqp_host(),
        db_path = config.db_path(),
        "Worker initialized"
    );

    Supervisor::builder()
        .broker(broker)
        .processor(Processor::new(store.clone(), config.queue()))
        .queue(config.queue())
        .build()
        .run(shutdown)
        .await;

    store.close().await;

    Ok(())
}
