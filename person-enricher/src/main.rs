use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use person_enricher::config::Config;
use person_enricher::enrichment::{
    build_http_client, AgifyClient, EnrichmentOrchestrator, GenderizeClient, NationalizeClient,
};
use person_enricher::health::HealthRegistry;
use person_enricher::kafka::KafkaTransport;
use person_enricher::metrics::{serve, setup_metrics_recorder, setup_router};
use person_enricher::pipeline::{Pipeline, PipelineSettings};
use person_enricher::storage::{
    CachedStorage, NoopPersonCache, PersonStorage, PostgresStorage, RedisPersonCache,
};

fn setup_tracing() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

async fn create_storage(config: &Config) -> anyhow::Result<Arc<dyn PersonStorage>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    let postgres = Arc::new(PostgresStorage::new(pool, config.page_size));

    if config.run_migrations {
        postgres.migrate().await?;
    }

    if !config.cache_enabled {
        info!("person cache disabled");
        return Ok(Arc::new(CachedStorage::new(
            postgres,
            Arc::new(NoopPersonCache),
        )));
    }

    let client = redis::Client::open(config.redis_url.as_str())?;
    let cache = RedisPersonCache::new_redis(client, config.cache_ttl_secs).await?;
    info!(ttl_secs = config.cache_ttl_secs, "person cache enabled");
    Ok(Arc::new(CachedStorage::new(postgres, Arc::new(cache))))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;
    info!("starting person enricher");

    let config = Config::init_from_env()?;
    info!(
        topic = config.kafka.kafka_consumer_topic,
        dead_letter_topic = config.kafka.kafka_dead_letter_topic,
        group_id = config.kafka.kafka_consumer_group,
        queue_capacity = config.queue_capacity,
        require_surname = config.require_surname,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");

    let recorder = setup_metrics_recorder()?;
    let router = setup_router(liveness.clone(), recorder);
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve operational endpoints on {}: {}", bind, e);
        }
    });

    let storage = create_storage(&config).await?;

    let http = build_http_client(config.lookup_timeout_ms.0)?;
    let service = EnrichmentOrchestrator::new(
        Arc::new(AgifyClient::new(http.clone(), &config.agify_url)),
        Arc::new(GenderizeClient::new(http.clone(), &config.genderize_url)),
        Arc::new(NationalizeClient::new(http, &config.nationalize_url)),
        storage,
    );

    let kafka_liveness = liveness.register("rdkafka", Duration::from_secs(30));
    let transport = KafkaTransport::new(&config.kafka, kafka_liveness)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        on_signal.cancel();
    });

    let pipeline = Pipeline::new(
        Arc::new(transport),
        Arc::new(service),
        PipelineSettings::from_config(&config),
        liveness,
    );
    pipeline.run(shutdown).await?;

    info!("person enricher shut down");
    Ok(())
}
