//! Detection summary worker binary.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dsum_clients::{build_generator, build_scorer, HomeAssistantClient};
use dsum_storage::{BundleStore, StoreConfig};
use dsum_worker::config::validate_zones;
use dsum_worker::{
    CooldownScheduler, HomeAssistantSink, MotionPoller, Notifier, WorkerConfig, WorkerResult,
    ZoneConfig, ZoneRunner, ZoneServices,
};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dsum=info,hyper=warn,reqwest=warn"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting dsum-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: zones_file={}, store_path={:?}", config.zones_file.display(), config.store_path);

    let zones = match config.load_zones().and_then(|zones| validate_zones(&zones).map(|_| zones)) {
        Ok(zones) => zones,
        Err(e) => {
            error!("Invalid zone configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(port) = config.metrics_port {
        if let Err(e) = dsum_worker::metrics::init_metrics(port) {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
        info!("Prometheus metrics on port {}", port);
    }

    let home_assistant = match HomeAssistantClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create Home Assistant client: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(
        BundleStore::open(StoreConfig {
            state_path: config.store_path.clone(),
            max_bundles_per_key: config.max_bundles_per_key,
        })
        .await,
    );
    let notifier = Arc::new(Notifier::default().with_sink(Arc::new(HomeAssistantSink::new(Arc::clone(&home_assistant)))));
    let scheduler = CooldownScheduler::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = Vec::new();
    for zone in &zones {
        let services = ZoneServices {
            camera: home_assistant.clone(),
            scorer: match build_scorer_for(zone) {
                Ok(scorer) => scorer,
                Err(e) => {
                    error!("Zone {}: {}", zone.bundle_key, e);
                    std::process::exit(1);
                }
            },
            generator: match build_generator_for(zone) {
                Ok(generator) => generator,
                Err(e) => {
                    error!("Zone {}: {}", zone.bundle_key, e);
                    std::process::exit(1);
                }
            },
            store: Arc::clone(&store),
            notifier: Arc::clone(&notifier),
            scheduler: scheduler.clone(),
        };

        if let Err(e) = zone.layout().ensure_dirs().await {
            error!("Zone {}: cannot create snapshot directories: {}", zone.bundle_key, e);
            std::process::exit(1);
        }

        let runner = match ZoneRunner::from_config(zone, services, config.retention_hours) {
            Ok(runner) => Arc::new(runner),
            Err(e) => {
                error!("Zone {}: {}", zone.bundle_key, e);
                std::process::exit(1);
            }
        };

        let poller = MotionPoller::new(
            home_assistant.clone(),
            zone.trigger_entity_id.clone(),
            zone.trigger_to.clone(),
            config.motion_poll_interval,
        );
        let (motion, poll_handle) = poller.spawn(shutdown_rx.clone());
        tasks.push(poll_handle);
        tasks.push(tokio::spawn(runner.run(motion, shutdown_rx.clone())));
    }
    info!("{} zones running", zones.len());

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    join_all(tasks).await;
    info!("Worker shutdown complete");
}

fn build_scorer_for(zone: &ZoneConfig) -> WorkerResult<Arc<dyn dsum_clients::FrameScorer>> {
    Ok(build_scorer(zone.data_provider()?, zone.scorer_config()?)?)
}

fn build_generator_for(zone: &ZoneConfig) -> WorkerResult<Option<Arc<dyn dsum_clients::IllustrationGenerator>>> {
    if !zone.external_image_gen_enabled {
        return Ok(None);
    }
    Ok(Some(build_generator(zone.image_provider()?, zone.image_config()?)?))
}
