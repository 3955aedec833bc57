use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use std::future::IntoFuture;
use std::sync::Arc;
use taskhub_server::api::create_rest_api;
use taskhub_server::metrics::HubMetrics;
use taskhub_server::signal::termination_signal;
use taskhub_server::{Hub, HubConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tq-hub")]
#[command(about = "Task hub control plane", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// REST API port
    #[arg(long)]
    port: Option<u16>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Postgres connection URL; metadata stays in memory when unset
    #[arg(long, env = "TASKHUB_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        HubConfig::from_file(&args.config)?
    } else {
        HubConfig::default()
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(metrics_port) = args.metrics_port {
        config.monitoring.prometheus_port = metrics_port;
    }
    if let Some(url) = args.database_url {
        config.database.url = Some(url);
    }

    init_tracing(&config);
    if !config_found {
        tracing::warn!(path = %args.config, "Config file not found, using defaults");
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        persistent = config.database.url.is_some(),
        "Starting control plane"
    );

    let hub = Arc::new(Hub::open(&config).await?);

    let metrics = hub.metrics().clone();
    let metrics_addr = format!("{}:{}", config.server.host, config.monitoring.prometheus_port);
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics, metrics_addr).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("REST API listening on {}", addr);

    let signal_hub = hub.clone();
    let shutdown_signal = termination_signal();
    let server = axum::serve(listener, create_rest_api(hub.clone()))
        .with_graceful_shutdown(async move {
            shutdown_signal.await;
            tracing::info!("Shutdown signal received, draining requests");
            signal_hub.shutdown();
        })
        .into_future();

    let drain_timeout = config.shutdown_timeout();
    let deadline = async {
        hub.wait_for_shutdown().await;
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => tracing::warn!("Drain timeout elapsed, forcing shutdown"),
    }

    tracing::info!("Control plane stopped");
    Ok(())
}

fn init_tracing(config: &HubConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.monitoring.log_level.as_str().into());

    let json = config.monitoring.log_format.eq_ignore_ascii_case("json");
    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(false)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn start_metrics_server(metrics: Arc<HubMetrics>, addr: String) -> anyhow::Result<()> {
    async fn metrics_handler(State(metrics): State<Arc<HubMetrics>>) -> (StatusCode, String) {
        match metrics.render() {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
