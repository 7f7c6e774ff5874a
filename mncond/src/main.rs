//! Main entry point for the binary daemon
use anyhow::Result;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use clap::Parser;
use mncon::config::{Connections, Settings};
use mncon::Connector;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// MongoDB-NATS Connector Daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (YAML)
    #[arg(short, long, default_value = "/app/config.yaml")]
    config: String,
    /// Prefix for environment variables
    #[arg(short, long, default_value = "MNC")]
    prefix: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let connections = config::Config::builder()
        .add_source(
            config::Environment::default()
                .prefix(&cli.prefix)
                .separator("__"),
        )
        .build()?
        .try_deserialize::<Connections>()?;

    let file = config::Config::builder()
        .add_source(config::File::with_name(&cli.config))
        .build()?
        .try_deserialize::<Settings>()?;

    let settings = Settings::with_log(connections, file.log().clone(), file.collections().to_owned())?;

    let filter = EnvFilter::try_from_env(format!("{}_LOG", cli.prefix))
        .unwrap_or_else(|_| EnvFilter::new(settings.log().level.clone()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let connector = Connector::connect(settings).await?;
    let health = connector.health();
    let metrics = connector.metrics();
    let shutdown = connector.shutdown_handle();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, shutting down");
                shutdown.shutdown();
            }
        }
    });

    let server_addr = connector.settings().connections().server_addr.clone();
    if !server_addr.is_empty() {
        let health_handler = {
            let health = health.clone();
            move || {
                let health = health.clone();
                async move {
                    if health.is_ready() {
                        (StatusCode::OK, "OK")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
                    }
                }
            }
        };
        let metrics_handler = {
            let metrics = metrics.clone();
            move || {
                let metrics = metrics.clone();
                async move {
                    metrics
                        .export()
                        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        };

        let app = Router::new()
            .route("/healthz", get(health_handler))
            .route("/metrics", get(metrics_handler));

        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&server_addr).await {
                Ok(listener) => {
                    info!(addr = %server_addr, "Health endpoint listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        warn!(error = %e, "Health endpoint failed");
                    }
                }
                Err(e) => warn!(addr = %server_addr, error = %e, "Failed to bind health endpoint"),
            }
        });
    }

    connector.run().await?;
    Ok(())
}
