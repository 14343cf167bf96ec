use anyhow::Context;
use medreport_service::{ServiceConfig, create_app};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing; `LOG_FORMAT=pretty` for development, JSON otherwise
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "medreport_service=debug,medreport_core=debug,tower_http=debug".into());

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env().context("invalid service configuration")?;
    let app = create_app(&config).await;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    let addr = listener.local_addr()?;

    info!("Medical Report Review Service starting on {}", addr);
    info!("Analysis engine: {}", config.analysis_api_url);
    info!("Upload directory: {}", config.upload_dir.display());

    axum::serve(listener, app).await?;

    Ok(())
}
