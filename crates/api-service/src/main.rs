use anyhow::{Context, Result};
use api_service::{routes, AppState, Config};
use camera_db::{Loader, SearchEngine};
use std::sync::Arc;
use stream_discovery::{OnvifProber, Scanner, StreamProbe, UrlBuilder};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    telemetry::init(
        "api-service",
        &config.log_level,
        telemetry::LogFormat::parse(&config.log_format),
    );

    info!(
        data_path = %config.data_path.display(),
        listen = %config.listen,
        "starting camera stream discovery service"
    );

    let loader = Arc::new(Loader::new(
        &config.brands_path,
        &config.patterns_path,
        &config.parameters_path,
    ));

    // The auth query key table travels with the knowledge base; fall back
    // to the built-in list when it is missing.
    let auth_keys = match loader.load_query_parameters().await {
        Ok(keys) => keys.to_vec(),
        Err(e) => {
            warn!(error = %e, "query parameter table unavailable, using built-ins");
            Vec::new()
        }
    };

    let search = Arc::new(SearchEngine::new(loader.clone()));
    let probe = Arc::new(StreamProbe::new(config.ffprobe_timeout)?);
    let onvif = Arc::new(OnvifProber::new()?);
    let scanner = Arc::new(Scanner::new(
        loader.clone(),
        search.clone(),
        UrlBuilder::new(auth_keys),
        onvif,
        probe.clone(),
        config.scanner.clone(),
    ));

    let state = AppState::new(loader, search, scanner, probe);
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
