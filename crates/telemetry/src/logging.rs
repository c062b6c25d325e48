use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    Pretty,
    /// Compact text format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Initialize structured logging for a service.
///
/// `level` is the default filter when `RUST_LOG` is not set. Chatty
/// transport crates are clamped to `warn` either way.
pub fn init(service_name: &str, level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive("hyper=warn".parse().expect("valid directive"))
        .add_directive("reqwest=warn".parse().expect("valid directive"))
        .add_directive("tower_http=info".parse().expect("valid directive"));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_target(true))
                .init();
        }
        LogFormat::Compact => {
            registry
                .with(fmt::layer().compact().with_target(true))
                .init();
        }
        LogFormat::Pretty => {
            registry
                .with(fmt::layer().pretty().with_target(true))
                .init();
        }
    }

    tracing::info!(
        service.name = %service_name,
        format = ?format,
        "structured logging initialized"
    );
}
