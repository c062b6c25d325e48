use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use stream_discovery::ScannerConfig;

const DEFAULT_LISTEN: &str = "0.0.0.0:4567";

/// Process configuration, environment-driven.
///
/// `SCOUT_DATA_PATH` points at the knowledge base root (default `./data`);
/// the brands directory and pattern/parameter tables hang off it.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub data_path: PathBuf,
    pub brands_path: PathBuf,
    pub patterns_path: PathBuf,
    pub parameters_path: PathBuf,
    pub log_level: String,
    pub log_format: String,
    pub scanner: ScannerConfig,
    pub ffprobe_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let data_path = PathBuf::from(get_env("SCOUT_DATA_PATH", "./data"));

        let mut listen = get_env("SCOUT_LISTEN", DEFAULT_LISTEN);
        if let Err(e) = validate_listen(&listen) {
            eprintln!("invalid listen address '{listen}': {e}; using default {DEFAULT_LISTEN}");
            listen = DEFAULT_LISTEN.to_string();
        }

        Self {
            listen,
            brands_path: data_path.join("brands"),
            patterns_path: data_path.join("popular_stream_patterns.json"),
            parameters_path: data_path.join("query_parameters.json"),
            data_path,
            log_level: get_env("SCOUT_LOG_LEVEL", "info"),
            log_format: get_env("SCOUT_LOG_FORMAT", "json"),
            scanner: ScannerConfig::default(),
            ffprobe_timeout: Duration::from_secs(30),
        }
    }
}

/// Accepts `host:port` with a port in range; the host may be empty
/// (wildcard bind).
pub fn validate_listen(listen: &str) -> Result<()> {
    let Some((_, port)) = listen.rsplit_once(':') else {
        return Err(anyhow!("expected 'host:port', got '{listen}'"));
    };
    if port.is_empty() {
        return Err(anyhow!("port cannot be empty"));
    }
    let port: u32 = port
        .parse()
        .map_err(|_| anyhow!("invalid port number '{port}'"))?;
    if !(1..=65535).contains(&port) {
        return Err(anyhow!("port {port} out of valid range (1-65535)"));
    }
    Ok(())
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}
