use thiserror::Error;

/// Errors raised by the knowledge-base loader.
///
/// `BrandNotFound` is only surfaced when a specific brand was requested;
/// the streaming search swallows per-file failures and keeps going.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("brand {0} not found")]
    BrandNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
