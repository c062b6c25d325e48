//! Input validation for externally supplied requests.
//!
//! Discovery requests arrive over the HTTP boundary; everything here runs
//! before a scan does any work, so a bad request never spawns workers.

use crate::models::DiscoveryRequest;
use anyhow::{anyhow, Result};

/// Maximum length for a scan target (IP or full URL).
pub const MAX_TARGET_LENGTH: usize = 4096;

/// Maximum length for a free-text model hint.
pub const MAX_MODEL_LENGTH: usize = 512;

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate value is within range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

/// Validate a discovery request before any scan work starts.
///
/// Zero-valued numeric fields are treated as unset (the scanner substitutes
/// its configured defaults); explicitly supplied values must be in range.
pub fn validate_discovery_request(req: &DiscoveryRequest) -> Result<()> {
    validate_non_empty(&req.target, "target")?;
    validate_length(&req.target, MAX_TARGET_LENGTH, "target")?;
    if let Some(model) = &req.model {
        validate_length(model, MAX_MODEL_LENGTH, "model")?;
    }
    if req.max_streams != 0 {
        validate_range(req.max_streams, 1, 50, "max_streams")?;
    }
    if req.timeout_seconds != 0 {
        validate_range(req.timeout_seconds, 10, 600, "timeout")?;
    }
    if req.model_limit != 0 {
        validate_range(req.model_limit, 1, 20, "model_limit")?;
    }
    Ok(())
}
