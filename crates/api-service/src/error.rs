use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::DbError;
use serde::Serialize;
use std::fmt::{self, Display};

/// Error surface of the discovery API.
///
/// Knowledge-base lookups distinguish a missing brand (404) from a broken
/// database (500); malformed search or scan input is a 400. Scan-internal
/// failures never surface here — they travel through the SSE event stream.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(message) | Self::NotFound(message) | Self::Internal(message) => {
                message
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.message().to_string(),
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.status())
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::BrandNotFound(brand) => Self::NotFound(format!("brand {brand} not found")),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_map_to_their_status_codes() {
        assert_eq!(
            ApiError::bad_request("bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::not_found("gone").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::internal("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn missing_brand_becomes_a_404() {
        let error: ApiError = DbError::BrandNotFound("acme".to_string()).into();
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert!(error.message().contains("acme"));

        let error: ApiError =
            DbError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).into();
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
