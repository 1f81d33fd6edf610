use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::Error;

/// HTTP-facing wrapper over engine errors, mapping each kind to its status
/// code. Bodies carry a message only; internals never leak to callers.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct ApiError(#[from] Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidName | Error::InvalidUpload(_) | Error::BundleMalformed(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::UnknownModel(_) | Error::MissingBundle(_) | Error::UnknownInstance(_) => {
                StatusCode::NOT_FOUND
            }
            Error::AlreadyDeploying { .. } => StatusCode::CONFLICT,
            Error::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::ProxyUpstream(_) => StatusCode::BAD_GATEWAY,
            Error::PortExhausted
            | Error::SandboxFailure(_)
            | Error::SpawnFailure(_)
            | Error::PartialDeployment { .. }
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self.0, "request failed");
            "internal error while handling the request".to_string()
        } else {
            self.0.to_string()
        };

        (
            status,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )],
            Json(json!({ "message": message })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
