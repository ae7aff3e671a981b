use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use w3b2_engine::BridgeError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Bridge(e) => bridge_status(e),
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error kind.
    fn kind(&self) -> &'static str {
        match self {
            GatewayError::Bridge(e) => match e {
                BridgeError::ChainUnavailable(_) => "chain_unavailable",
                BridgeError::InvalidEvent { .. } => "invalid_event",
                BridgeError::MirrorDivergence(_) => "mirror_divergence",
                BridgeError::NoSuchProfile(_) => "no_such_profile",
                BridgeError::InsufficientDeposit { .. } => "insufficient_deposit",
                BridgeError::UnknownCommand(_) => "unknown_command",
                BridgeError::DuplicateCommand(_) => "duplicate_command",
                BridgeError::AuthenticationFailed => "authentication_failed",
                BridgeError::ConfirmationTimeout(_) => "confirmation_timeout",
                BridgeError::SessionExpired(_) => "session_expired",
                BridgeError::NoSuchSession(_) => "no_such_session",
                BridgeError::NotCancellable(_) => "not_cancellable",
                BridgeError::Rejected(_) => "rejected",
                BridgeError::NotFound(_) => "not_found",
                _ => "internal",
            },
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Internal(_) => "internal",
        }
    }
}

fn bridge_status(e: &BridgeError) -> StatusCode {
    match e {
        BridgeError::NoSuchProfile(_)
        | BridgeError::NoSuchSession(_)
        | BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::InsufficientDeposit { .. } => StatusCode::PAYMENT_REQUIRED,
        BridgeError::DuplicateCommand(_) | BridgeError::NotCancellable(_) => StatusCode::CONFLICT,
        BridgeError::UnknownCommand(_) | BridgeError::Rejected(_) => StatusCode::BAD_REQUEST,
        BridgeError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        BridgeError::SessionExpired(_) => StatusCode::GONE,
        BridgeError::ChainUnavailable(_) | BridgeError::MirrorDivergence(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BridgeError::ConfirmationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "error": message,
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}
