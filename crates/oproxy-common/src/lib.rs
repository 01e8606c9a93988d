use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod headers;

pub use headers::{HOP_BY_HOP, Headers, header_get, header_set, is_hop_by_hop, without_hop_by_hop};

/// OpenAI-compatible error envelope: `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub err_type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

/// A failure that surfaces to the downstream client as an OpenAI-style
/// error envelope. Produced at the component that detects it; intermediaries
/// pass it through unchanged.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    pub err_type: &'static str,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn new(
        status: u16,
        message: impl Into<String>,
        err_type: &'static str,
        code: Option<&'static str>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            err_type,
            code,
        }
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::new(400, message, "invalid_request_error", Some("model_not_found"))
    }

    pub fn unknown_model(model: &str) -> Self {
        Self::new(
            400,
            format!("Unknown model: {model}"),
            "invalid_request_error",
            Some("unknown_model"),
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized", "authentication_error", None)
    }

    pub fn route_not_found(path: &str) -> Self {
        Self::new(
            404,
            format!("Route not supported by upstream: {path}"),
            "invalid_request_error",
            Some("route_not_found"),
        )
    }

    pub fn upstream_404(path: &str) -> Self {
        Self::new(
            404,
            format!("Upstream returned 404 for {path}"),
            "invalid_request_error",
            Some("upstream_404"),
        )
    }

    pub fn payload_too_large() -> Self {
        Self::new(413, "Payload Too Large", "request_too_large", None)
    }

    pub fn rate_limited() -> Self {
        Self::new(429, "Too Many Requests", "rate_limit_error", None)
    }

    pub fn config_error(message: impl std::fmt::Display) -> Self {
        Self::new(
            500,
            format!("Configuration error: {message}"),
            "invalid_request_error",
            Some("config_error"),
        )
    }

    pub fn upstream_request_error(message: impl std::fmt::Display) -> Self {
        Self::new(
            502,
            format!("Upstream request error: {message}"),
            "api_error",
            None,
        )
    }

    pub fn unsafe_ssl_downgrade_retry() -> Self {
        Self::new(
            502,
            "Cannot retry over plaintext: request body exceeded the replay buffer",
            "api_error",
            Some("unsafe_ssl_downgrade_retry"),
        )
    }

    pub fn client_missing(message: impl Into<String>) -> Self {
        Self::new(503, message, "api_error", None)
    }

    pub fn upstream_timeout(base_url: &str) -> Self {
        Self::new(
            504,
            format!("Upstream timeout: {base_url}"),
            "timeout_error",
            None,
        )
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.message.clone(),
                err_type: self.err_type.to_string(),
                param: None,
                code: self.code.map(str::to_string),
            },
        }
    }

    /// Envelope serialized as a JSON body.
    pub fn to_body(&self) -> Bytes {
        let body = serde_json::to_vec(&self.envelope()).unwrap_or_else(|_| {
            br#"{"error":{"message":"internal error","type":"api_error","param":null,"code":null}}"#
                .to_vec()
        });
        Bytes::from(body)
    }
}
