use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

/// Transport-level failure of a single `submit` call.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum InferenceError {
    #[error("{provider} network error: {message}")]
    Network { provider: String, message: String },
    #[error("{provider} rejected credentials ({status}): {message}")]
    Authentication {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} rate limited: {message}")]
    RateLimit {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("{provider} backend error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Backend {
        provider: String,
        status: Option<u16>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Network,
    Authentication,
    RateLimit,
    Backend,
}

impl ProviderErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::Authentication,
            500..=599 => Self::Network,
            _ => Self::Backend,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Backend => "backend",
        }
    }
}

impl InferenceError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Network { .. } => ProviderErrorKind::Network,
            Self::Authentication { .. } => ProviderErrorKind::Authentication,
            Self::RateLimit { .. } => ProviderErrorKind::RateLimit,
            Self::Backend { .. } => ProviderErrorKind::Backend,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map a failed `reqwest` send to the transport taxonomy.
    pub(crate) fn from_transport(provider: &str, err: reqwest::Error, timeout: Duration) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out after {}s", timeout.as_secs_f64())
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        Self::Network {
            provider: provider.to_string(),
            message,
        }
    }

    /// Map a non-success HTTP status plus the backend's error detail.
    pub(crate) fn from_status(
        provider: &str,
        status: StatusCode,
        headers: &HeaderMap,
        detail: Option<String>,
    ) -> Self {
        let provider = provider.to_string();
        let message = detail.unwrap_or_else(|| status.to_string());
        match ProviderErrorKind::from_status(status) {
            ProviderErrorKind::RateLimit => Self::RateLimit {
                provider,
                message,
                retry_after: parse_retry_after(headers),
            },
            ProviderErrorKind::Authentication => Self::Authentication {
                provider,
                status: status.as_u16(),
                message,
            },
            ProviderErrorKind::Network => Self::Network {
                provider,
                message: format!("server error ({status}): {message}"),
            },
            ProviderErrorKind::Backend => Self::Backend {
                provider,
                status: Some(status.as_u16()),
                message,
            },
        }
    }

    pub(crate) fn malformed(provider: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            provider: provider.to_string(),
            status: None,
            message: message.into(),
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}
