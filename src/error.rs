use crate::budget::BudgetSnapshot;
use serde::Serialize;
use std::time::Duration;

/// Lockout applied after a 420 when the response carries no reset header.
pub const DEFAULT_ERROR_WINDOW_SECS: u64 = 60;

/// Closed taxonomy of protocol-level failures.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    /// Token missing, expired or revoked. Refreshing is the caller's job.
    Unauthorized,
    Forbidden,
    NotFound,
    /// 420: the error budget is spent. Nothing may be sent until the window resets.
    ErrorBudgetExhausted { reset_seconds: Option<u64> },
    /// 429: per-window throttle.
    RateLimited { retry_after_seconds: Option<u64> },
    /// 500 / 502.
    ServerError,
    /// 503 / 504.
    ServerUnavailable,
    Unknown,
}

impl ErrorKind {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ServerUnavailable)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::ErrorBudgetExhausted { .. } => "error_budget_exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError => "server_error",
            Self::ServerUnavailable => "server_unavailable",
            Self::Unknown => "unknown",
        }
    }

    pub fn explanation(&self) -> &'static str {
        match self {
            Self::BadRequest => "malformed request; fix the caller",
            Self::Unauthorized => "access token rejected; refresh the token before calling again",
            Self::Forbidden => "token lacks the scope or role this endpoint needs",
            Self::NotFound => "resource does not exist",
            Self::ErrorBudgetExhausted { .. } => {
                "error limit reached; all calls must stop until the error window resets"
            }
            Self::RateLimited { .. } => "rate limit window exhausted; wait for Retry-After",
            Self::ServerError => "remote service failed; do not hammer it",
            Self::ServerUnavailable => "remote service temporarily unavailable; retry with backoff",
            Self::Unknown => "unmapped status; treated as terminal",
        }
    }

    /// The wait the remote service asked for, if this kind carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_seconds: Some(s),
            } => Some(Duration::from_secs(*s)),
            Self::ErrorBudgetExhausted {
                reset_seconds: Some(s),
            } => Some(Duration::from_secs(*s)),
            _ => None,
        }
    }
}

/// Map a status code and the budget reported alongside it to an [`ErrorKind`].
///
/// Success and 304 statuses are not errors and map to `Unknown`; callers only
/// classify what they already know to be a failure.
pub fn classify(status: u16, budget: Option<&BudgetSnapshot>) -> ErrorKind {
    match status {
        400 => ErrorKind::BadRequest,
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        420 => ErrorKind::ErrorBudgetExhausted {
            reset_seconds: budget.and_then(|b| b.error_budget_reset_seconds),
        },
        429 => ErrorKind::RateLimited {
            retry_after_seconds: budget.and_then(|b| b.retry_after_seconds),
        },
        500 | 502 => ErrorKind::ServerError,
        503 | 504 => ErrorKind::ServerUnavailable,
        _ => ErrorKind::Unknown,
    }
}

/// A classified non-success response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, thiserror::Error)]
#[error("GET {endpoint} failed with status {status} ({}): {}", .kind.code(), .kind.explanation())]
pub struct ApiError {
    pub kind: ErrorKind,
    pub endpoint: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSnapshot>,
}

impl ApiError {
    pub fn classify(
        endpoint: impl Into<String>,
        status: u16,
        body: Option<String>,
        budget: Option<BudgetSnapshot>,
    ) -> Self {
        Self {
            kind: classify(status, budget.as_ref()),
            endpoint: endpoint.into(),
            status,
            body: body.filter(|b| !b.is_empty()),
            budget,
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Failures that prevented a response from being received at all.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// DNS, connect, TLS, timeout or a body that could not be read.
    #[error("transport error on GET {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    /// Refused locally because the error budget lockout is still in force.
    #[error("GET {endpoint} refused: error budget lockout for another {}s", .retry_in.as_secs())]
    LockedOut {
        endpoint: String,
        retry_in: Duration,
    },
    #[error("invalid request for {endpoint}: {message}")]
    InvalidRequest { endpoint: String, message: String },
    #[error("invalid value for header {name}: {message}")]
    InvalidHeader { name: String, message: String },
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// What a caller can do with a single response.
#[derive(Debug)]
pub enum Outcome<T> {
    Data(T),
    /// Success with nothing to hand back, e.g. 204.
    NoData,
    /// Retryable after an explicit wait (429, 503, 504).
    Transient(ApiError),
    /// Terminal for this call, including 420.
    Fatal(ApiError),
    /// 2xx whose body did not deserialize.
    Corrupt { status: u16, message: String },
}
