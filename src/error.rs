use std::time::Duration;
use thiserror::Error;

/// Failure of an external collaborator (vision, search, audio features, OAuth)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    #[error("{service} is unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("{service} is rate limiting requests{}", retry_hint(.retry_after))]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("invalid response from {service}: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },

    #[error("{service} rejected our credentials: {message}")]
    Unauthorized {
        service: &'static str,
        message: String,
    },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(" (retry after {}s)", wait.as_secs()),
        None => String::new(),
    }
}

impl UpstreamError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn malformed(service: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            service,
            message: message.into(),
        }
    }

    pub fn unauthorized(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            service,
            message: message.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RateLimited { retry_after, .. } => Remediation::TryAgainShortly {
                wait: *retry_after,
            },
            Self::Unauthorized { .. } => Remediation::ServiceMisconfigured,
            Self::Malformed { .. } => Remediation::TryDifferentInput,
            Self::Unavailable { .. } => Remediation::TryAgainLater,
        }
    }
}

/// Cache-layer failure. Always absorbed by the caller (treated as a miss).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Fatal outcome of one recommendation request
#[derive(Debug, Error)]
pub enum RecommendError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("no candidates found for this image")]
    InsufficientCandidates,

    #[error("no scorable tracks: none of the candidates have audio features")]
    InsufficientScoredTracks,
}

impl RecommendError {
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Upstream(err) => err.remediation(),
            Self::InsufficientCandidates => Remediation::TryDifferentInput,
            Self::InsufficientScoredTracks => Remediation::TryAgainLater,
        }
    }
}

/// What a user should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    TryAgainShortly { wait: Option<Duration> },
    TryDifferentInput,
    ServiceMisconfigured,
    TryAgainLater,
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TryAgainShortly { wait: Some(wait) } => {
                let minutes = wait.as_secs().div_ceil(60).max(1);
                write!(f, "Too many requests, please try again in {minutes} minute(s).")
            }
            Self::TryAgainShortly { wait: None } => {
                write!(f, "Too many requests, please try again shortly.")
            }
            Self::TryDifferentInput => write!(f, "Please try a different image or vibe."),
            Self::ServiceMisconfigured => {
                write!(
                    f,
                    "A music or vision service is misconfigured, check the API credentials."
                )
            }
            Self::TryAgainLater => {
                write!(f, "A music or vision service failed, please try again later.")
            }
        }
    }
}
