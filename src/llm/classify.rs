//! Pattern-based classification of model call failures.
//!
//! Categories are resolved through an ordered dispatch table over the
//! stringified error. Non-retryable categories sit at the top of the table so a
//! message that mentions both an auth failure and a rate limit is never retried.

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    ServerError,
    AuthError,
    ClientError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::AuthError | ErrorCategory::ClientError)
    }

    /// Backoff scale relative to the plain exponential schedule.
    pub fn backoff_multiplier(&self) -> f64 {
        match self {
            ErrorCategory::RateLimit => 2.0,
            ErrorCategory::Timeout => 1.5,
            ErrorCategory::ServerError | ErrorCategory::Unknown => 1.0,
            ErrorCategory::AuthError | ErrorCategory::ClientError => 0.0,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluated top to bottom; first match wins.
static DISPATCH: Lazy<Vec<(ErrorCategory, Regex)>> = Lazy::new(|| {
    [
        (
            ErrorCategory::AuthError,
            r"(?i)\b(401|403)\b|unauthori[sz]ed|forbidden|invalid[ _-]?api[ _-]?key|authentication|permission[ _-]denied",
        ),
        (
            ErrorCategory::ClientError,
            r"(?i)\b(400|404|413|422)\b|bad request|not found|invalid[ _-]request|unprocessable|context[ _-]length",
        ),
        (
            ErrorCategory::RateLimit,
            r"(?i)\b429\b|rate[ _-]?limit|too many requests|quota",
        ),
        (
            ErrorCategory::Timeout,
            r"(?i)timed?[ _-]?out|deadline|\b408\b",
        ),
        (
            ErrorCategory::ServerError,
            r"(?i)\b(500|502|503|504|529)\b|internal server error|bad gateway|service unavailable|overloaded|server error|connection (reset|refused|closed)",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| (category, Regex::new(pattern).unwrap()))
    .collect()
});

/// Categorize a failure by its rendered message.
pub fn classify<E: fmt::Display + ?Sized>(error: &E) -> ErrorCategory {
    let message = error.to_string();
    DISPATCH
        .iter()
        .find(|(_, pattern)| pattern.is_match(&message))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

pub fn is_retryable<E: fmt::Display + ?Sized>(error: &E) -> bool {
    classify(error).is_retryable()
}

/// `2^attempt * multiplier(category)` seconds, `attempt` zero-based. Zero for
/// categories that are never retried.
pub fn suggested_backoff<E: fmt::Display + ?Sized>(error: &E, attempt: u32) -> Duration {
    backoff_for(classify(error), attempt)
}

pub fn backoff_for(category: ErrorCategory, attempt: u32) -> Duration {
    let base = 2f64.powi(attempt.min(30) as i32);
    Duration::from_secs_f64(base * category.backoff_multiplier())
}
