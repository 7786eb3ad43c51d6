use std::fmt;

/// Error taxonomy shared by pollers, the work queue, the gateways and the
/// plan executor. Each variant carries enough text to log and to chain into
/// an `anyhow::Error`; callers that need to branch on error class (e.g. the
/// poller deciding whether to invalidate a connection) `downcast_ref` on the
/// boxed `anyhow::Error` chain rather than matching a flat error code.
#[derive(Debug, Clone)]
pub enum JervisError {
    /// Connection auth failure; the connection must transition to INVALID.
    Auth(String),
    /// Network/5xx/lock-contention; retry with backoff up to `maxAttempts`.
    Transient(String),
    /// Malformed item; the work item fails without retry.
    Data(String),
    /// A plan tool returned `Error`/`Stop`.
    Tool(String),
    /// All LLM candidates exhausted, or the vector store is unreachable.
    Gateway(String),
    /// Cooperative cancellation. Never converted into another class.
    Cancellation,
}

impl fmt::Display for JervisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JervisError::Auth(msg) => write!(f, "auth error: {msg}"),
            JervisError::Transient(msg) => write!(f, "transient error: {msg}"),
            JervisError::Data(msg) => write!(f, "data error: {msg}"),
            JervisError::Tool(msg) => write!(f, "tool error: {msg}"),
            JervisError::Gateway(msg) => write!(f, "gateway error: {msg}"),
            JervisError::Cancellation => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for JervisError {}

/// Curated substrings that mark a Git/HTTP failure as authentication-related.
/// Matched case-sensitively against subprocess stderr / response bodies.
pub const AUTH_ERROR_MARKERS: &[&str] = &[
    "HTTP Basic: Access denied",
    "Authentication failed",
    "401",
    "403",
    "could not read Username",
    "Permission denied",
    "not found",
    "404",
];

/// True if `text` contains any of the well-known auth-failure markers.
pub fn looks_like_auth_error(text: &str) -> bool {
    AUTH_ERROR_MARKERS.iter().any(|m| text.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_markers() {
        assert!(looks_like_auth_error("remote: HTTP Basic: Access denied"));
        assert!(looks_like_auth_error("fatal: repository not found"));
        assert!(looks_like_auth_error("server returned error: 401"));
    }

    #[test]
    fn ignores_unrelated_text() {
        assert!(!looks_like_auth_error("Already up to date."));
    }

    #[test]
    fn display_formats_variant_name() {
        let e = JervisError::Auth("token expired".into());
        assert_eq!(e.to_string(), "auth error: token expired");
    }
}
