use thiserror::Error;

/// A wait or request was abandoned because the caller's cancellation token fired.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Unknown service or group: {0}")]
    UnknownService(String),

    #[error("{service}: `{program}` not found on PATH")]
    BinaryNotFound { service: String, program: String },

    #[error("{service} unavailable: {reason}. Remediation: {remediation}")]
    DependencyUnavailable {
        service: String,
        reason: String,
        remediation: String,
    },

    #[error("Failed to start {service}: {reason}")]
    StartupError { service: String, reason: String },

    #[error("Failed to stop {service}: {reason}")]
    StopError { service: String, reason: String },

    #[error("Dependency cycle between services: {0}")]
    DependencyCycle(String),

    #[error("Port {port} is still bound after stopping {service}")]
    PortStillBound { service: String, port: u16 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for LifecycleError {
    fn from(_: Cancelled) -> Self {
        LifecycleError::Cancelled
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("{service} is not healthy: {observation}")]
    ServiceNotReady { service: String, observation: String },

    #[error("Failed to load dataset {path}: {reason}")]
    Dataset { path: String, reason: String },

    #[error("{endpoint} rejected the request with HTTP {status}: {preview}")]
    Rejected {
        endpoint: String,
        status: u16,
        preview: String,
    },

    #[error("{endpoint} did not respond within {timeout_ms}ms")]
    TimedOut { endpoint: String, timeout_ms: u64 },

    #[error("HTTP error calling {endpoint}: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Response from {endpoint} is not valid JSON: {preview}")]
    InvalidJson { endpoint: String, preview: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Verification cancelled")]
    Cancelled,
}

impl From<Cancelled> for VerifyError {
    fn from(_: Cancelled) -> Self {
        VerifyError::Cancelled
    }
}

/// First `max` characters of a response body, for diagnostics.
pub fn preview(body: &str, max: usize) -> String {
    let trimmed = body.trim();
    let mut out: String = trimmed.chars().take(max).collect();
    if trimmed.chars().count() > max {
        out.push('…');
    }
    out
}
