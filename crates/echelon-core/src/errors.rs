use std::time::Duration;

/// Typed errors for upstream model invocations.
/// Classifies failures as retryable (transport) or fatal (request-level).
#[derive(Clone, Debug, thiserror::Error)]
pub enum InvokeError {
    // Retryable
    #[error("upstream unavailable: {detail}")]
    UpstreamUnavailable { detail: String },
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    // Fatal
    #[error("upstream rejected request ({status}): {detail}")]
    UpstreamRejected { status: u16, detail: String },

    // Loop control
    #[error("iteration cap exceeded: {cap}")]
    IterationCapExceeded { cap: u32 },
    #[error("unknown dispatch target: {name}")]
    UnknownDispatchTarget { name: String },

    #[error("cancelled")]
    Cancelled,
}

impl InvokeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. } | Self::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UpstreamRejected { .. })
    }

    /// Short classification string for logging and event payloads.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Timeout(_) => "timeout",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::IterationCapExceeded { .. } => "iteration_cap_exceeded",
            Self::UnknownDispatchTarget { .. } => "unknown_dispatch_target",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code. Connection-level failures map to
    /// UpstreamUnavailable before a status is ever available.
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            429 | 500..=599 => Self::UpstreamUnavailable {
                detail: format!("status {status}: {detail}"),
            },
            400..=499 => Self::UpstreamRejected { status, detail },
            _ => Self::UpstreamRejected {
                status,
                detail: format!("unexpected status: {detail}"),
            },
        }
    }
}
