use echelon_core::errors::InvokeError;
use echelon_core::run::RunStatus;
use echelon_store::StoreError;

/// Failures surfaced by run orchestration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("hierarchy not found: {0}")]
    HierarchyNotFound(String),

    #[error("invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("run is {status}, operation not valid in this state")]
    InvalidState { status: RunStatus },

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Short classification string for logging and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunNotFound(_) => "run_not_found",
            Self::HierarchyNotFound(_) => "hierarchy_not_found",
            Self::InvalidHierarchy(_) => "invalid_hierarchy",
            Self::InvalidState { .. } => "invalid_state",
            Self::Invoke(e) => e.error_kind(),
            Self::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_converts() {
        let e: EngineError = StoreError::NotFound("run x".into()).into();
        assert_eq!(e.kind(), "store");
    }

    #[test]
    fn invoke_kind_passes_through() {
        let e: EngineError = InvokeError::UpstreamUnavailable { detail: "down".into() }.into();
        assert_eq!(e.kind(), "upstream_unavailable");
    }

    #[test]
    fn invalid_state_display_names_status() {
        let e = EngineError::InvalidState { status: RunStatus::Completed };
        assert!(e.to_string().contains("completed"));
    }
}
