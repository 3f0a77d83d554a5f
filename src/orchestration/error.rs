use crate::definition::DefinitionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow definition error: {0}")]
    Definition(String),
    #[error("cyclic dependency involving step `{step_id}`")]
    CyclicDependency { step_id: String },
    #[error("artifact path `{path}` falls outside the allowed roots")]
    PathViolation { path: String },
    #[error("artifact `{reference}` on disk does not match its recorded digest")]
    DigestMismatch { reference: String },
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("workflow `{workflow_id}` is already owned by pid {pid}")]
    ConcurrentModification { workflow_id: String, pid: u32 },
    #[error("state snapshot version {found} is newer than supported version {supported}")]
    IncompatibleVersion { found: u32, supported: u32 },
    #[error("state snapshot at {path} is corrupt: {reason}")]
    StateCorrupt { path: String, reason: String },
    #[error("step `{step_id}` exceeded its deadline of {timeout_seconds}s")]
    Timeout {
        step_id: String,
        timeout_seconds: u64,
    },
    #[error("workflow `{workflow_id}` was cancelled")]
    Cancelled { workflow_id: String },
    #[error("step `{step_id}` dispatch failed: {reason}")]
    DispatchFailed {
        step_id: String,
        reason: String,
        retryable: bool,
    },
    #[error("gate `{gate_id}` failed: {reason}")]
    GateFailed { gate_id: String, reason: String },
    #[error("workflow `{workflow_id}` was started from a different definition")]
    DefinitionDrift { workflow_id: String },
    #[error("internal invariant violation: {0}")]
    Internal(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Definition(_) => "definition_error",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::PathViolation { .. } => "path_violation",
            Self::DigestMismatch { .. } => "digest_mismatch",
            Self::NotFound { .. } => "not_found",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::IncompatibleVersion { .. } => "incompatible_version",
            Self::StateCorrupt { .. } => "state_corrupt",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::GateFailed { .. } => "gate_failed",
            Self::DefinitionDrift { .. } => "definition_drift",
            Self::Internal(_) | Self::Io { .. } | Self::Json { .. } => "internal",
        }
    }
}

impl From<DefinitionError> for EngineError {
    fn from(value: DefinitionError) -> Self {
        Self::Definition(value.to_string())
    }
}

pub fn io_error(path: &std::path::Path, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn json_error(path: &std::path::Path, source: serde_json::Error) -> EngineError {
    EngineError::Json {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_maps_to_a_machine_readable_kind() {
        assert_eq!(EngineError::Definition("x".into()).kind(), "definition_error");
        assert_eq!(
            EngineError::CyclicDependency {
                step_id: "a".into()
            }
            .kind(),
            "cyclic_dependency"
        );
        assert_eq!(
            EngineError::Timeout {
                step_id: "a".into(),
                timeout_seconds: 5
            }
            .kind(),
            "timeout"
        );
        assert_eq!(EngineError::Internal("bug".into()).kind(), "internal");
    }
}
