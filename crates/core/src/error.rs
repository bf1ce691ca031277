use serde::{Deserialize, Serialize};

/// Errors raised while expanding generators, rendering templates or writing
/// Applications. Every variant is reportable as a status condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// An external dependency (repo, config map, cluster API) could not be read.
    #[error("source unavailable [{source_kind}]: {message}")]
    SourceUnavailable { source_kind: String, message: String },
    /// Two Matrix children produced the same parameter key.
    #[error("ambiguous parameter key '{0}' produced by more than one matrix child")]
    AmbiguousParameterKey(String),
    #[error("unresolved parameter '{placeholder}' in {field}")]
    UnresolvedParameter { placeholder: String, field: String },
    #[error("generator {generator} timed out after {after_ms}ms")]
    GeneratorTimeout { generator: String, after_ms: u64 },
    /// Optimistic-concurrency collision while writing an object.
    #[error("conflict writing {0}")]
    ReconcileConflict(String),
    #[error("merge key values are not unique: {0}")]
    NonUniqueMergeKey(String),
    #[error("duplicate application name: {0}")]
    DuplicateApplicationName(String),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn source_unavailable(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable { source_kind: kind.into(), message: message.to_string() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSpec(message.into())
    }

    /// Whether a later attempt with unchanged input may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::GeneratorTimeout { .. } | Self::ReconcileConflict(_) | Self::Internal(_)
        )
    }

    /// Condition reason recorded on the owning ApplicationSet.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } | Self::GeneratorTimeout { .. } => "ApplicationGenerationFromParamsError",
            Self::AmbiguousParameterKey(_) | Self::NonUniqueMergeKey(_) | Self::InvalidSpec(_) => "ApplicationGenerationFromParamsError",
            Self::UnresolvedParameter { .. } => "RenderTemplateParamsError",
            Self::DuplicateApplicationName(_) => "ApplicationValidationError",
            Self::ReconcileConflict(_) | Self::NotFound(_) | Self::Internal(_) => "UpdateApplicationError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::source_unavailable("git", "connection refused").is_retryable());
        assert!(Error::GeneratorTimeout { generator: "git".into(), after_ms: 10 }.is_retryable());
        assert!(Error::ReconcileConflict("ns/app".into()).is_retryable());
        assert!(!Error::AmbiguousParameterKey("path".into()).is_retryable());
        assert!(!Error::UnresolvedParameter { placeholder: "x".into(), field: "metadata.name".into() }.is_retryable());
    }

    #[test]
    fn messages_name_the_offender() {
        let e = Error::UnresolvedParameter { placeholder: "values.name".into(), field: "metadata.name".into() };
        assert_eq!(e.to_string(), "unresolved parameter 'values.name' in metadata.name");
        assert_eq!(e.reason(), "RenderTemplateParamsError");
    }
}
