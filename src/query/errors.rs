#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

/// Structured errors emitted by the rewriting pipeline.
///
/// Binding errors are fatal: the query cannot compile. They carry the
/// entity and member names so callers can diagnose model/query mismatches
/// without re-running the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A property-access call names a property absent from the entity type.
    #[error("unknown property '{property}' on entity '{entity}'")]
    UnknownProperty {
        /// Entity the access was resolved against.
        entity: String,
        /// Property name as written in the query.
        property: String,
    },
    /// The queried entity type is not part of the model.
    #[error("unknown entity type '{entity}'")]
    UnknownEntity {
        /// Entity name as written in the query.
        entity: String,
    },
    /// A collection navigation was dereferenced mid-path.
    #[error("collection navigation '{navigation}' on '{entity}' cannot be traversed further; collections may only terminate a path")]
    CollectionTraversal {
        /// Entity declaring the navigation.
        entity: String,
        /// Collection navigation that was dereferenced.
        navigation: String,
    },
    /// A source reference escaped every scope the compiler knows about.
    #[error("source reference {id} is not bound in any enclosing query scope")]
    UnboundSource {
        /// Raw id of the dangling source reference.
        id: u32,
    },
    /// A captured expression could not be evaluated into a parameter.
    #[error("captured expression '{label}' could not be evaluated: {reason}")]
    CaptureEvaluation {
        /// Diagnostic label of the capture.
        label: String,
        /// Why evaluation failed.
        reason: String,
    },
}

impl CompileError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::UnknownProperty { .. } => "UnknownProperty",
            CompileError::UnknownEntity { .. } => "UnknownEntity",
            CompileError::CollectionTraversal { .. } => "CollectionTraversal",
            CompileError::UnboundSource { .. } => "UnboundSource",
            CompileError::CaptureEvaluation { .. } => "CaptureEvaluation",
        }
    }
}

/// Convenience wrapper that formats compile errors with their codes.
pub struct CompileErrorWithCode<'a>(pub &'a CompileError);

impl fmt::Display for CompileErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

/// Convenience alias for pipeline results.
pub type CompileResult<T> = std::result::Result<T, CompileError>;
