use thiserror::Error;

/// Errors raised by layer validation, evaluation and persistence.
///
/// None of these are retried internally: a failed validation pass aborts graph
/// construction and a failed forward/backward call aborts the evaluation round.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    /// User-supplied configuration violates a structural constraint.
    #[error("Invalid argument in '{operation}': {reason}")]
    InvalidArgument { operation: String, reason: String },

    /// An internal consistency check failed; upstream wiring is inconsistent.
    #[error("Logic error in '{operation}': {reason}")]
    LogicError { operation: String, reason: String },

    /// Saving or loading a layer record failed.
    #[error("Serialization error in '{operation}': {details}")]
    Serialization { operation: String, details: String },
}

impl ConvError {
    pub fn invalid_argument(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn logic(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LogicError {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Serialization {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    pub fn is_logic_error(&self) -> bool {
        matches!(self, Self::LogicError { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConvError>;
