use thiserror::Error;

/// Error raised when a configuration value fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing from the configuration.
    #[error("missing required field: {field}")]
    MissingField { field: String },

    /// A field value violates a constraint.
    #[error("invalid value for field '{field}': {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::InvalidFieldValue {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}
