use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A count or capacity that must be positive was zero.
    #[error("`{field}` must be greater than zero")]
    Zero { field: String },
    /// A field holds a value outside its accepted range.
    #[error("Invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}

impl ValidationError {
    /// Returns the dotted path of the offending field.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::Zero { field } => field,
            ValidationError::InvalidFieldValue { field, .. } => field,
        }
    }

    /// Prefixes the field path, used when validating nested configs.
    pub(crate) fn nested(self, prefix: &str) -> Self {
        match self {
            ValidationError::Zero { field } => ValidationError::Zero {
                field: format!("{prefix}.{field}"),
            },
            ValidationError::InvalidFieldValue { field, constraint } => {
                ValidationError::InvalidFieldValue {
                    field: format!("{prefix}.{field}"),
                    constraint,
                }
            }
        }
    }
}
