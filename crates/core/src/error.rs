use thiserror::Error;

use crate::DocumentFormat;

/// Failures raised by adapters and the registry.
///
/// `UnsupportedFormat` and `CorruptDocument` are user-facing and end the open
/// attempt. `LocationNotFound` is always recovered by the caller, which falls
/// back to the first content unit.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt {format} document: {reason}")]
    CorruptDocument {
        format: DocumentFormat,
        reason: String,
    },

    #[error("location not found: {0}")]
    LocationNotFound(String),
}

impl DocumentError {
    pub fn corrupt(format: DocumentFormat, reason: impl Into<String>) -> Self {
        Self::CorruptDocument {
            format,
            reason: reason.into(),
        }
    }

    pub fn not_found(token: impl Into<String>) -> Self {
        Self::LocationNotFound(token.into())
    }

    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::LocationNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_errors_stay_internal() {
        assert!(!DocumentError::not_found("filepos:9").is_user_facing());
        assert!(DocumentError::UnsupportedFormat("azw3".into()).is_user_facing());
        let err = DocumentError::corrupt(DocumentFormat::Mobi, "bad header");
        assert!(err.is_user_facing());
        assert_eq!(err.to_string(), "corrupt mobi document: bad header");
    }
}
