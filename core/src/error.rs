use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscError {
    #[error("Structural corruption: {0}")]
    Corrupt(String),

    #[error("Fixup mismatch in sector {sector}: expected {expected:#06x}, found {found:#06x}")]
    FixupMismatch {
        sector: usize,
        expected: u16,
        found: u16,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stale file reference: {0}")]
    StaleReference(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl DiscError {
    /// True for the expected "absent" outcome that callers branch on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscError::NotFound(_))
    }

    /// True for errors describing damaged on-disk metadata.
    pub fn is_corruption(&self) -> bool {
        matches!(self, DiscError::Corrupt(_) | DiscError::FixupMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DiscError::NotFound("x".into()).is_not_found());
        assert!(!DiscError::Corrupt("x".into()).is_not_found());
        assert!(DiscError::FixupMismatch { sector: 1, expected: 2, found: 3 }.is_corruption());
        assert!(!DiscError::CapacityExceeded("x".into()).is_corruption());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: DiscError = io.into();
        assert!(matches!(err, DiscError::IoError(_)));
        assert!(err.to_string().contains("short read"));
    }
}
