use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeriodicError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error text returned by the server, passed through verbatim.
    #[error("{0}")]
    Server(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PeriodicError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PeriodicError::JobNotFound(_))
    }
}

impl From<rusqlite::Error> for PeriodicError {
    fn from(e: rusqlite::Error) -> Self {
        PeriodicError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PeriodicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PeriodicError::JobNotFound("f/n".to_string());
        assert_eq!(err.to_string(), "Job not found: f/n");
        assert!(err.is_not_found());

        let err = PeriodicError::Decode("missing name".to_string());
        assert_eq!(err.to_string(), "Decode error: missing name");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: PeriodicError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, PeriodicError::Storage(_)));
    }
}
