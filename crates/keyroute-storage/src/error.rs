//! Storage errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data in {path}: {reason}")]
    InvalidData { path: String, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for keyroute_core::Error {
    fn from(err: StorageError) -> Self {
        keyroute_core::Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_core_error() {
        let err: keyroute_core::Error = StorageError::Serialization("bad".to_string()).into();
        assert!(matches!(err, keyroute_core::Error::Storage(msg) if msg.contains("bad")));
    }
}
