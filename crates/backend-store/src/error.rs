use backend_core::{BackendError, BackendErrorCategory};
use thiserror::Error;

/// Errors returned by the room state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode or decode encryption config: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("failed to prepare store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("no {what} stored for {key}")]
    NotFound { what: &'static str, key: String },
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        let code = if err.is_not_found() {
            "not_found"
        } else {
            "storage_error"
        };
        BackendError::new(BackendErrorCategory::Storage, code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_storage_category() {
        let err = BackendError::from(StoreError::LockPoisoned);
        assert_eq!(err.category, BackendErrorCategory::Storage);
        assert_eq!(err.code, "storage_error");

        let err = BackendError::from(StoreError::NotFound {
            what: "sync cursor",
            key: "@bot:example.org".to_owned(),
        });
        assert_eq!(err.code, "not_found");
        assert_eq!(err.message, "no sync cursor stored for @bot:example.org");
    }
}
