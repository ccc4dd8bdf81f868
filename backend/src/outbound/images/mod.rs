//! Image storage adapter used by the cleanup worker.
//!
//! Image storage itself lives in another service; this adapter records the
//! deletion request so the worker can run end to end without a storage
//! backend configured.

use async_trait::async_trait;

use crate::domain::ports::{ImageStore, ImageStoreError};

/// Image store that logs deletions instead of performing them.
#[derive(Debug, Clone, Default)]
pub struct LoggingImageStore;

impl LoggingImageStore {
    /// Create a new logging store.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageStore for LoggingImageStore {
    async fn delete_image(&self, image_id: &str) -> Result<(), ImageStoreError> {
        if image_id.trim().is_empty() {
            return Err(ImageStoreError::not_found(image_id));
        }
        // Warn so a deployment without a real store is noticed.
        tracing::warn!(image_id, "LoggingImageStore: image deletion not performed (no storage backend)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[tokio::test]
    async fn logging_store_accepts_deletions() {
        let store = LoggingImageStore::new();

        let result = store.delete_image("img1").await;
        assert!(result.is_ok(), "logging store delete should succeed");
    }

    #[rstest]
    #[tokio::test]
    async fn blank_identifiers_are_reported_missing() {
        let store = LoggingImageStore::new();

        let result = store.delete_image("  ").await;
        assert_eq!(result, Err(ImageStoreError::not_found("  ")));
    }
}
