//! Driven port for removing stored cover images.

use async_trait::async_trait;

use super::define_port_error;

define_port_error! {
    /// Errors raised by image storage adapters.
    pub enum ImageStoreError {
        /// Storage backend rejected or failed the request.
        Backend { #[doc = "Failure detail."] message: String } => "image store backend failure: {message}",
        /// No image exists under the identifier.
        NotFound {
            /// Identifier that was looked up.
            image_id: String,
        } => "image {image_id} not found",
    }
}

/// Port for deleting images by their storage identifier.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Delete the image stored under `image_id`.
    async fn delete_image(&self, image_id: &str) -> Result<(), ImageStoreError>;
}
