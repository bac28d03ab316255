//! Where preview images come from

use std::future::Future;

use crate::backend::{BackendClient, BackendError, PreviewImage, PreviewRequest};

/// A source of preview images, normally the recording server
pub trait PreviewSource: Send + Sync {
    /// Fetch one preview image over the network
    fn fetch_preview(
        &self,
        request: &PreviewRequest,
    ) -> impl Future<Output = Result<PreviewImage, BackendError>> + Send;
}

impl PreviewSource for BackendClient {
    fn fetch_preview(
        &self,
        request: &PreviewRequest,
    ) -> impl Future<Output = Result<PreviewImage, BackendError>> + Send {
        BackendClient::fetch_preview(self, request)
    }
}
