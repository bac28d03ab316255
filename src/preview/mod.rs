//! Preview fetching
//!
//! Serializes preview image downloads through a single fetch slot and
//! serves repeats from the persistent cache.

pub mod scheduler;
pub mod source;

pub use scheduler::PreviewScheduler;

use crate::backend::BackendError;

/// Errors settled on a preview request
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Preview request dropped before completion")]
    Dropped,
}
