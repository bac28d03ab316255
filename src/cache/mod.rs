//! Preview caching layer
//!
//! Persists fetched preview images as data URIs so repeated requests for
//! the same recording, format and params skip the network.

pub mod data_uri;
pub mod preview_cache;
pub mod store;

pub use data_uri::DataUri;
pub use preview_cache::PreviewCache;
pub use store::{DiskStore, MemoryStore, PreviewStore};
