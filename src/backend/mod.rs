//! Chinachu recording server client

pub mod client;
pub mod errors;
pub mod types;

pub use client::BackendClient;
pub use errors::BackendError;
pub use types::*;
