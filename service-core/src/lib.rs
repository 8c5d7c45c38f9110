//! service-core: Shared infrastructure for the security engine services.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;

pub use axum;
pub use tracing;
