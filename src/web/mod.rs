//! HTTP API for session presence.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod sessions;
pub mod status;

pub use routes::*;
