//! Desktop-client side of the backend API: a JSON client, a cached read
//! path over the request coalescer, and the session-lifecycle calls.

pub mod api;
pub mod cached;
pub mod presence;

pub use api::{ApiClient, ApiClientError};
pub use cached::CachedApi;
pub use presence::HttpPresenceApi;
