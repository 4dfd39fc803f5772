//! Server-side session presence tracking.

pub mod errors;
pub mod models;
pub mod postgres;
pub mod store;
pub mod tracker;

pub use errors::PresenceError;
pub use models::{
    HeartbeatAck, HeartbeatRequest, NewSession, PresenceSnapshot, PresenceThresholds, Session,
    SessionRecord, SessionStatus, StartSessionRequest, UserProfile,
};
pub use postgres::PgSessionStore;
pub use store::{MemorySessionStore, NoBacklog, SessionStore, SyncBacklog, UserDirectory};
pub use tracker::{PresenceTracker, aggregate};
