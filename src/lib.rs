pub mod app;
pub mod cache;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod presence;
pub mod state;
pub mod utils;
pub mod web;
