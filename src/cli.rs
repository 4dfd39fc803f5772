//! Command-line interface.

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "opsdesk", version, about = "Session presence backend and desktop session keeper")]
pub struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable, for terminals
    Pretty,
    /// One JSON object per line, for log shippers
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the presence backend
    Serve,
    /// Keep a device session alive against the backend at `API_BASE_URL`
    Agent(AgentArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct AgentArgs {
    /// Stable identifier of this device
    #[arg(long)]
    pub device_id: String,
    /// Human-readable device name shown in presence listings
    #[arg(long)]
    pub device_name: String,
    /// User the session belongs to
    #[arg(long)]
    pub user_id: i64,
    /// Cache key prefixes to invalidate when the server reports pending sync work
    #[arg(long = "invalidate", value_delimiter = ',')]
    pub invalidate_on_sync: Vec<String>,
}
