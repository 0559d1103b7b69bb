//! HTTP surface: REST endpoints for hierarchies and runs, plus the
//! per-run SSE event stream.

pub mod handlers;
pub mod server;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
