//! # wagate-server
//!
//! axum REST + SSE surface over the instance manager.
//!
//! - **Admin routes**: instance CRUD, connect/disconnect, settings, logs
//! - **Send routes**: text and media, authorized by the instance api key
//! - **SSE**: per-instance event stream
//!
//! ## Crate Position
//!
//! Depends on: wagate-core, wagate-engine, wagate-telemetry.
//! Depended on by: wagate (binary).

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
mod handlers;
pub mod server;
mod sse;

pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerHandle};
