//! # wagate-engine
//!
//! Instance lifecycle orchestration.
//!
//! - **Registry**: live instances by id, looked up by name
//! - **Fan-out**: bounded per-subscriber queues with non-blocking broadcast
//! - **Instance**: connect/disconnect/keep-alive/pairing under one cancellable scope
//! - **Webhook**: fire-and-forget POST of normalized messages
//! - **Outbound**: presence and typing choreography around sends
//! - **Manager**: name-addressed facade used by the API layer
//!
//! ## Crate Position
//!
//! Depends on: wagate-core, wagate-store.
//! Depended on by: wagate-server, wagate (binary).

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod fanout;
pub mod instance;
pub mod manager;
pub mod normalize;
pub mod outbound;
pub mod registry;
pub mod sandbox;
pub mod webhook;

pub use config::{EngineConfig, InstanceDefaults};
pub use error::InstanceError;
pub use fanout::{EventFanout, Subscription};
pub use instance::{Instance, InstanceSnapshot};
pub use manager::{ConfigPatch, InstanceManager, QrReport, StatusReport};
pub use outbound::{looks_like_audio, MediaMessage};
pub use sandbox::SandboxConnector;
