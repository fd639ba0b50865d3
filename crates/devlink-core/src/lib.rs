//! devlink Core - Shared types and protocol definitions
//!
//! This crate provides the foundational types used across all devlink components.

pub mod config;
pub mod error;
pub mod protocol;
pub mod status;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::StreamFrame;
pub use status::{Capabilities, ProviderKind, SessionStatus};
