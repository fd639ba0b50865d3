//! devlink Server - Axum-based HTTP API and session streams
//!
//! This crate wires providers to the lifecycle controller and exposes the
//! session API, the QR image endpoint and the push stream.

pub mod gateway;
pub mod http;
pub mod qr;
pub mod service;
pub mod state;
pub mod websocket;

pub use gateway::StreamGateway;
pub use http::{create_router, ApiError};
pub use service::{CreateSession, LinkService, LiveAttachment};
pub use state::AppState;
pub use websocket::handle_stream_socket;
