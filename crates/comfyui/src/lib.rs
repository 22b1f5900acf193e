//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed response schemas and message parsing, the WebSocket
//! event stream, HTTP API wrappers, reconnection logic, and the
//! [`EngineClient`](engine::EngineClient) trait that the job tracker
//! programs against.

pub mod api;
pub mod client;
pub mod engine;
pub mod messages;
pub mod reconnect;
pub mod schema;
