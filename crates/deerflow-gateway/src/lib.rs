//! HTTP gateway: runs the agent set per request and streams its events over
//! two SSE wire protocols.
//!
//! - `POST /v1/chat/completions`: raw text frames plus tool-call frames; the
//!   thread id travels in the `x-thread-id` response header.
//! - `POST /api/chat/stream`: thread-oriented JSON frames.
//!
//! On both endpoints an interrupted run is checkpointed under its thread id
//! and resumed by a later request carrying `interrupt_feedback`.

pub mod adapter;
pub mod chat;
pub mod checkpoint;
pub mod server;
pub mod state;

pub use checkpoint::CheckpointStore;
pub use server::{router, start_gateway};
pub use state::GatewayState;
