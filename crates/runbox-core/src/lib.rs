//! Core types for streamed remote code execution.
//!
//! This crate provides the fundamental building blocks:
//! - `OutputFrame` - Typed output frame enum
//! - `ExecutionRequest` / `ExecutionResponse` - Request and synchronous result
//! - `ClientConfig` - Endpoints and timing
//! - Storage, fallback and UI collaborator traits

pub mod config;
pub mod frame;
pub mod request;
pub mod traits;

pub use config::ClientConfig;
pub use frame::OutputFrame;
pub use request::{ExecuteCommand, ExecutionRequest, ExecutionResponse, Language};
pub use traits::{Editor, FallbackExecutor, SessionId, SessionStatus, SessionStorage, Terminal};
