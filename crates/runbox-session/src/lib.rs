//! Session orchestration and run control.
//!
//! Provides:
//! - `SessionOrchestrator` - One streamed execution per request, with fallback
//! - `RunController` - Single-flight "Run" action relaying output to a terminal
//! - Storage implementations

pub mod controller;
pub mod orchestrator;
pub mod storage;

pub use controller::{RunController, RunState};
pub use orchestrator::{FrameStream, OrchestratorError, OrchestratorOptions, SessionOrchestrator};
