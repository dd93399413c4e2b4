//! Synchronous execution path.
//!
//! Provides:
//! - `HttpFallback` - `POST /api/execute` client
//! - Translation of a synchronous result into output frames
//! - Shared snippet lookup

pub mod fallback;
pub mod snippets;

pub use fallback::{FALLBACK_FAILURE_MESSAGE, HttpFallback, fallback_frames, response_frames};
pub use snippets::{Snippet, SnippetClient};
