//! NoETL worker runtime.
//!
//! Workers claim commands from the server's queue, render tool spec and
//! arguments against the command-carried context, dispatch to the named
//! tool plugin, and report facts back through the event API. Everything
//! a worker knows about an execution arrives inside the command; the
//! server owns all state.

pub mod cache;
pub mod client;
pub mod config;
pub mod runtime;
pub mod tools;

pub use client::ApiClient;
pub use config::WorkerConfig;
pub use runtime::Worker;
pub use tools::{Tool, ToolCall, ToolError, ToolErrorKind, ToolRegistry};
