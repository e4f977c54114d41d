//! NoETL orchestrator server.
//!
//! The server owns execution state: it folds worker events into the
//! durable log, evaluates step gates and `next` edges, and issues fresh
//! commands onto the queue. The scheduler is an event-sourced state
//! machine; `engine::Orchestrator::evaluate` is a pure function from
//! `(playbook, events)` to the next commands and derived events.

pub mod api;
pub mod config;
pub mod engine;
pub mod services;

pub use config::ServerConfig;
pub use engine::{Orchestrator, Projection, Scheduler};
