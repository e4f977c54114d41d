//! Core types for the NoETL workflow engine.
//!
//! This crate holds everything the server, worker, and CLI agree on:
//!
//! - The playbook DSL (`playbook`) and its registration-time validator
//!   (`validate`)
//! - The append-only event model (`event`): fixed event-type vocabulary,
//!   statuses, and the event record itself
//! - Time-sortable snowflake identifiers (`ids`)
//!
//! Events are immutable once written; all engine state is derived by
//! folding them in `event_id` order.

pub mod error;
pub mod event;
pub mod ids;
pub mod playbook;
pub mod validate;

pub use error::CoreError;
pub use event::{Event, EventType, Status};
pub use ids::SnowflakeGenerator;
pub use playbook::{
    Collect, LoopSpec, NextEdge, Playbook, ResultSpec, RetrySpec, SinkSpec, Step, ToolSpec,
};
pub use validate::validate_playbook;

/// Reserved context name exposing per-step status; writes to it are rejected.
pub const STEP_NAMESPACE: &str = "step";

/// Well-known id of the entry step every workflow must declare.
pub const START_STEP: &str = "start";
