//! Server-side services over the stores.

pub mod executions;

pub use executions::{ExecutionDetail, ExecutionProgress, ExecutionStatusView};
