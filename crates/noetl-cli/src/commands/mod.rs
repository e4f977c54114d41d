//! CLI subcommand implementations.

pub mod execute;
pub mod process;
pub mod register;
pub mod run;
