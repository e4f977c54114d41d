//! `noetl server|worker start|stop`
//!
//! Start spawns the sibling binary detached and records its pid under
//! `~/.noetl/`; stop signals that pid with SIGTERM.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use clap::Subcommand;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::CliError;

#[derive(Subcommand)]
pub enum ProcessCommand {
    /// Start the process in the background
    Start {
        /// Stay attached and wait for the process to exit
        #[arg(long)]
        foreground: bool,
    },

    /// Stop a previously started process
    Stop,
}

fn state_dir() -> Result<PathBuf, CliError> {
    let dir = dirs::home_dir()
        .ok_or_else(|| CliError::System("cannot determine home directory".to_string()))?
        .join(".noetl");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn pid_file(binary: &str) -> Result<PathBuf, CliError> {
    Ok(state_dir()?.join(format!("{binary}.pid")))
}

/// Locate the sibling binary next to the CLI, falling back to PATH.
fn binary_path(binary: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| {
            let sibling = exe.parent()?.join(binary);
            sibling.exists().then_some(sibling)
        })
        .unwrap_or_else(|| PathBuf::from(binary))
}

pub fn run(binary: &str, command: ProcessCommand) -> Result<(), CliError> {
    match command {
        ProcessCommand::Start { foreground } => start(binary, foreground),
        ProcessCommand::Stop => stop(binary),
    }
}

fn start(binary: &str, foreground: bool) -> Result<(), CliError> {
    let pid_path = pid_file(binary)?;
    if let Ok(existing) = fs::read_to_string(&pid_path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if kill(Pid::from_raw(pid), None).is_ok() {
                return Err(CliError::User(format!(
                    "{binary} already running (pid {pid})"
                )));
            }
        }
    }

    let mut child = Command::new(binary_path(binary))
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| CliError::System(format!("cannot start {binary}: {e}")))?;

    fs::write(&pid_path, child.id().to_string())?;
    println!("{binary} started (pid {})", child.id());

    if foreground {
        let status = child
            .wait()
            .map_err(|e| CliError::System(format!("wait failed: {e}")))?;
        let _ = fs::remove_file(&pid_path);
        if !status.success() {
            return Err(CliError::System(format!("{binary} exited with {status}")));
        }
    }
    Ok(())
}

fn stop(binary: &str) -> Result<(), CliError> {
    let pid_path = pid_file(binary)?;
    let raw = fs::read_to_string(&pid_path)
        .map_err(|_| CliError::User(format!("{binary} is not running (no pid file)")))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|_| CliError::System(format!("corrupt pid file {}", pid_path.display())))?;

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| CliError::System(format!("cannot signal pid {pid}: {e}")))?;
    let _ = fs::remove_file(&pid_path);
    println!("{binary} stopped (pid {pid})");
    Ok(())
}
