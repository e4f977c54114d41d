// NoETL CLI
//
// Decision: clap derive for argument parsing; text/json output for
// scripting; exit codes 0 = success, 1 = user error, 2 = system error,
// 3 = validation error.

mod client;
mod commands;
mod error;
mod output;

use clap::{Parser, Subcommand};

use error::CliError;

#[derive(Parser)]
#[command(name = "noetl")]
#[command(about = "NoETL - distributed workflow runtime")]
#[command(version)]
pub struct Cli {
    /// Server base URL
    #[arg(long, env = "NOETL_SERVER_URL", default_value = "http://localhost:8082")]
    pub server_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a playbook from a YAML file
    Register {
        /// Playbook file
        file: std::path::PathBuf,

        /// Catalog path (defaults to the file stem)
        #[arg(long)]
        path: Option<String>,

        /// Explicit version (defaults to next)
        #[arg(long)]
        version: Option<i64>,
    },

    /// Start an execution of a registered playbook
    Run {
        /// Catalog path of the playbook
        path: String,

        /// Playbook version (defaults to latest)
        #[arg(long)]
        version: Option<i64>,

        /// Workload overrides, `key=value` (values parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Deep-merge overrides into the workload
        #[arg(long)]
        merge: bool,

        /// Poll until the execution reaches a terminal state
        #[arg(long)]
        watch: bool,
    },

    /// Inspect executions
    Execute {
        #[command(subcommand)]
        command: commands::execute::ExecuteCommand,
    },

    /// Control the orchestrator server process
    Server {
        #[command(subcommand)]
        command: commands::process::ProcessCommand,
    },

    /// Control a worker process
    Worker {
        #[command(subcommand)]
        command: commands::process::ProcessCommand,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = dispatch(cli).await;

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let client = client::NoetlClient::new(&cli.server_url);
    let format = output::Format::parse(&cli.output);

    match cli.command {
        Commands::Register {
            file,
            path,
            version,
        } => commands::register::run(&client, format, &file, path, version).await,
        Commands::Run {
            path,
            version,
            set,
            merge,
            watch,
        } => commands::run::run(&client, format, &path, version, &set, merge, watch).await,
        Commands::Execute { command } => commands::execute::run(&client, format, command).await,
        Commands::Server { command } => commands::process::run("noetl-server", command),
        Commands::Worker { command } => commands::process::run("noetl-worker", command),
    }
}
