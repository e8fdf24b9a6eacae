use clap::{Parser, Subcommand, ValueEnum};

pub use super::commands::runner::RunnerArgs;
pub use super::commands::worker::WorkerArgs;

#[derive(Parser)]
#[command(
    name = "tandem",
    version,
    about = "Out-of-process test engines: a runner that listens and a worker that connects"
)]
pub struct Cli {
    /// Log output format (stderr). Filter with RUST_LOG.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Listen for a worker, run operations on it, print its messages
    Runner(RunnerArgs),
    /// Connect to a runner and answer its requests
    Worker(WorkerArgs),
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}
