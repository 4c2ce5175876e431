//! CLI command definitions and dispatch.

mod build;
mod run;

use clap::{Parser, Subcommand};

/// Firebox - container images as Firecracker microVMs.
#[derive(Parser)]
#[command(name = "firebox", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Convert an image reference or saved archive into a rootfs artifact
    Build(build::BuildArgs),
    /// Boot an artifact (or a bare rootfs image) as a microVM
    Run(run::RunArgs),
    /// Show version information
    Version,
}

/// Dispatch a parsed CLI to the appropriate command handler.
///
/// Returns the process exit code.
pub async fn dispatch(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await.map(|()| 0),
        Command::Run(args) => run::execute(args).await,
        Command::Version => {
            println!("{}", version_line());
            Ok(0)
        }
    }
}

fn version_line() -> String {
    format!(
        "firebox version {} (runtime {})",
        firebox_core::VERSION,
        firebox_runtime::VERSION
    )
}
