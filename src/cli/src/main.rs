//! Firebox CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use firebox_cli::commands::{dispatch, Cli};
use firebox_core::BoxError;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(hint) = e.downcast_ref::<BoxError>().and_then(hint) {
                eprintln!("Hint: {hint}");
            }
            std::process::exit(1);
        }
    }
}

fn hint(error: &BoxError) -> Option<&str> {
    match error {
        BoxError::ValidationError { hint, .. } | BoxError::LaunchError { hint, .. } => {
            hint.as_deref()
        }
        _ => None,
    }
}
