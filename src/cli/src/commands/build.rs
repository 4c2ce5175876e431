//! `firebox build` command - image to rootfs artifact.

use std::path::PathBuf;

use clap::Args;
use firebox_core::{parse_size_bytes, BuildConfig};
use firebox_runtime::{open_source, Artifact, ArtifactBuilder, InitProgram, ShutdownSignals};

use crate::output::format_bytes;

#[derive(Args)]
pub struct BuildArgs {
    /// Image reference (e.g., "alpine:3.19", "ghcr.io/org/app@sha256:...")
    /// or path to a saved archive (.tar, .tar.gz, .tgz)
    pub input: String,

    /// Directory the artifact directory is created in
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Filesystem size (e.g., "512m", "2g"); minimized automatically when unset
    #[arg(long)]
    pub size: Option<String>,

    /// Replace the image entrypoint (shell-style words); clears CMD
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Only print the artifact directory
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BuildConfig::from_env();
    config.output_dir = args.output.clone();
    config.size_bytes = args
        .size
        .as_deref()
        .map(parse_size_bytes)
        .transpose()
        .map_err(|e| format!("Invalid --size: {e}"))?;
    config.entrypoint_override = parse_entrypoint(args.entrypoint.as_deref())?;

    if !args.quiet {
        println!("Building {}...", args.input);
    }
    // Dropping the build on a signal removes its scratch tree and partial image.
    let mut signals = ShutdownSignals::listen()?;
    let artifact = signals
        .run(convert(&args.input, config))
        .await
        .map_err(|signal| format!("Build interrupted by {signal}"))??;

    if args.quiet {
        println!("{}", artifact.dir.display());
    } else {
        let size = artifact.metadata.block_count * artifact.metadata.block_size;
        println!(
            "Built: {} ({}, {})",
            artifact.dir.display(),
            format_bytes(size),
            match &artifact.metadata.init {
                InitProgram::Generated { path } => format!("init {path}"),
                InitProgram::ExistingInit => "image init".to_string(),
            }
        );
    }
    Ok(())
}

async fn convert(input: &str, config: BuildConfig) -> firebox_core::Result<Artifact> {
    let mut source = open_source(input).await?;
    ArtifactBuilder::new(config).build(source.as_mut()).await
}

/// Split an `--entrypoint` value into argv.
fn parse_entrypoint(value: Option<&str>) -> Result<Option<Vec<String>>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    let words =
        shell_words::split(value).map_err(|e| format!("Invalid --entrypoint '{value}': {e}"))?;
    if words.is_empty() {
        return Err("Invalid --entrypoint: empty command".to_string());
    }
    Ok(Some(words))
}
