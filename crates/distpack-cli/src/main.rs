//! distpack CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use distpack_cli::{Cli, Commands, cmd, load_config};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::WriteBdist {
            output,
            host,
            include_subdir,
            readme,
            artifacts,
        } => cmd::bdist::write_bdist(
            &output,
            &host.context()?,
            &include_subdir,
            readme.as_deref(),
            &artifacts,
        ),
        Commands::WriteWheel {
            output,
            host,
            metadata,
            artifacts,
        } => cmd::wheel::write_wheel(
            &config,
            &output,
            host.context()?.as_ref(),
            metadata.as_deref(),
            &artifacts,
        ),
        Commands::Postprocess {
            output,
            debuginfo,
            host,
            export_prefix,
            file,
        } => cmd::postprocess::postprocess(
            &config,
            &host.context()?,
            &export_prefix,
            &file,
            &output,
            &debuginfo,
        ),
        Commands::MergeUniversal {
            output,
            arch_tokens,
            inputs,
        } => cmd::merge::merge_universal(&config, &output, &arch_tokens, &inputs),
    }
}
