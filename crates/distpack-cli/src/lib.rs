//! distpack - deterministic archive packaging
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
//!
//! Command-line front end over `distpack-core`: writes binary
//! distributions and wheels, post-processes binaries, and merges
//! per-architecture macOS archives into a universal one.

pub mod cmd;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use distpack_core::{BuildContext, Config};
use distpack_schema::System;

#[derive(Debug, Parser)]
#[command(name = "distpack")]
#[command(author, version = env!("DISTPACK_VERSION"), about = "distpack - deterministic archive packaging")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file with tool overrides and merge settings
    #[arg(long, global = true, env = "DISTPACK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a binary distribution archive
    WriteBdist {
        /// Output archive (.tar.xz, or .zip for Windows hosts)
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        host: HostArgs,
        /// Subdirectory of include/ for headers
        #[arg(long, default_value = "")]
        include_subdir: String,
        /// README copied to the archive root
        #[arg(long)]
        readme: Option<PathBuf>,
        /// Files and directories to package
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,
    },
    /// Write a Python wheel
    WriteWheel {
        /// Output wheel; the filename supplies name, version and tag
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        host: OptionalHostArgs,
        /// Core metadata file stored as METADATA
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Files and directories to package
        artifacts: Vec<PathBuf>,
    },
    /// Split debug info, check exports and fix the rpath of a binary
    Postprocess {
        /// Stripped output binary
        #[arg(short, long)]
        output: PathBuf,
        /// Debug info output
        #[arg(short, long)]
        debuginfo: PathBuf,
        #[command(flatten)]
        host: HostArgs,
        /// Prefix every exported library symbol must carry
        #[arg(long, default_value = "openslide_")]
        export_prefix: String,
        /// Binary to process
        file: PathBuf,
    },
    /// Merge per-architecture macOS archives into a universal archive
    MergeUniversal {
        /// Output archive (.tar.xz)
        #[arg(short, long)]
        output: PathBuf,
        /// Path segment marking architecture-specific content (repeatable)
        #[arg(long = "arch-token")]
        arch_tokens: Vec<String>,
        /// Input archives, one per architecture
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,
    },
}

/// Where the host system comes from.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct HostArgs {
    /// Host system (linux, macos/darwin, windows)
    #[arg(long)]
    pub host: Option<System>,
    /// Meson build directory to read the host machine from
    #[arg(long)]
    pub build_dir: Option<PathBuf>,
}

impl HostArgs {
    pub fn context(&self) -> Result<BuildContext> {
        resolve_context(self.host, self.build_dir.as_deref())?
            .context("No host system given")
    }
}

/// Host system, when the command can do without one.
#[derive(Debug, Args)]
#[group(required = false, multiple = false)]
pub struct OptionalHostArgs {
    /// Host system (linux, macos/darwin, windows)
    #[arg(long)]
    pub host: Option<System>,
    /// Meson build directory to read the host machine from
    #[arg(long)]
    pub build_dir: Option<PathBuf>,
}

impl OptionalHostArgs {
    pub fn context(&self) -> Result<Option<BuildContext>> {
        resolve_context(self.host, self.build_dir.as_deref())
    }
}

fn resolve_context(host: Option<System>, build_dir: Option<&Path>) -> Result<Option<BuildContext>> {
    match (host, build_dir) {
        (Some(host), _) => Ok(Some(BuildContext::new(host))),
        (None, Some(dir)) => BuildContext::from_build_dir(dir)
            .map(Some)
            .with_context(|| format!("Failed to load build context from {}", dir.display())),
        (None, None) => Ok(None),
    }
}

/// Load the config file if one was given, else the defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::default()),
    }
}
