//! `merge-universal`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use distpack_core::Config;
use distpack_core::merge;

/// Merge per-architecture archives into one universal archive.
pub fn merge_universal(
    config: &Config,
    output: &Path,
    arch_tokens: &[String],
    inputs: &[PathBuf],
) -> Result<()> {
    let lipo = config.toolchain()?.lipo();
    let tokens = config.arch_tokens(arch_tokens);
    let stats = merge::merge_universal(inputs, output, &lipo, tokens)
        .with_context(|| format!("Failed to merge into {}", output.display()))?;

    println!(
        "Wrote {} ({} shared, {} per-architecture, {} universal binaries)",
        output.display(),
        stats.kept,
        stats.relocated,
        stats.universal
    );
    Ok(())
}
