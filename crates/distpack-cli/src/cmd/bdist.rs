//! `write-bdist`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use distpack_core::BuildContext;
use distpack_core::layout::{self, BdistLayout};

/// Package `artifacts` into a binary distribution for the context's host.
pub fn write_bdist(
    output: &Path,
    ctx: &BuildContext,
    include_subdir: &str,
    readme: Option<&Path>,
    artifacts: &[PathBuf],
) -> Result<()> {
    let mut bdist = BdistLayout::new(include_subdir);
    if let Some(readme) = readme {
        bdist = bdist.with_readme(readme);
    }
    layout::write_bdist(output, ctx, &bdist, artifacts)
        .with_context(|| format!("Failed to write {}", output.display()))
}
