//! `write-wheel`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use distpack_core::layout;
use distpack_core::{BuildContext, Config, ToolKind};
use distpack_schema::System;

/// Package `artifacts` into a wheel. Linux wheels are audited when an
/// auditwheel program has been configured; a missing auditwheel fails
/// before the wheel is written.
pub fn write_wheel(
    config: &Config,
    output: &Path,
    ctx: Option<&BuildContext>,
    metadata: Option<&Path>,
    artifacts: &[PathBuf],
) -> Result<()> {
    let toolchain = config.toolchain()?;
    let audit = (ctx.map(|c| c.host) == Some(System::Linux)
        && toolchain.is_configured(ToolKind::Auditwheel))
    .then(|| toolchain.tool(ToolKind::Auditwheel));
    match &audit {
        Some(tool) => {
            tool.resolve()?;
        }
        None => tracing::debug!("skipping wheel audit"),
    }

    layout::write_wheel(output, metadata, artifacts, audit.as_ref())
        .with_context(|| format!("Failed to write {}", output.display()))
}
