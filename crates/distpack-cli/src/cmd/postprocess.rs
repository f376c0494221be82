//! `postprocess`

use std::path::Path;

use anyhow::{Context, Result};
use distpack_core::postprocess::Postprocessor;
use distpack_core::{BuildContext, Config};

/// Strip `file` into `output`, keeping debug info in `debuginfo`.
pub fn postprocess(
    config: &Config,
    ctx: &BuildContext,
    export_prefix: &str,
    file: &Path,
    output: &Path,
    debuginfo: &Path,
) -> Result<()> {
    let toolchain = config.toolchain()?;
    Postprocessor::new(&toolchain, ctx.host, export_prefix)
        .run(file, output, debuginfo)
        .with_context(|| format!("Failed to postprocess {}", file.display()))
}
