//! Where built artifacts go inside binary distributions and wheels.
//!
//! A bdist mirrors an install prefix: libraries under `lib/`, headers under
//! `include/<subdir>/`, executables under `bin/`, and project-level
//! documents at the root. Versioned shared libraries get the usual
//! compatibility symlinks. A wheel flattens everything into the package
//! directory.

use std::fs;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use distpack_schema::{ArchiveFormat, System};
use regex::Regex;
use thiserror::Error;

use crate::archive::{
    ArchiveError, ArchivePath, ArchiveWriter, FileSource, Member, TarArchiveWriter, WheelWriter,
    ZipArchiveWriter, detect_format,
};
use crate::context::BuildContext;
use crate::tools::{Tool, ToolError};

static LIBRARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(lib|dylib(\.dSYM)?|so[.0-9]*(\.debug)?)$").expect("valid library pattern")
});
static SO_FULL_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.so(\.[0-9]+){3}$").expect("valid soname pattern"));
static SO_MINOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\.[0-9]+){2}$").expect("valid soname pattern"));
static SO_ALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\.[0-9]+)+$").expect("valid soname pattern"));
static DYLIB_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[0-9]+\.dylib$").expect("valid dylib pattern"));
static WHEEL_SO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\.so\.[0-9]+)\.[0-9.]+").expect("valid soname pattern"));

/// Artifacts copied to the archive root rather than `bin/`.
pub const ROOT_NAMES: [&str; 4] = ["CHANGELOG.md", "VERSIONS.md", "versions.json", "licenses"];

/// Generator recorded in a wheel's `WHEEL` file.
pub const WHEEL_GENERATOR: &str = "distpack";

/// Errors from assembling a distribution.
#[derive(Error, Debug)]
pub enum LayoutError {
    /// Writing the archive failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A verification tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The output name does not match the format required for the host.
    #[error("{} bdists must be {expected} archives: {path}", .host.display_name())]
    WrongFormat {
        /// Requested output.
        path: String,
        /// Host system.
        host: System,
        /// Required extension.
        expected: &'static str,
    },

    /// `auditwheel show` did not report the wheel's platform tag.
    #[error("Wheel audit failed: platform {platform} not reported:\n{report}")]
    AuditFailed {
        /// Expected platform tag.
        platform: String,
        /// Tool output.
        report: String,
    },
}

/// Top-level bdist directory an artifact belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// `lib/`: import libraries, shared libraries and their debug info
    Lib,
    /// `include/<subdir>/`
    Include,
    /// The archive root
    Root,
    /// `bin/`: everything else
    Bin,
}

impl Placement {
    /// Placement for an artifact named `name`.
    pub fn for_name(name: &str) -> Self {
        if LIBRARY_RE.is_match(name) {
            Self::Lib
        } else if name.ends_with(".h") {
            Self::Include
        } else if ROOT_NAMES.contains(&name) {
            Self::Root
        } else {
            Self::Bin
        }
    }

    /// Directory for this placement under `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidPath`] if `include_subdir` is not a
    /// valid relative path.
    pub fn dir(self, base: &ArchivePath, include_subdir: &str) -> Result<ArchivePath, ArchiveError> {
        match self {
            Self::Lib => base.join("lib"),
            Self::Include => base.join("include")?.join(include_subdir),
            Self::Root => Ok(base.clone()),
            Self::Bin => base.join("bin"),
        }
    }
}

/// Compatibility symlink names for a versioned shared library:
/// `libx.so.1.2.3` gives `libx.so.1` and `libx.so`; `libx.1.dylib` gives
/// `libx.dylib`. Each link targets the original name.
pub fn compat_links(name: &str) -> Vec<String> {
    if SO_FULL_VERSION_RE.is_match(name) {
        vec![
            SO_MINOR_RE.replace(name, "").into_owned(),
            SO_ALL_RE.replace(name, "").into_owned(),
        ]
    } else if DYLIB_VERSION_RE.is_match(name) {
        vec![DYLIB_VERSION_RE.replace(name, ".dylib").into_owned()]
    } else {
        Vec::new()
    }
}

/// Container a bdist for `host` is written in.
pub fn bdist_format(host: System) -> ArchiveFormat {
    match host {
        System::Windows => ArchiveFormat::Zip,
        System::Linux | System::MacOS => ArchiveFormat::TarXz,
    }
}

fn artifact_name(path: &Path) -> Result<&str, ArchiveError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::InvalidPath(path.display().to_string()))
}

/// Placement rules for a binary distribution.
#[derive(Debug, Clone)]
pub struct BdistLayout {
    /// Subdirectory of `include/` that headers go in.
    pub include_subdir: String,
    /// README copied to the archive root.
    pub readme: Option<PathBuf>,
}

impl BdistLayout {
    /// Layout installing headers under `include/<include_subdir>/`.
    pub fn new(include_subdir: impl Into<String>) -> Self {
        Self {
            include_subdir: include_subdir.into(),
            readme: None,
        }
    }

    /// Also copy `readme` to `README.md` at the root.
    #[must_use]
    pub fn with_readme(mut self, readme: impl Into<PathBuf>) -> Self {
        self.readme = Some(readme.into());
        self
    }

    /// Add every artifact to `writer`.
    ///
    /// # Errors
    ///
    /// Returns the first error from the writer, including duplicate paths
    /// and (for zip output) symlinks.
    pub fn populate(
        &self,
        writer: &mut dyn ArchiveWriter,
        artifacts: &[PathBuf],
    ) -> Result<(), ArchiveError> {
        let base = writer.base().clone();
        for path in artifacts {
            let name = artifact_name(path)?;
            let placement = Placement::for_name(name);
            let arcdir = placement.dir(&base, &self.include_subdir)?;
            tracing::debug!(artifact = name, ?placement, "placing");

            if path.is_dir() {
                writer.add_tree(&arcdir, path)?;
                continue;
            }
            writer.add(Member::file(
                arcdir.join(name)?,
                FileSource::Path(path.clone()),
            ))?;
            for link in compat_links(name) {
                writer.add(Member::symlink(arcdir.join(&link)?, name))?;
            }
        }

        if let Some(readme) = &self.readme {
            writer.add(Member::file(
                base.join("README.md")?,
                FileSource::Path(readme.clone()),
            ))?;
        }
        Ok(())
    }
}

/// Write a bdist for `ctx.host` at `output`. The partial file is removed
/// on failure.
///
/// # Errors
///
/// Returns [`LayoutError::WrongFormat`] if the output extension does not
/// match the host, or the first archive error.
pub fn write_bdist(
    output: &Path,
    ctx: &BuildContext,
    layout: &BdistLayout,
    artifacts: &[PathBuf],
) -> Result<(), LayoutError> {
    let expected = bdist_format(ctx.host);
    if detect_format(output).ok() != Some(expected) {
        return Err(LayoutError::WrongFormat {
            path: output.display().to_string(),
            host: ctx.host,
            expected: expected.extension(),
        });
    }

    let result = match expected {
        ArchiveFormat::Zip => ZipArchiveWriter::create(output).and_then(|mut writer| {
            layout.populate(&mut writer, artifacts)?;
            writer.finish().map(drop)
        }),
        _ => TarArchiveWriter::create(output).and_then(|mut writer| {
            layout.populate(&mut writer, artifacts)?;
            writer.finish().map(drop)
        }),
    };
    remove_on_error(output, result)?;
    tracing::info!(output = %output.display(), artifacts = artifacts.len(), "wrote bdist");
    Ok(())
}

/// Name of an artifact inside a wheel: `.so.N.x.y` becomes `.so.N`.
pub fn wheel_data_name(name: &str) -> String {
    WHEEL_SO_RE.replace(name, "$1").into_owned()
}

/// Contents of a wheel's `WHEEL` file.
pub fn wheel_metadata(tag: &str) -> String {
    format!(
        "Wheel-Version: 1.0\nGenerator: {WHEEL_GENERATOR}\nRoot-Is-Purelib: false\nTag: {tag}\n\n"
    )
}

/// Add `METADATA`, licenses, artifacts and `WHEEL` to a wheel.
///
/// # Errors
///
/// Returns the first error from the writer.
pub fn populate_wheel<W: Write + Seek>(
    wheel: &mut WheelWriter<W>,
    metadata: Option<&Path>,
    artifacts: &[PathBuf],
) -> Result<(), ArchiveError> {
    let metadir = wheel.metadir()?;
    let datadir = wheel.datadir().clone();

    if let Some(metadata) = metadata {
        wheel.add(Member::file(
            metadir.join("METADATA")?,
            FileSource::Path(metadata.to_path_buf()),
        ))?;
    }
    for path in artifacts {
        let name = artifact_name(path)?;
        if path.is_dir() {
            let arcdir = if name == "licenses" { &metadir } else { &datadir };
            wheel.add_tree(arcdir, path)?;
        } else {
            wheel.add(Member::file(
                datadir.join(&wheel_data_name(name))?,
                FileSource::Path(path.clone()),
            ))?;
        }
    }
    let tag = wheel.tag();
    wheel.add(Member::file(
        metadir.join("WHEEL")?,
        FileSource::bytes(wheel_metadata(&tag)),
    ))?;
    Ok(())
}

/// Write a wheel at `output`. When `audit` is given (Linux hosts),
/// `auditwheel show` must report the wheel's platform tag.
///
/// # Errors
///
/// Returns an error if the filename is not a wheel name, writing fails, or
/// the audit fails.
pub fn write_wheel(
    output: &Path,
    metadata: Option<&Path>,
    artifacts: &[PathBuf],
    audit: Option<&Tool>,
) -> Result<(), LayoutError> {
    let result = WheelWriter::create(output).and_then(|mut wheel| {
        populate_wheel(&mut wheel, metadata, artifacts)?;
        let platform = wheel.name().platform.clone();
        wheel.finish()?;
        Ok(platform)
    });
    let platform = remove_on_error(output, result)?;

    if let Some(tool) = audit {
        let report = tool.run([Path::new("show"), output])?;
        if !report.contains(&format!("\"{platform}\"")) {
            return Err(LayoutError::AuditFailed { platform, report });
        }
        tracing::debug!(platform = %platform, "wheel audit passed");
    }
    tracing::info!(output = %output.display(), artifacts = artifacts.len(), "wrote wheel");
    Ok(())
}

fn remove_on_error<T>(output: &Path, result: Result<T, ArchiveError>) -> Result<T, ArchiveError> {
    if result.is_err() && output.exists() {
        if let Err(e) = fs::remove_file(output) {
            tracing::warn!(output = %output.display(), error = %e, "could not remove partial output");
        }
    }
    result
}
