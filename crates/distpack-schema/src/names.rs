//! Filename conventions for the archives distpack reads and writes.
//!
//! Archive filenames carry metadata: the top-level directory of a bdist is
//! its filename without extension, and a wheel's filename encodes the
//! package identity and platform tag.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::System;

static BDIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((.+)-(linux|macos|windows)-(.+))\.(tar\.xz|zip)$").expect("valid bdist pattern")
});

/// Errors from parsing archive filenames.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    /// The name does not follow `<name>-<system>-<qualifier>.<format>`.
    #[error("Not a bdist archive: {0}")]
    NotBDist(String),

    /// The name is not `{package}-{version}-{python}-{abi}-{platform}.whl`.
    #[error("Not a wheel filename: {0}")]
    NotWheel(String),

    /// The path has no final component or it is not UTF-8.
    #[error("Invalid archive filename: {0}")]
    InvalidFilename(String),
}

/// Container format of an archive, detected from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// xz-compressed PAX tarball (`.tar.xz`)
    TarXz,
    /// Zip archive (`.zip`)
    Zip,
    /// Python wheel (`.whl`), a zip with a `RECORD` manifest
    Wheel,
}

impl ArchiveFormat {
    /// Detect the format from a filename's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.xz") {
            Some(Self::TarXz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".whl") {
            Some(Self::Wheel)
        } else {
            None
        }
    }

    /// Filename extension including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::TarXz => ".tar.xz",
            Self::Zip => ".zip",
            Self::Wheel => ".whl",
        }
    }
}

/// Top-level directory name for an archive: its filename minus the
/// archive extension.
///
/// # Errors
///
/// Returns [`NameError::InvalidFilename`] if the path has no UTF-8 file name.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use distpack_schema::archive_base;
///
/// assert_eq!(archive_base(Path::new("out/thing-linux-x86_64.tar.xz")).unwrap(), "thing-linux-x86_64");
/// ```
pub fn archive_base(path: &Path) -> Result<String, NameError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NameError::InvalidFilename(path.display().to_string()))?;
    let base = match ArchiveFormat::from_path(path) {
        Some(format) => &name[..name.len() - format.extension().len()],
        None => name,
    };
    if base.is_empty() {
        return Err(NameError::InvalidFilename(name.to_string()));
    }
    Ok(base.to_string())
}

/// A parsed binary distribution filename, e.g.
/// `openslide-bin-4.0.0.8-macos-arm64-x86_64.tar.xz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BDistName {
    /// Top-level directory inside the archive (filename minus extension).
    pub base: String,
    /// Everything before the system token (product and version).
    pub name: String,
    /// Target operating system.
    pub system: System,
    /// Everything after the system token (usually the architecture list).
    pub qualifier: String,
    /// Container format.
    pub format: ArchiveFormat,
}

impl BDistName {
    /// Parse a bdist filename (a bare name, not a path).
    ///
    /// # Errors
    ///
    /// Returns [`NameError::NotBDist`] if the name does not match the
    /// bdist naming convention.
    pub fn parse(filename: &str) -> Result<Self, NameError> {
        let caps = BDIST_RE
            .captures(filename)
            .ok_or_else(|| NameError::NotBDist(filename.to_string()))?;
        let system = caps[3]
            .parse()
            .map_err(|_| NameError::NotBDist(filename.to_string()))?;
        let format = if &caps[5] == "zip" {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarXz
        };
        Ok(Self {
            base: caps[1].to_string(),
            name: caps[2].to_string(),
            system,
            qualifier: caps[4].to_string(),
            format,
        })
    }

    /// Parse the file name component of a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no UTF-8 file name or the name is
    /// not a bdist name.
    pub fn from_path(path: &Path) -> Result<Self, NameError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NameError::InvalidFilename(path.display().to_string()))?;
        Self::parse(name)
    }
}

/// A parsed wheel filename:
/// `{package}-{version}-{python}-{abi}-{platform}.whl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelName {
    /// Distribution name (also the top-level package directory).
    pub package: String,
    /// Distribution version.
    pub version: String,
    /// Python tag, e.g. `py3`.
    pub python: String,
    /// ABI tag, e.g. `none`.
    pub abi: String,
    /// Platform tag, e.g. `macosx_11_0_universal2`.
    pub platform: String,
}

impl WheelName {
    /// Parse a wheel filename (with or without the `.whl` extension).
    ///
    /// # Errors
    ///
    /// Returns [`NameError::NotWheel`] unless the stem has exactly five
    /// non-empty dash-separated fields.
    pub fn parse(filename: &str) -> Result<Self, NameError> {
        let stem = filename.strip_suffix(".whl").unwrap_or(filename);
        let fields: Vec<&str> = stem.split('-').collect();
        let [package, version, python, abi, platform] = fields.as_slice() else {
            return Err(NameError::NotWheel(filename.to_string()));
        };
        if fields.iter().any(|f| f.is_empty()) {
            return Err(NameError::NotWheel(filename.to_string()));
        }
        Ok(Self {
            package: (*package).to_string(),
            version: (*version).to_string(),
            python: (*python).to_string(),
            abi: (*abi).to_string(),
            platform: (*platform).to_string(),
        })
    }

    /// Parse the filename component of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::InvalidFilename`] for non-UTF-8 names and
    /// [`NameError::NotWheel`] for names that are not wheel names.
    pub fn from_path(path: &Path) -> Result<Self, NameError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NameError::InvalidFilename(path.display().to_string()))?;
        Self::parse(name)
    }

    /// Compatibility tag: `{python}-{abi}-{platform}`.
    pub fn tag(&self) -> String {
        format!("{}-{}-{}", self.python, self.abi, self.platform)
    }

    /// Directory holding the package payload.
    pub fn datadir(&self) -> &str {
        &self.package
    }

    /// Directory holding wheel metadata.
    pub fn metadir(&self) -> String {
        format!("{}-{}.dist-info", self.package, self.version)
    }
}

impl std::fmt::Display for WheelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}.whl", self.package, self.version, self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdist_name_parses_fields() {
        let name = BDistName::parse("openslide-bin-4.0.0.8-macos-arm64-x86_64.tar.xz").unwrap();
        assert_eq!(name.base, "openslide-bin-4.0.0.8-macos-arm64-x86_64");
        assert_eq!(name.name, "openslide-bin-4.0.0.8");
        assert_eq!(name.system, System::MacOS);
        assert_eq!(name.qualifier, "arm64-x86_64");
        assert_eq!(name.format, ArchiveFormat::TarXz);
    }

    #[test]
    fn bdist_name_zip() {
        let name = BDistName::parse("thing-1.0-windows-x64.zip").unwrap();
        assert_eq!(name.system, System::Windows);
        assert_eq!(name.format, ArchiveFormat::Zip);
    }

    #[test]
    fn bdist_name_rejects_unknown_system() {
        assert!(matches!(
            BDistName::parse("thing-1.0-solaris-sparc.tar.xz"),
            Err(NameError::NotBDist(_))
        ));
        assert!(BDistName::parse("thing-1.0-linux-x86_64.tar.gz").is_err());
    }

    #[test]
    fn archive_base_strips_known_extensions() {
        assert_eq!(archive_base(Path::new("a/x-linux-y.tar.xz")).unwrap(), "x-linux-y");
        assert_eq!(archive_base(Path::new("x.zip")).unwrap(), "x");
        assert_eq!(archive_base(Path::new("p-1-py3-none-any.whl")).unwrap(), "p-1-py3-none-any");
        assert_eq!(archive_base(Path::new("plain")).unwrap(), "plain");
        assert!(archive_base(Path::new(".zip")).is_err());
    }

    #[test]
    fn wheel_name_fields() {
        let whl = WheelName::parse("openslide_bin-4.0.0.8-py3-none-manylinux_2_28_x86_64.whl").unwrap();
        assert_eq!(whl.package, "openslide_bin");
        assert_eq!(whl.tag(), "py3-none-manylinux_2_28_x86_64");
        assert_eq!(whl.datadir(), "openslide_bin");
        assert_eq!(whl.metadir(), "openslide_bin-4.0.0.8.dist-info");
    }

    #[test]
    fn wheel_name_requires_five_fields() {
        assert!(WheelName::parse("pkg-1.0-py3-none.whl").is_err());
        assert!(WheelName::parse("pkg-1.0-py3-none-any-extra.whl").is_err());
        assert!(WheelName::parse("pkg--py3-none-any.whl").is_err());
    }

    #[test]
    fn format_detection() {
        assert_eq!(ArchiveFormat::from_path(Path::new("a.TAR.XZ")), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::from_path(Path::new("a.tar.gz")), None);
    }
}
