//! Format-independent archive members.
//!
//! A [`Member`] is one entry of an archive: a regular file, a directory or
//! a symbolic link. Writers accumulate members and serialize them; readers
//! produce them; the universal merge compares them across archives.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ArchiveError;

/// Slash-separated relative path of a member inside an archive.
///
/// The first segment is the archive's top-level base directory. Paths are
/// normalized on construction: no leading `/`, no trailing `/`, no empty,
/// `.` or `..` segments.
///
/// Ordering compares segment by segment, so a directory sorts before all
/// of its descendants and its descendants are contiguous. Plain string
/// ordering does not have that property: `lib-x` would land between `lib`
/// and `lib/a` because `-` sorts below `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchivePath(String);

impl ArchivePath {
    /// Validate and normalize a path.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidPath`] for empty or absolute paths and
    /// paths containing empty, `.` or `..` segments.
    pub fn new(path: impl AsRef<str>) -> Result<Self, ArchiveError> {
        let raw = path.as_ref();
        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() || trimmed.starts_with('/') {
            return Err(ArchiveError::InvalidPath(raw.to_string()));
        }
        if trimmed
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(ArchiveError::InvalidPath(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments.
    pub fn segments(&self) -> std::str::Split<'_, char> {
        self.0.split('/')
    }

    /// First segment: the archive base directory.
    pub fn base(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(base, _)| base)
    }

    /// Path with the base directory stripped. Empty for the base itself.
    pub fn relpath(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, rel)| rel)
    }

    /// Last segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }

    /// Parent directory, or `None` for a single-segment path.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// Append a relative path. An empty `rel` returns a copy of `self`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidPath`] if the joined path is not valid.
    pub fn join(&self, rel: &str) -> Result<Self, ArchiveError> {
        if rel.is_empty() {
            return Ok(self.clone());
        }
        Self::new(format!("{}/{rel}", self.0))
    }

    /// Same relative path under a different base.
    pub fn rebase(&self, base: &Self) -> Self {
        match self.relpath() {
            "" => base.clone(),
            rel => Self(format!("{}/{rel}", base.0)),
        }
    }
}

impl Ord for ArchivePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl PartialOrd for ArchivePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ArchivePath {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ArchivePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where a file member's bytes come from.
///
/// Every read opens a fresh handle, so content can be read any number of
/// times and in any order relative to other members. Handles are closed as
/// soon as the returned reader is dropped.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on disk. Its mode and mtime are carried into archives.
    Path(PathBuf),
    /// In-memory content (generated metadata, test fixtures).
    Bytes(Arc<[u8]>),
}

impl FileSource {
    /// In-memory source from anything byte-like.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Arc::from(data.into()))
    }

    /// Open a reader positioned at the start of the content.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be opened.
    pub fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        match self {
            Self::Path(path) => Ok(Box::new(File::open(path)?)),
            Self::Bytes(data) => Ok(Box::new(Cursor::new(&data[..]))),
        }
    }

    /// Read the whole content.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be read.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        match self {
            Self::Path(path) => fs::read(path),
            Self::Bytes(data) => Ok(data.to_vec()),
        }
    }

    /// Read at most `n` leading bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be read.
    pub fn head(&self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n);
        self.open()?.take(n as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Content length in bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file's metadata is unavailable.
    pub fn len(&self) -> io::Result<u64> {
        match self {
            Self::Path(path) => Ok(fs::metadata(path)?.len()),
            Self::Bytes(data) => Ok(data.len() as u64),
        }
    }

    /// Permission bits of the backing file (`None` for in-memory sources
    /// and on non-Unix hosts).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file's metadata is unavailable.
    pub fn mode(&self) -> io::Result<Option<u32>> {
        match self {
            #[cfg(unix)]
            Self::Path(path) => {
                use std::os::unix::fs::PermissionsExt;
                Ok(Some(fs::metadata(path)?.permissions().mode() & 0o7777))
            }
            #[cfg(not(unix))]
            Self::Path(_) => Ok(None),
            Self::Bytes(_) => Ok(None),
        }
    }

    /// Modification time of the backing file in seconds since the epoch
    /// (`None` for in-memory sources).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file's metadata is unavailable.
    pub fn mtime(&self) -> io::Result<Option<u64>> {
        match self {
            Self::Path(path) => {
                let modified = fs::metadata(path)?.modified()?;
                Ok(modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_secs()))
            }
            Self::Bytes(_) => Ok(None),
        }
    }

    /// Ensure the content exists as a file on disk, for external tools.
    ///
    /// Path sources are returned as-is; in-memory sources are written to
    /// `dir/name`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn materialize(&self, dir: &Path, name: &str) -> io::Result<PathBuf> {
        match self {
            Self::Path(path) => Ok(path.clone()),
            Self::Bytes(data) => {
                fs::create_dir_all(dir)?;
                let dest = dir.join(name);
                fs::write(&dest, data)?;
                Ok(dest)
            }
        }
    }
}

/// A regular file.
#[derive(Debug, Clone)]
pub struct FileMember {
    /// Location inside the archive.
    pub path: ArchivePath,
    /// Content.
    pub source: FileSource,
}

/// A directory. Carries no content.
#[derive(Debug, Clone)]
pub struct DirMember {
    /// Location inside the archive.
    pub path: ArchivePath,
}

/// A symbolic link with a relative target. The target is not checked for
/// existence.
#[derive(Debug, Clone)]
pub struct SymlinkMember {
    /// Location inside the archive.
    pub path: ArchivePath,
    /// Link target, relative to the link's directory.
    pub target: String,
}

/// One archive entry.
#[derive(Debug, Clone)]
pub enum Member {
    /// Regular file
    File(FileMember),
    /// Directory
    Dir(DirMember),
    /// Symbolic link
    Symlink(SymlinkMember),
}

/// Variant of a [`Member`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Symbolic link
    Symlink,
}

impl std::fmt::Display for MemberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Dir => "directory",
            Self::Symlink => "symlink",
        })
    }
}

impl Member {
    /// File member.
    pub fn file(path: ArchivePath, source: FileSource) -> Self {
        Self::File(FileMember { path, source })
    }

    /// Directory member.
    pub fn dir(path: ArchivePath) -> Self {
        Self::Dir(DirMember { path })
    }

    /// Symlink member.
    pub fn symlink(path: ArchivePath, target: impl Into<String>) -> Self {
        Self::Symlink(SymlinkMember {
            path,
            target: target.into(),
        })
    }

    /// Location inside the archive.
    pub fn path(&self) -> &ArchivePath {
        match self {
            Self::File(m) => &m.path,
            Self::Dir(m) => &m.path,
            Self::Symlink(m) => &m.path,
        }
    }

    /// Path with the archive base stripped.
    pub fn relpath(&self) -> &str {
        self.path().relpath()
    }

    /// Which variant this is.
    pub fn kind(&self) -> MemberKind {
        match self {
            Self::File(_) => MemberKind::File,
            Self::Dir(_) => MemberKind::Dir,
            Self::Symlink(_) => MemberKind::Symlink,
        }
    }

    /// Copy of this member under a different base directory, keeping its
    /// relative path and payload.
    pub fn rebase(&self, base: &ArchivePath) -> Self {
        let mut member = self.clone();
        let path = match &mut member {
            Self::File(m) => &mut m.path,
            Self::Dir(m) => &mut m.path,
            Self::Symlink(m) => &mut m.path,
        };
        *path = path.rebase(base);
        member
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    #[test]
    fn path_normalization() {
        assert_eq!(p("base/lib/").as_str(), "base/lib");
        assert!(ArchivePath::new("").is_err());
        assert!(ArchivePath::new("/abs").is_err());
        assert!(ArchivePath::new("a//b").is_err());
        assert!(ArchivePath::new("a/../b").is_err());
        assert!(ArchivePath::new("./a").is_err());
    }

    #[test]
    fn relpath_and_base() {
        let path = p("base/lib/libx.so");
        assert_eq!(path.base(), "base");
        assert_eq!(path.relpath(), "lib/libx.so");
        assert_eq!(path.file_name(), "libx.so");
        assert_eq!(path.parent(), Some(p("base/lib")));
        assert_eq!(p("base").relpath(), "");
        assert_eq!(p("base").parent(), None);
    }

    #[test]
    fn component_ordering_keeps_subtrees_contiguous() {
        let mut paths = vec![p("b/lib/a"), p("b/lib-x"), p("b/lib"), p("b")];
        paths.sort();
        let sorted: Vec<&str> = paths.iter().map(ArchivePath::as_str).collect();
        assert_eq!(sorted, ["b", "b/lib", "b/lib/a", "b/lib-x"]);
    }

    #[test]
    fn rebase_keeps_relpath_and_payload() {
        let member = Member::symlink(p("old/lib/libx.so"), "libx.so.1");
        let rebased = member.rebase(&p("new"));
        assert_eq!(rebased.path().as_str(), "new/lib/libx.so");
        match rebased {
            Member::Symlink(link) => assert_eq!(link.target, "libx.so.1"),
            other => panic!("unexpected {:?}", other.kind()),
        }
        assert_eq!(Member::dir(p("old")).rebase(&p("new")).path().as_str(), "new");
    }

    #[test]
    fn bytes_source_is_rereadable() {
        let source = FileSource::bytes(b"hello world".to_vec());
        assert_eq!(source.read_all().unwrap(), b"hello world");
        assert_eq!(source.head(5).unwrap(), b"hello");
        assert_eq!(source.read_all().unwrap(), b"hello world");
        assert_eq!(source.len().unwrap(), 11);
        assert_eq!(source.mode().unwrap(), None);
    }

    #[test]
    fn path_source_materializes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x");
        std::fs::write(&file, b"abc").unwrap();
        let source = FileSource::Path(file.clone());
        assert_eq!(source.materialize(dir.path(), "ignored").unwrap(), file);

        let bytes = FileSource::bytes(b"def".to_vec());
        let written = bytes.materialize(&dir.path().join("sub"), "y").unwrap();
        assert_eq!(std::fs::read(written).unwrap(), b"def");
    }
}
