//! Archive abstraction: members, writers, readers and lockstep alignment.
//!
//! Writers accumulate [`Member`]s in a [`MemberTree`] and serialize them in
//! sorted order on `finish()`, so output depends only on the member set and
//! never on insertion order. Readers extract file contents into a private
//! temporary directory that lives exactly as long as the reader.

use std::io;
use std::path::Path;

use distpack_schema::{ArchiveFormat, NameError};
use thiserror::Error;

pub mod member;
pub mod reader;
pub mod tarball;
pub mod tree;
pub mod wheel;
pub mod writer;
pub mod zipball;

pub use member::{ArchivePath, DirMember, FileMember, FileSource, Member, MemberKind, SymlinkMember};
pub use reader::{AlignedMembers, ArchiveReader, MemberSet, Members, ReaderGroup, open_reader};
pub use tarball::{TarArchiveReader, TarArchiveWriter};
pub use tree::MemberTree;
pub use wheel::WheelWriter;
pub use writer::{ArchiveWriter, open_writer};
pub use zipball::{ZipArchiveReader, ZipArchiveWriter};

/// Errors produced while building or reading archives.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// I/O failure tied to a specific member.
    #[error("IO error on {path}: {source}")]
    MemberIo {
        /// Offending member.
        path: ArchivePath,
        /// Cause.
        source: io::Error,
    },

    /// Directory traversal failed while adding a tree.
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// Zip container error.
    #[error("Zip error: {0}")]
    Zip(#[from] ::zip::result::ZipError),

    /// Filename did not follow the expected convention.
    #[error(transparent)]
    Name(#[from] NameError),

    /// A path that cannot name an archive member.
    #[error("Invalid member path: {0}")]
    InvalidPath(String),

    /// A second member was added at an existing path.
    #[error("Duplicate member: {0}")]
    DuplicateMember(ArchivePath),

    /// An ancestor of a new member is already a file or symlink.
    #[error("Parent {parent} of {path} is a {kind}, not a directory")]
    ParentNotDirectory {
        /// Member being added.
        path: ArchivePath,
        /// Conflicting ancestor.
        parent: ArchivePath,
        /// Variant of the conflicting ancestor.
        kind: MemberKind,
    },

    /// Zip containers cannot hold symbolic links.
    #[error("Symlinks not supported in zip archives: {0}")]
    SymlinkUnsupported(ArchivePath),

    /// The input contains an entry type distpack refuses to extract.
    #[error("Unsupported member type {kind} for {path}")]
    UnsupportedEntry {
        /// Entry name as stored in the archive.
        path: String,
        /// Entry type.
        kind: String,
    },

    /// The input contains a path or link target that escapes the archive.
    #[error("Unsafe path in archive: {0}")]
    UnsafePath(String),

    /// One or more archives ran out of members before the others.
    #[error("Missing member at position {position} in: {}", .archives.join(", "))]
    MissingMember {
        /// Zero-based position in the lockstep walk.
        position: usize,
        /// Archives that had no member at this position.
        archives: Vec<String>,
    },

    /// File contents were requested for a non-file member.
    #[error("Member is not a file: {0}")]
    NotAFile(ArchivePath),

    /// The filename does not map to a supported container.
    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),
}

impl ArchiveError {
    pub(crate) fn member_io(path: &ArchivePath, source: io::Error) -> Self {
        Self::MemberIo {
            path: path.clone(),
            source,
        }
    }
}

/// Detect the container format of `path` from its name.
///
/// # Errors
///
/// Returns [`ArchiveError::UnsupportedFormat`] for unknown extensions.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, ArchiveError> {
    ArchiveFormat::from_path(path)
        .ok_or_else(|| ArchiveError::UnsupportedFormat(path.display().to_string()))
}

/// Base directory for an archive named `path`.
pub(crate) fn base_for(path: &Path) -> Result<ArchivePath, ArchiveError> {
    ArchivePath::new(distpack_schema::archive_base(path)?)
}
