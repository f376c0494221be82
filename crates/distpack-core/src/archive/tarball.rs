//! xz-compressed PAX tarballs.
//!
//! Output is normalized for reproducibility: every entry is owned by
//! `root:root` (uid/gid 0), permissions are forced to 0644/0755/0777 for
//! files/directories/symlinks, and synthesized entries share one mtime
//! recorded when the writer was opened.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tar::{EntryType, Header};
use tempfile::TempDir;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use super::{
    ArchiveError, ArchivePath, ArchiveReader, ArchiveWriter, FileSource, Member, MemberTree,
    Members, base_for,
};

/// xz preset used for all tarballs (maximum).
const XZ_PRESET: u32 = 9;

/// Longest name that fits the ustar `name` / `linkname` fields.
const USTAR_NAME_LEN: usize = 100;

/// Prefix for reader extraction directories.
pub(crate) const TEMP_PREFIX: &str = "distpack-";

/// Seconds since the epoch, or 0 if the clock is before it.
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Writes an xz-compressed PAX tarball.
pub struct TarArchiveWriter<W: Write> {
    base: ArchivePath,
    tree: MemberTree,
    builder: Option<tar::Builder<XzEncoder<W>>>,
    now: u64,
}

impl<W: Write> std::fmt::Debug for TarArchiveWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarArchiveWriter")
            .field("base", &self.base)
            .field("members", &self.tree.len())
            .field("finished", &self.builder.is_none())
            .finish()
    }
}

impl TarArchiveWriter<BufWriter<File>> {
    /// Create `path` and write a tarball whose base directory is the
    /// filename minus `.tar.xz`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filename has no usable base or the file
    /// cannot be created.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let base = base_for(path)?;
        let file = File::create(path)?;
        Ok(Self::new(base, BufWriter::new(file)))
    }
}

impl<W: Write> TarArchiveWriter<W> {
    /// Wrap an arbitrary writer. The open time is taken from the clock.
    pub fn new(base: ArchivePath, writer: W) -> Self {
        let mut builder = tar::Builder::new(XzEncoder::new(writer, XZ_PRESET));
        builder.mode(tar::HeaderMode::Complete);
        Self {
            base,
            tree: MemberTree::new(),
            builder: Some(builder),
            now: now_secs(),
        }
    }

    /// Pin the open time used for synthesized entries and in-memory files.
    #[must_use]
    pub fn with_mtime(mut self, secs: u64) -> Self {
        self.now = secs;
        self
    }

    /// Write all members in sorted order and finalize the xz stream.
    ///
    /// Returns the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an error if a member cannot be read or the output cannot be
    /// written.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        let mut builder = self
            .builder
            .take()
            .ok_or_else(|| io::Error::other("tar writer already finished"))?;
        for member in self.tree.iter() {
            append_member(&mut builder, member, self.now)?;
        }
        let mut inner = builder.into_inner()?.finish()?;
        inner.flush()?;
        tracing::info!(base = %self.base, members = self.tree.len(), "wrote tarball");
        Ok(inner)
    }
}

impl<W: Write> ArchiveWriter for TarArchiveWriter<W> {
    fn base(&self) -> &ArchivePath {
        &self.base
    }

    fn tree(&self) -> &MemberTree {
        &self.tree
    }

    fn add(&mut self, member: Member) -> Result<(), ArchiveError> {
        self.tree.insert(member)
    }

    fn finish_boxed(self: Box<Self>) -> Result<(), ArchiveError> {
        (*self).finish().map(|_| ())
    }
}

impl<W: Write> Drop for TarArchiveWriter<W> {
    fn drop(&mut self) {
        if self.builder.is_some() && !self.tree.is_empty() {
            tracing::warn!(base = %self.base, "tar writer dropped before finish; output is incomplete");
        }
    }
}

fn base_header(entry_type: EntryType, mode: u32, mtime: u64) -> Result<Header, ArchiveError> {
    let mut header = Header::new_ustar();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root")?;
    header.set_groupname("root")?;
    header.set_mtime(mtime);
    header.set_size(0);
    Ok(header)
}

fn append_member<W: Write>(
    builder: &mut tar::Builder<W>,
    member: &Member,
    now: u64,
) -> Result<(), ArchiveError> {
    match member {
        Member::File(file) => {
            let io_err = |e| ArchiveError::member_io(&file.path, e);
            let mode = file.source.mode().map_err(io_err)?.unwrap_or(0o644);
            let mtime = file.source.mtime().map_err(io_err)?.unwrap_or(now);
            let mut header = base_header(EntryType::Regular, mode & !0o022 | 0o644, mtime)?;
            header.set_size(file.source.len().map_err(io_err)?);
            set_names(builder, &mut header, file.path.as_str(), None)?;
            header.set_cksum();
            let reader = file.source.open().map_err(io_err)?;
            builder.append(&header, reader).map_err(io_err)?;
        }
        Member::Dir(dir) => {
            let mut header = base_header(EntryType::Directory, 0o755, now)?;
            set_names(builder, &mut header, &format!("{}/", dir.path), None)?;
            header.set_cksum();
            builder.append(&header, io::empty())?;
        }
        Member::Symlink(link) => {
            let mut header = base_header(EntryType::Symlink, 0o777, now)?;
            set_names(builder, &mut header, link.path.as_str(), Some(&link.target))?;
            header.set_cksum();
            builder.append(&header, io::empty())?;
        }
    }
    Ok(())
}

/// Store `path` (and `link`) in the header, emitting a PAX extended header
/// first for values the ustar fields cannot represent.
fn set_names<W: Write>(
    builder: &mut tar::Builder<W>,
    header: &mut Header,
    path: &str,
    link: Option<&str>,
) -> Result<(), ArchiveError> {
    let mut pax: Vec<(&str, &[u8])> = Vec::new();

    if fits_ustar(path) {
        header.set_path(path)?;
    } else {
        pax.push(("path", path.as_bytes()));
        write_truncated(&mut header.as_old_mut().name, path);
    }

    if let Some(target) = link {
        if fits_ustar(target) {
            header.set_link_name(target)?;
        } else {
            pax.push(("linkpath", target.as_bytes()));
            write_truncated(&mut header.as_old_mut().linkname, target);
        }
    }

    if !pax.is_empty() {
        builder.append_pax_extensions(pax)?;
    }
    Ok(())
}

fn fits_ustar(value: &str) -> bool {
    value.is_ascii() && value.len() <= USTAR_NAME_LEN
}

fn write_truncated(field: &mut [u8], value: &str) {
    field.fill(0);
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Reads an xz-compressed tarball, extracting files to a private temporary
/// directory removed when the reader is dropped.
pub struct TarArchiveReader<R: Read> {
    name: String,
    base: ArchivePath,
    archive: tar::Archive<XzDecoder<R>>,
    tempdir: TempDir,
}

impl<R: Read> std::fmt::Debug for TarArchiveReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarArchiveReader")
            .field("name", &self.name)
            .field("tempdir", &self.tempdir.path())
            .finish_non_exhaustive()
    }
}

impl TarArchiveReader<BufReader<File>> {
    /// Open the tarball at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, its name has no
    /// usable base, or the temporary directory cannot be created.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let base = base_for(path)?;
        let file = File::open(path)?;
        Self::new(path.display().to_string(), base, BufReader::new(file))
    }
}

impl<R: Read> TarArchiveReader<R> {
    /// Read a tarball from an arbitrary reader. `name` is used in error
    /// reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new(name: String, base: ArchivePath, reader: R) -> Result<Self, ArchiveError> {
        let tempdir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        Ok(Self {
            name,
            base,
            archive: tar::Archive::new(XzDecoder::new(reader)),
            tempdir,
        })
    }

    /// Directory file contents are extracted into.
    pub fn extract_dir(&self) -> &Path {
        self.tempdir.path()
    }
}

impl<R: Read> ArchiveReader for TarArchiveReader<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> &ArchivePath {
        &self.base
    }

    fn members(&mut self) -> Result<Members<'_>, ArchiveError> {
        let dir = self.tempdir.path();
        let entries = self.archive.entries()?;
        Ok(Box::new(
            entries
                .map(move |entry| read_entry(entry?, dir))
                .filter_map(Result::transpose),
        ))
    }
}

/// Convert one tar entry to a member, applying the data filter. Returns
/// `Ok(None)` for metadata-only entries.
fn read_entry<R: Read>(
    mut entry: tar::Entry<'_, R>,
    dir: &Path,
) -> Result<Option<Member>, ArchiveError> {
    let raw = entry.path()?;
    let name = raw
        .to_str()
        .ok_or_else(|| ArchiveError::UnsafePath(raw.display().to_string()))?
        .to_string();
    let entry_type = entry.header().entry_type();

    if matches!(entry_type, EntryType::XGlobalHeader | EntryType::XHeader) {
        return Ok(None);
    }

    let path = filter_path(&name)?;
    match entry_type {
        EntryType::Directory => Ok(Some(Member::dir(path))),
        EntryType::Regular | EntryType::Continuous => {
            let dest = dir.join(path.as_str());
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            entry
                .unpack(&dest)
                .map_err(|e| ArchiveError::member_io(&path, e))?;
            Ok(Some(Member::file(path, FileSource::Path(dest))))
        }
        EntryType::Symlink => {
            let target = entry
                .link_name()?
                .ok_or_else(|| ArchiveError::UnsafePath(name.clone()))?;
            let target = target
                .to_str()
                .ok_or_else(|| ArchiveError::UnsafePath(name.clone()))?
                .to_string();
            filter_link(&path, &target)?;
            Ok(Some(Member::symlink(path, target)))
        }
        other => Err(ArchiveError::UnsupportedEntry {
            path: name,
            kind: entry_type_name(other).to_string(),
        }),
    }
}

/// Reject absolute paths and parent-directory components.
fn filter_path(name: &str) -> Result<ArchivePath, ArchiveError> {
    if name.starts_with('/') || name.split('/').any(|seg| seg == "..") {
        return Err(ArchiveError::UnsafePath(name.to_string()));
    }
    ArchivePath::new(name).map_err(|_| ArchiveError::UnsafePath(name.to_string()))
}

/// Reject symlink targets that are absolute or resolve outside the archive.
fn filter_link(link: &ArchivePath, target: &str) -> Result<(), ArchiveError> {
    let unsafe_link = || ArchiveError::UnsafePath(format!("{link} -> {target}"));
    if target.starts_with('/') {
        return Err(unsafe_link());
    }
    let parent = link.parent();
    let mut resolved: Vec<&str> = parent.iter().flat_map(ArchivePath::segments).collect();
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                resolved.pop().ok_or_else(unsafe_link)?;
            }
            _ => resolved.push(seg),
        }
    }
    Ok(())
}

fn entry_type_name(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Link => "hard link",
        EntryType::Char => "character device",
        EntryType::Block => "block device",
        EntryType::Fifo => "fifo",
        EntryType::GNUSparse => "sparse file",
        EntryType::GNULongName | EntryType::GNULongLink => "GNU long name",
        _ => "unknown",
    }
}
