//! Deflate-compressed zip archives (Windows binary distributions and the
//! container for wheels).

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use chrono::{Datelike, Timelike};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::tarball::{TEMP_PREFIX, now_secs};
use super::{
    ArchiveError, ArchivePath, ArchiveReader, ArchiveWriter, FileSource, Member, MemberTree,
    Members, base_for,
};

const DEFLATE_LEVEL: i64 = 9;

/// Writes a zip archive. Symbolic links are not supported.
pub struct ZipArchiveWriter<W: Write + Seek> {
    base: ArchivePath,
    tree: MemberTree,
    zip: Option<ZipWriter<W>>,
    now: u64,
}

impl<W: Write + Seek> std::fmt::Debug for ZipArchiveWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchiveWriter")
            .field("base", &self.base)
            .field("members", &self.tree.len())
            .field("finished", &self.zip.is_none())
            .finish()
    }
}

impl ZipArchiveWriter<BufWriter<File>> {
    /// Create `path`; the base directory is the filename minus `.zip`.
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

impl<W: Write + Seek> ZipArchiveWriter<W> {
    /// Wrap an arbitrary seekable writer.
    pub fn new(base: ArchivePath, writer: W) -> Self {
        Self {
            base,
            tree: MemberTree::new(),
            zip: Some(ZipWriter::new(writer)),
            now: now_secs(),
        }
    }

    /// Pin the timestamp used for directories and in-memory files.
    #[must_use]
    pub fn with_mtime(mut self, secs: u64) -> Self {
        self.now = secs;
        self
    }

    /// Write all members in sorted order and write the central directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a member cannot be read or the output cannot be
    /// written.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        let mut zip = self
            .zip
            .take()
            .ok_or_else(|| io::Error::other("zip writer already finished"))?;
        for member in self.tree.iter() {
            match member {
                Member::File(file) => {
                    let io_err = |e| ArchiveError::member_io(&file.path, e);
                    let mode = file.source.mode().map_err(io_err)?.unwrap_or(0o644);
                    let mtime = file.source.mtime().map_err(io_err)?.unwrap_or(self.now);
                    zip.start_file(file.path.as_str(), entry_options(mode, mtime))?;
                    let mut reader = file.source.open().map_err(io_err)?;
                    io::copy(&mut reader, &mut zip).map_err(io_err)?;
                }
                Member::Dir(dir) => {
                    zip.add_directory(dir.path.as_str(), entry_options(0o755, self.now))?;
                }
                // Rejected by add().
                Member::Symlink(link) => {
                    return Err(ArchiveError::SymlinkUnsupported(link.path.clone()));
                }
            }
        }

        let mut inner = zip.finish()?;
        inner.flush()?;
        tracing::info!(base = %self.base, members = self.tree.len(), "wrote zip");
        Ok(inner)
    }
}

impl<W: Write + Seek> ArchiveWriter for ZipArchiveWriter<W> {
    fn base(&self) -> &ArchivePath {
        &self.base
    }

    fn tree(&self) -> &MemberTree {
        &self.tree
    }

    fn add(&mut self, member: Member) -> Result<(), ArchiveError> {
        if let Member::Symlink(link) = member {
            return Err(ArchiveError::SymlinkUnsupported(link.path));
        }
        self.tree.insert(member)
    }

    fn finish_boxed(self: Box<Self>) -> Result<(), ArchiveError> {
        (*self).finish().map(|_| ())
    }
}

impl<W: Write + Seek> Drop for ZipArchiveWriter<W> {
    fn drop(&mut self) {
        if self.zip.is_some() && !self.tree.is_empty() {
            tracing::warn!(base = %self.base, "zip writer dropped before finish; output is incomplete");
        }
    }
}

fn entry_options(mode: u32, mtime: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(DEFLATE_LEVEL))
        .unix_permissions(mode)
        .last_modified_time(zip_time(mtime))
}

/// Zip timestamp for `secs` since the epoch (UTC). Times outside the DOS
/// range fall back to 1980-01-01.
fn zip_time(secs: u64) -> zip::DateTime {
    let Some(dt) = i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
    else {
        return zip::DateTime::default();
    };
    let (Ok(year), Ok(month), Ok(day)) = (
        u16::try_from(dt.year()),
        u8::try_from(dt.month()),
        u8::try_from(dt.day()),
    ) else {
        return zip::DateTime::default();
    };
    zip::DateTime::from_date_and_time(
        year,
        month,
        day,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .unwrap_or_default()
}

/// Reads a zip archive, extracting files into a private temporary
/// directory removed when the reader is dropped.
#[derive(Debug)]
pub struct ZipArchiveReader<R: Read + Seek> {
    name: String,
    base: ArchivePath,
    archive: ZipArchive<R>,
    tempdir: TempDir,
}

impl ZipArchiveReader<BufReader<File>> {
    /// Open the zip at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is not a readable zip or its name has no
    /// usable base.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let base = base_for(path)?;
        let file = File::open(path)?;
        Self::new(path.display().to_string(), base, BufReader::new(file))
    }
}

impl<R: Read + Seek> ZipArchiveReader<R> {
    /// Read a zip from an arbitrary seekable reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the central directory cannot be read or the
    /// temporary directory cannot be created.
    pub fn new(name: String, base: ArchivePath, reader: R) -> Result<Self, ArchiveError> {
        let archive = ZipArchive::new(reader)?;
        let tempdir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        Ok(Self {
            name,
            base,
            archive,
            tempdir,
        })
    }

    /// Directory file contents are extracted into.
    pub fn extract_dir(&self) -> &Path {
        self.tempdir.path()
    }
}

impl<R: Read + Seek> ArchiveReader for ZipArchiveReader<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> &ArchivePath {
        &self.base
    }

    fn members(&mut self) -> Result<Members<'_>, ArchiveError> {
        let dir = self.tempdir.path();
        let archive = &mut self.archive;
        Ok(Box::new(
            (0..archive.len()).map(move |index| read_entry(archive, index, dir)),
        ))
    }
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
    dir: &Path,
) -> Result<Member, ArchiveError> {
    let mut entry = archive.by_index(index)?;
    let name = entry.name().to_string();
    if entry.enclosed_name().is_none() {
        return Err(ArchiveError::UnsafePath(name));
    }
    let path = ArchivePath::new(&name).map_err(|_| ArchiveError::UnsafePath(name.clone()))?;

    if entry.is_dir() {
        return Ok(Member::dir(path));
    }

    let dest = dir.join(path.as_str());
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(&dest).map_err(|e| ArchiveError::member_io(&path, e))?;
    io::copy(&mut entry, &mut out).map_err(|e| ArchiveError::member_io(&path, e))?;
    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(Member::file(path, FileSource::Path(dest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemberKind;
    use std::io::Cursor;

    fn p(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    fn build() -> Vec<u8> {
        let mut writer = ZipArchiveWriter::new(p("pkg-windows-x64"), Cursor::new(Vec::new()))
            .with_mtime(1_700_000_000);
        writer
            .add(Member::file(
                p("pkg-windows-x64/bin/libx-1.dll"),
                FileSource::bytes(b"MZ".to_vec()),
            ))
            .unwrap();
        writer
            .add(Member::file(
                p("pkg-windows-x64/README.md"),
                FileSource::bytes(b"hi".to_vec()),
            ))
            .unwrap();
        writer
            .add(Member::dir(p("pkg-windows-x64/include")))
            .unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn round_trip() {
        let mut reader =
            ZipArchiveReader::new("t".into(), p("pkg-windows-x64"), Cursor::new(build())).unwrap();
        let members: Vec<Member> = reader.members().unwrap().map(Result::unwrap).collect();
        let listed: Vec<(&str, MemberKind)> = members
            .iter()
            .map(|m| (m.path().as_str(), m.kind()))
            .collect();
        assert_eq!(
            listed,
            [
                ("pkg-windows-x64", MemberKind::Dir),
                ("pkg-windows-x64/README.md", MemberKind::File),
                ("pkg-windows-x64/bin", MemberKind::Dir),
                ("pkg-windows-x64/bin/libx-1.dll", MemberKind::File),
                ("pkg-windows-x64/include", MemberKind::Dir),
            ]
        );
        let Member::File(dll) = &members[3] else {
            panic!("expected file");
        };
        assert_eq!(dll.source.read_all().unwrap(), b"MZ");
    }

    #[test]
    fn directory_entries_end_with_slash() {
        let mut archive = ZipArchive::new(Cursor::new(build())).unwrap();
        let entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "pkg-windows-x64/");
        assert!(entry.is_dir());
        drop(entry);
        let file = archive.by_name("pkg-windows-x64/README.md").unwrap();
        assert_eq!(file.compression(), CompressionMethod::Deflated);
        assert_eq!(file.unix_mode().map(|m| m & 0o777), Some(0o644));
    }

    #[test]
    fn symlinks_rejected() {
        let mut writer = ZipArchiveWriter::new(p("b"), Cursor::new(Vec::new()));
        let err = writer
            .add(Member::symlink(p("b/lib/libx.dll"), "libx-1.dll"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SymlinkUnsupported(_)));
        assert!(writer.tree().is_empty());
    }

    #[test]
    fn unsafe_names_rejected() {
        let mut raw = ZipWriter::new(Cursor::new(Vec::new()));
        raw.start_file("../escape.txt", SimpleFileOptions::default())
            .unwrap();
        raw.write_all(b"x").unwrap();
        let bytes = raw.finish().unwrap().into_inner();

        let mut reader = ZipArchiveReader::new("t".into(), p("b"), Cursor::new(bytes)).unwrap();
        let err = reader.members().unwrap().next().unwrap().unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
    }

    #[test]
    fn zip_time_converts_utc() {
        let t = zip_time(1_700_000_000);
        assert_eq!(
            (t.year(), t.month(), t.day(), t.hour(), t.minute()),
            (2023, 11, 14, 22, 13)
        );
        assert_eq!(zip_time(0), zip::DateTime::default());
    }
}
