//! Wheel output: a zip with a generated `RECORD`.

use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use distpack_schema::WheelName;
use sha2::{Digest, Sha256};

use super::{
    ArchiveError, ArchivePath, ArchiveWriter, FileSource, Member, MemberTree, ZipArchiveWriter,
};

/// Writes a Python wheel: a zip whose `RECORD` lists every file with its
/// SHA-256 digest and size.
///
/// The archive base is the wheel's `datadir` (the package name), not the
/// filename stem, so members are added as `<package>/...` or under
/// [`metadir`](Self::metadir).
#[derive(Debug)]
pub struct WheelWriter<W: Write + Seek = BufWriter<File>> {
    name: WheelName,
    zip: ZipArchiveWriter<W>,
    records: Vec<String>,
}

impl WheelWriter<BufWriter<File>> {
    /// Create the wheel at `path`, parsing its tags from the filename.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Name`] if the filename is not
    /// `{package}-{version}-{python}-{abi}-{platform}.whl`, or an I/O error
    /// if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let name = WheelName::from_path(path)?;
        let file = File::create(path)?;
        Self::new(name, BufWriter::new(file))
    }
}

impl<W: Write + Seek> WheelWriter<W> {
    /// Wrap an arbitrary seekable writer.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidPath`] if the package name cannot be
    /// used as a directory name.
    pub fn new(name: WheelName, writer: W) -> Result<Self, ArchiveError> {
        let base = ArchivePath::new(name.datadir())?;
        Ok(Self {
            name,
            zip: ZipArchiveWriter::new(base, writer),
            records: Vec::new(),
        })
    }

    /// Pin the timestamp used for directories and in-memory files.
    #[must_use]
    pub fn with_mtime(mut self, secs: u64) -> Self {
        self.zip = self.zip.with_mtime(secs);
        self
    }

    /// Parsed filename fields.
    pub fn name(&self) -> &WheelName {
        &self.name
    }

    /// `{python}-{abi}-{platform}`.
    pub fn tag(&self) -> String {
        self.name.tag()
    }

    /// Directory holding the package payload.
    pub fn datadir(&self) -> &ArchivePath {
        self.zip.base()
    }

    /// `{package}-{version}.dist-info`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidPath`] if the name cannot be used as a
    /// directory name.
    pub fn metadir(&self) -> Result<ArchivePath, ArchiveError> {
        ArchivePath::new(self.name.metadir())
    }

    /// Append `RECORD`, then write the zip.
    ///
    /// # Errors
    ///
    /// Returns an error if any member cannot be read or the zip cannot be
    /// written.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        let record_path = self.metadir()?.join("RECORD")?;
        self.records.push(format!("{record_path},,"));
        self.records.sort();
        let mut data = self.records.join("\n");
        data.push('\n');
        self.zip
            .add(Member::file(record_path, FileSource::bytes(data)))?;
        tracing::debug!(wheel = %self.name, files = self.records.len(), "wrote RECORD");
        self.zip.finish()
    }
}

impl<W: Write + Seek> ArchiveWriter for WheelWriter<W> {
    fn base(&self) -> &ArchivePath {
        self.zip.base()
    }

    fn tree(&self) -> &MemberTree {
        self.zip.tree()
    }

    fn add(&mut self, member: Member) -> Result<(), ArchiveError> {
        let record = match &member {
            Member::File(file) => Some(record_line(&file.path, &file.source)?),
            _ => None,
        };
        self.zip.add(member)?;
        self.records.extend(record);
        Ok(())
    }

    fn finish_boxed(self: Box<Self>) -> Result<(), ArchiveError> {
        (*self).finish().map(|_| ())
    }
}

/// `path,sha256=<urlsafe-b64 digest without padding>,<size>`
fn record_line(path: &ArchivePath, source: &FileSource) -> Result<String, ArchiveError> {
    let mut hasher = Sha256::new();
    let mut reader = source
        .open()
        .map_err(|e| ArchiveError::member_io(path, e))?;
    let len = io::copy(&mut reader, &mut hasher).map_err(|e| ArchiveError::member_io(path, e))?;
    let digest = URL_SAFE_NO_PAD.encode(hasher.finalize());
    Ok(format!("{path},sha256={digest},{len}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use zip::ZipArchive;

    fn wheel() -> WheelWriter<Cursor<Vec<u8>>> {
        let name = WheelName::parse("openslide_bin-4.0.0.6-py3-none-manylinux_2_28_x86_64.whl")
            .unwrap();
        WheelWriter::new(name, Cursor::new(Vec::new()))
            .unwrap()
            .with_mtime(1_700_000_000)
    }

    #[test]
    fn names_from_filename() {
        let w = wheel();
        assert_eq!(w.tag(), "py3-none-manylinux_2_28_x86_64");
        assert_eq!(w.datadir().as_str(), "openslide_bin");
        assert_eq!(
            w.metadir().unwrap().as_str(),
            "openslide_bin-4.0.0.6.dist-info"
        );
    }

    #[test]
    fn record_lists_hashes_sorted() {
        let mut w = wheel();
        let data = w.datadir().join("libopenslide.so.1").unwrap();
        let meta = w.metadir().unwrap().join("WHEEL").unwrap();
        w.add(Member::file(data, FileSource::bytes(b"hello".to_vec())))
            .unwrap();
        w.add(Member::file(meta, FileSource::bytes(Vec::new())))
            .unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut record = String::new();
        zip.by_name("openslide_bin-4.0.0.6.dist-info/RECORD")
            .unwrap()
            .read_to_string(&mut record)
            .unwrap();
        assert_eq!(
            record,
            "openslide_bin-4.0.0.6.dist-info/RECORD,,\n\
             openslide_bin-4.0.0.6.dist-info/WHEEL,sha256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU,0\n\
             openslide_bin/libopenslide.so.1,sha256=LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ,5\n"
        );
    }

    #[test]
    fn directories_are_not_recorded() {
        let mut w = wheel();
        let dir = w.datadir().join("sub").unwrap();
        w.add(Member::dir(dir)).unwrap();
        let bytes = w.finish().unwrap().into_inner();
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut record = String::new();
        zip.by_name("openslide_bin-4.0.0.6.dist-info/RECORD")
            .unwrap()
            .read_to_string(&mut record)
            .unwrap();
        assert_eq!(record, "openslide_bin-4.0.0.6.dist-info/RECORD,,\n");
    }
}
