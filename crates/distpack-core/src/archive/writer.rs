//! The writer interface shared by tar, zip and wheel output.

use std::path::Path;

use distpack_schema::ArchiveFormat;

use super::{
    ArchiveError, ArchivePath, FileSource, Member, MemberTree, TarArchiveWriter, WheelWriter,
    ZipArchiveWriter, detect_format,
};

/// An archive being assembled.
///
/// Members are only buffered by [`add`](Self::add); nothing is written to
/// the container until [`finish_boxed`](Self::finish_boxed) (or the
/// concrete writer's `finish`) runs, at which point members are emitted in
/// sorted path order.
pub trait ArchiveWriter {
    /// Top-level directory every member lives under.
    fn base(&self) -> &ArchivePath;

    /// Members added so far, including synthesized directories.
    fn tree(&self) -> &MemberTree;

    /// Add a member, synthesizing missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::DuplicateMember`] if the path is already
    /// taken, or a format-specific error if the container cannot hold the
    /// member.
    fn add(&mut self, member: Member) -> Result<(), ArchiveError>;

    /// Serialize every member and finalize the container.
    ///
    /// # Errors
    ///
    /// Returns an error if a member cannot be read or the container cannot
    /// be written.
    fn finish_boxed(self: Box<Self>) -> Result<(), ArchiveError>;

    /// Recursively add every non-directory entry under `dir` as a file.
    ///
    /// The directory's own name is kept: adding `/tmp/foo.dSYM` at
    /// `base/lib` yields `base/lib/foo.dSYM/...`. Entries are visited in
    /// file-name order. Symlinks to directories are skipped. Traversal
    /// errors are returned, never skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Walk`] if `dir` cannot be traversed, or any
    /// error from [`add`](Self::add).
    fn add_tree(&mut self, arcdir: &ArchivePath, dir: &Path) -> Result<(), ArchiveError> {
        let root = dir.parent().unwrap_or_else(|| Path::new(""));
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            // Symlinks to directories are not followed, and are not files.
            if entry.file_type().is_dir() || entry.path().is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| ArchiveError::InvalidPath(entry.path().display().to_string()))?;
            let rel = rel
                .to_str()
                .ok_or_else(|| ArchiveError::InvalidPath(rel.display().to_string()))?
                .replace(std::path::MAIN_SEPARATOR, "/");
            let path = arcdir.join(&rel)?;
            self.add(Member::file(path, FileSource::Path(entry.into_path())))?;
        }
        Ok(())
    }
}

/// Create a writer for `path`, choosing the container from its extension.
///
/// # Errors
///
/// Returns an error if the extension is unknown, the output cannot be
/// created, or (for wheels) the filename is not a valid wheel name.
pub fn open_writer(path: &Path) -> Result<Box<dyn ArchiveWriter>, ArchiveError> {
    Ok(match detect_format(path)? {
        ArchiveFormat::TarXz => Box::new(TarArchiveWriter::create(path)?),
        ArchiveFormat::Zip => Box::new(ZipArchiveWriter::create(path)?),
        ArchiveFormat::Wheel => Box::new(WheelWriter::create(path)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemberKind;

    #[cfg(unix)]
    #[test]
    fn add_tree_skips_directory_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("licenses");
        std::fs::create_dir_all(tree.join("x")).unwrap();
        std::fs::write(tree.join("x/COPYING"), b"gpl").unwrap();
        std::os::unix::fs::symlink("x", tree.join("alias")).unwrap();

        let out = tmp.path().join("pkg-linux-x.tar.xz");
        let mut writer = TarArchiveWriter::create(&out).unwrap();
        let base = writer.base().clone();
        writer.add_tree(&base, &tree).unwrap();

        let files: Vec<&str> = writer
            .tree()
            .iter()
            .filter(|m| m.kind() == MemberKind::File)
            .map(|m| m.path().as_str())
            .collect();
        assert_eq!(files, ["pkg-linux-x/licenses/x/COPYING"]);
        writer.finish().unwrap();
    }

    #[test]
    fn add_tree_keeps_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        let dsym = tmp.path().join("libx.dylib.dSYM");
        std::fs::create_dir_all(dsym.join("Contents/Resources/DWARF")).unwrap();
        std::fs::write(dsym.join("Contents/Info.plist"), b"plist").unwrap();
        std::fs::write(dsym.join("Contents/Resources/DWARF/libx.dylib"), b"dwarf").unwrap();

        let out = tmp.path().join("pkg-macos-x.tar.xz");
        let mut writer = TarArchiveWriter::create(&out).unwrap();
        let lib = writer.base().join("lib").unwrap();
        writer.add_tree(&lib, &dsym).unwrap();

        let files: Vec<&str> = writer
            .tree()
            .iter()
            .filter(|m| m.kind() == MemberKind::File)
            .map(|m| m.path().as_str())
            .collect();
        assert_eq!(
            files,
            [
                "pkg-macos-x/lib/libx.dylib.dSYM/Contents/Info.plist",
                "pkg-macos-x/lib/libx.dylib.dSYM/Contents/Resources/DWARF/libx.dylib",
            ]
        );
        writer.finish().unwrap();
    }

    #[test]
    fn add_tree_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = TarArchiveWriter::create(&tmp.path().join("a.tar.xz")).unwrap();
        let base = writer.base().clone();
        let err = writer
            .add_tree(&base, &tmp.path().join("does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Walk(_)));
    }

    #[test]
    fn open_writer_rejects_unknown_extension() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_writer(&tmp.path().join("x.tar.gz")),
            Err(ArchiveError::UnsupportedFormat(_))
        ));
    }
}
