//! Archive readers and lockstep iteration over several archives.

use std::path::Path;

use distpack_schema::ArchiveFormat;

use super::{
    ArchiveError, ArchivePath, FileMember, Member, MemberKind, TarArchiveReader, ZipArchiveReader,
    detect_format,
};

/// Single-pass stream of members in container order.
pub type Members<'a> = Box<dyn Iterator<Item = Result<Member, ArchiveError>> + 'a>;

/// An archive opened for reading.
///
/// File members are backed by extracted copies in a temporary directory
/// owned by the reader, so they stay readable until the reader is dropped.
pub trait ArchiveReader {
    /// Name used in error reports (usually the input path).
    fn name(&self) -> &str;

    /// Base directory derived from the archive filename.
    fn base(&self) -> &ArchivePath;

    /// Start iterating. The stream cannot be restarted; reopen the archive
    /// to read it again.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be read.
    fn members(&mut self) -> Result<Members<'_>, ArchiveError>;
}

/// Open `path` for reading, choosing the container from its extension.
///
/// # Errors
///
/// Returns an error if the extension is unknown or the file cannot be
/// opened.
pub fn open_reader(path: &Path) -> Result<Box<dyn ArchiveReader>, ArchiveError> {
    Ok(match detect_format(path)? {
        ArchiveFormat::TarXz => Box::new(TarArchiveReader::open(path)?),
        ArchiveFormat::Zip | ArchiveFormat::Wheel => Box::new(ZipArchiveReader::open(path)?),
    })
}

/// N archives read in lockstep.
pub struct ReaderGroup {
    readers: Vec<Box<dyn ArchiveReader>>,
}

impl std::fmt::Debug for ReaderGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.readers.iter().map(|r| r.name()))
            .finish()
    }
}

impl ReaderGroup {
    /// Open every path. Readers opened before a failure are dropped (and
    /// their temporary directories removed) before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`open_reader`].
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ArchiveError> {
        let readers = paths
            .iter()
            .map(|p| open_reader(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(readers))
    }

    /// Group already-open readers.
    pub fn new(readers: Vec<Box<dyn ArchiveReader>>) -> Self {
        Self { readers }
    }

    /// Number of archives.
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Whether the group has no archives.
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Archive names, in input order.
    pub fn names(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.name().to_string()).collect()
    }

    /// Walk all archives in lockstep.
    ///
    /// # Errors
    ///
    /// Returns an error if any archive cannot be read.
    pub fn aligned(&mut self) -> Result<AlignedMembers<'_>, ArchiveError> {
        let names = self.names();
        let streams = self
            .readers
            .iter_mut()
            .map(|r| r.members())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AlignedMembers {
            names,
            streams,
            position: 0,
            done: false,
        })
    }
}

/// Iterator over [`MemberSet`]s: the k-th member of every archive, for each
/// k. Ends when every stream is exhausted; stops after the first error.
pub struct AlignedMembers<'a> {
    names: Vec<String>,
    streams: Vec<Members<'a>>,
    position: usize,
    done: bool,
}

impl std::fmt::Debug for AlignedMembers<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedMembers")
            .field("names", &self.names)
            .field("position", &self.position)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Iterator for AlignedMembers<'_> {
    type Item = Result<MemberSet, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut slots = Vec::with_capacity(self.streams.len());
        for stream in &mut self.streams {
            match stream.next() {
                Some(Ok(member)) => slots.push(Some(member)),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => slots.push(None),
            }
        }
        if slots.iter().all(Option::is_none) {
            self.done = true;
            return None;
        }

        let position = self.position;
        self.position += 1;
        let set = MemberSet::new(position, slots, &self.names);
        if set.is_err() {
            self.done = true;
        }
        Some(set)
    }
}

/// One member from each archive at the same stream position.
#[derive(Debug)]
pub struct MemberSet {
    position: usize,
    members: Vec<Member>,
    datas: Option<Vec<Vec<u8>>>,
}

impl MemberSet {
    /// Build a set from per-archive slots. `names[i]` names the archive
    /// behind `slots[i]`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::MissingMember`] listing every archive whose
    /// slot is empty.
    pub fn new(
        position: usize,
        slots: Vec<Option<Member>>,
        names: &[String],
    ) -> Result<Self, ArchiveError> {
        let missing: Vec<String> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| names.get(i).cloned().unwrap_or_else(|| format!("#{i}")))
            .collect();
        if !missing.is_empty() {
            return Err(ArchiveError::MissingMember {
                position,
                archives: missing,
            });
        }
        Ok(Self {
            position,
            members: slots.into_iter().flatten().collect(),
            datas: None,
        })
    }

    /// Zero-based stream position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Members in archive order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// First member.
    pub fn first(&self) -> Option<&Member> {
        self.members.first()
    }

    /// Relative paths in archive order.
    pub fn relpaths(&self) -> Vec<&str> {
        self.members.iter().map(Member::relpath).collect()
    }

    /// Whether every member has the same relative path.
    pub fn same_relpath(&self) -> bool {
        all_equal(self.members.iter().map(Member::relpath))
    }

    /// The variant shared by every member, if they agree.
    pub fn common_kind(&self) -> Option<MemberKind> {
        let first = self.members.first()?.kind();
        self.members
            .iter()
            .all(|m| m.kind() == first)
            .then_some(first)
    }

    /// Every member as a file, or `None` if any is not a file.
    pub fn files(&self) -> Option<Vec<&FileMember>> {
        self.members
            .iter()
            .map(|m| match m {
                Member::File(file) => Some(file),
                _ => None,
            })
            .collect()
    }

    /// File contents in archive order. Read on first call and cached.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotAFile`] if any member is not a file, or
    /// an I/O error if a file cannot be read.
    pub fn datas(&mut self) -> Result<&[Vec<u8>], ArchiveError> {
        let datas = match self.datas.take() {
            Some(datas) => datas,
            None => self
                .members
                .iter()
                .map(|m| match m {
                    Member::File(file) => file
                        .source
                        .read_all()
                        .map_err(|e| ArchiveError::member_io(&file.path, e)),
                    other => Err(ArchiveError::NotAFile(other.path().clone())),
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(self.datas.insert(datas).as_slice())
    }

    /// Consume the set, returning the members.
    pub fn into_members(self) -> Vec<Member> {
        self.members
    }
}

pub(crate) fn all_equal<T: PartialEq>(mut items: impl Iterator<Item = T>) -> bool {
    match items.next() {
        Some(first) => items.all(|item| item == first),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, FileSource, TarArchiveWriter};
    use std::path::PathBuf;

    fn write_tar(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = TarArchiveWriter::create(&path).unwrap();
        for (rel, data) in files {
            let member_path = writer.base().join(rel).unwrap();
            writer
                .add(Member::file(member_path, FileSource::bytes(data.to_vec())))
                .unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn aligned_walk_pairs_members() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write_tar(tmp.path(), "x-macos-arm64.tar.xz", &[("lib/a", b"1")]);
        let b = write_tar(tmp.path(), "x-macos-x86_64.tar.xz", &[("lib/a", b"1")]);

        let mut group = ReaderGroup::open(&[a, b]).unwrap();
        assert_eq!(group.len(), 2);
        let sets: Vec<MemberSet> = group.aligned().unwrap().map(Result::unwrap).collect();
        let relpaths: Vec<Vec<&str>> = sets.iter().map(MemberSet::relpaths).collect();
        assert_eq!(relpaths, [vec!["", ""], vec!["lib", "lib"], vec!["lib/a", "lib/a"]]);
        assert!(sets.iter().all(MemberSet::same_relpath));
        assert_eq!(sets[0].common_kind(), Some(MemberKind::Dir));
    }

    #[test]
    fn short_archive_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write_tar(tmp.path(), "a.tar.xz", &[("x", b"1"), ("y", b"2")]);
        let b = write_tar(tmp.path(), "b.tar.xz", &[("x", b"1")]);

        let mut group = ReaderGroup::open(&[&a, &b]).unwrap();
        let mut sets = group.aligned().unwrap();
        assert!(sets.next().unwrap().is_ok());
        assert!(sets.next().unwrap().is_ok());
        match sets.next().unwrap() {
            Err(ArchiveError::MissingMember { position, archives }) => {
                assert_eq!(position, 2);
                assert_eq!(archives, [b.display().to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(sets.next().is_none());
    }

    #[test]
    fn datas_reads_once_and_rejects_non_files() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write_tar(tmp.path(), "a.tar.xz", &[("f", b"one")]);
        let b = write_tar(tmp.path(), "b.tar.xz", &[("f", b"two")]);
        let mut group = ReaderGroup::open(&[a, b]).unwrap();
        let mut sets: Vec<MemberSet> = group.aligned().unwrap().map(Result::unwrap).collect();

        assert!(matches!(sets[0].datas(), Err(ArchiveError::NotAFile(_))));
        let datas = sets[1].datas().unwrap().to_vec();
        assert_eq!(datas, [b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(sets[1].datas().unwrap(), datas.as_slice());
    }

    #[test]
    fn missing_member_at_construction() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let dir = |s: &str| Some(Member::dir(ArchivePath::new(s).unwrap()));
        let err = MemberSet::new(7, vec![dir("a"), None, None], &names).unwrap_err();
        assert_eq!(err.to_string(), "Missing member at position 7 in: b, c");
    }

    #[test]
    fn open_fails_on_unknown_format() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("x.tar.gz");
        std::fs::write(&bogus, b"").unwrap();
        assert!(matches!(
            ReaderGroup::open(&[bogus]),
            Err(ArchiveError::UnsupportedFormat(_))
        ));
    }
}
