//! Sorted, de-duplicated member set backing every writer.

use std::collections::BTreeMap;

use super::{ArchiveError, ArchivePath, Member};

/// Sorted, duplicate-free set of members with implicit parent directories.
///
/// Adding a member at `a/b/c` also records directories `a/b` and `a` unless
/// they already exist. Iteration is in [`ArchivePath`] order, which is the
/// order writers serialize in.
#[derive(Debug, Default)]
pub struct MemberTree {
    members: BTreeMap<ArchivePath, Member>,
}

impl MemberTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member and any missing ancestor directories.
    ///
    /// The tree is left unchanged on error.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::DuplicateMember`] if the path is taken, or
    /// [`ArchiveError::ParentNotDirectory`] if an ancestor is a file or
    /// symlink.
    pub fn insert(&mut self, member: Member) -> Result<(), ArchiveError> {
        let path = member.path().clone();
        if self.members.contains_key(&path) {
            return Err(ArchiveError::DuplicateMember(path));
        }

        let mut missing = Vec::new();
        let mut parent = path.parent();
        while let Some(dir) = parent {
            match self.members.get(&dir) {
                Some(Member::Dir(_)) => {}
                Some(other) => {
                    return Err(ArchiveError::ParentNotDirectory {
                        path,
                        parent: dir,
                        kind: other.kind(),
                    });
                }
                None => missing.push(dir.clone()),
            }
            parent = dir.parent();
        }

        for dir in missing {
            self.members.insert(dir.clone(), Member::dir(dir));
        }
        self.members.insert(path, member);
        Ok(())
    }

    /// Member at `path`, if any.
    pub fn get(&self, path: &ArchivePath) -> Option<&Member> {
        self.members.get(path)
    }

    /// Number of members, including synthesized directories.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in sorted path order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{FileSource, MemberKind};

    fn p(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    fn file(path: &str) -> Member {
        Member::file(p(path), FileSource::bytes(Vec::new()))
    }

    #[test]
    fn synthesizes_every_ancestor() {
        let mut tree = MemberTree::new();
        tree.insert(file("base/lib/pkgconfig/x.pc")).unwrap();
        let listed: Vec<(&str, MemberKind)> = tree
            .iter()
            .map(|m| (m.path().as_str(), m.kind()))
            .collect();
        assert_eq!(
            listed,
            [
                ("base", MemberKind::Dir),
                ("base/lib", MemberKind::Dir),
                ("base/lib/pkgconfig", MemberKind::Dir),
                ("base/lib/pkgconfig/x.pc", MemberKind::File),
            ]
        );
    }

    #[test]
    fn iteration_is_sorted_regardless_of_insertion_order() {
        let mut tree = MemberTree::new();
        tree.insert(file("b/z")).unwrap();
        tree.insert(file("b/lib-x")).unwrap();
        tree.insert(file("b/lib/a")).unwrap();
        tree.insert(Member::symlink(p("b/a"), "z")).unwrap();
        let order: Vec<&str> = tree.iter().map(|m| m.path().as_str()).collect();
        assert_eq!(order, ["b", "b/a", "b/lib", "b/lib/a", "b/lib-x", "b/z"]);
    }

    #[test]
    fn duplicate_rejected() {
        let mut tree = MemberTree::new();
        tree.insert(file("b/x")).unwrap();
        assert!(matches!(
            tree.insert(file("b/x")),
            Err(ArchiveError::DuplicateMember(_))
        ));
        // An implicit directory also occupies its path.
        assert!(matches!(
            tree.insert(Member::dir(p("b"))),
            Err(ArchiveError::DuplicateMember(_))
        ));
    }

    #[test]
    fn file_parent_rejected_without_side_effects() {
        let mut tree = MemberTree::new();
        tree.insert(file("b/x")).unwrap();
        let err = tree.insert(file("b/x/y/z")).unwrap_err();
        assert!(matches!(err, ArchiveError::ParentNotDirectory { .. }));
        assert!(tree.get(&p("b/x/y")).is_none());
        assert_eq!(tree.len(), 2);
    }
}
