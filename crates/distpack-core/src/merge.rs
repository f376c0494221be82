//! Universal (multi-architecture) merge of per-architecture archives.
//!
//! Input archives are walked in lockstep. For every aligned [`MemberSet`],
//! [`plan`] decides what the output gets: one copy of an identical member,
//! a fat binary built from Mach-O inputs, or every side individually when
//! the paths legitimately diverge by architecture (dSYM relocation
//! directories). [`UniversalMerger`] carries the decisions out against an
//! [`ArchiveWriter`].

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use distpack_schema::{Arch, BDistName, MACHO_MAGIC_64, NameError, System};
use tempfile::TempDir;
use thiserror::Error;

use crate::archive::reader::all_equal;
use crate::archive::{
    ArchiveError, ArchiveWriter, FileSource, Member, MemberKind, MemberSet, ReaderGroup,
    TarArchiveWriter,
};
use crate::tools::ToolError;

/// Errors from merging archives.
#[derive(Error, Debug)]
pub enum MergeError {
    /// Reading or writing an archive failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Relative paths differ and the difference is not architecture-specific.
    #[error("Path mismatch: {}", .0.join(", "))]
    PathMismatch(Vec<String>),

    /// Paths diverge by architecture but the members are not all files or
    /// all directories.
    #[error("Unknown/mismatched types for relocations: {}", .0.join(", "))]
    RelocationMismatch(Vec<String>),

    /// Symlinks at the same path point at different targets.
    #[error("Symlink target mismatch at {path}: {}", .targets.join(", "))]
    SymlinkMismatch {
        /// Relative path of the symlinks.
        path: String,
        /// Target from each archive.
        targets: Vec<String>,
    },

    /// Non-Mach-O files at the same path have different contents.
    #[error("Contents mismatch: {0}")]
    ContentMismatch(String),

    /// Members at the same path are of different kinds.
    #[error("Unknown/mismatched types at {path}: {}", .kinds.join(", "))]
    TypeMismatch {
        /// Relative path of the members.
        path: String,
        /// Kind of each member.
        kinds: Vec<String>,
    },

    /// The binary merger failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Nothing to merge.
    #[error("No input archives")]
    NoInputs,

    /// An input is not named like a bdist.
    #[error(transparent)]
    Name(#[from] NameError),

    /// An input bdist targets another system.
    #[error("Universal merge inputs must be macOS bdists: {path} is for {}", .system.display_name())]
    NotMacOS {
        /// Offending input.
        path: String,
        /// System named in its filename.
        system: System,
    },
}

/// Path segments that mark architecture-specific content.
///
/// Relative paths may differ across inputs only when every side contains
/// one of these segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchTokens(BTreeSet<String>);

impl Default for ArchTokens {
    fn default() -> Self {
        Self::new(Arch::ALL.iter().map(Arch::as_str))
    }
}

impl ArchTokens {
    /// Token set from arbitrary strings.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// Whether some segment of `relpath` is a token.
    pub fn is_arch_qualified(&self, relpath: &str) -> bool {
        relpath.split('/').any(|seg| self.0.contains(seg))
    }

    /// Tokens in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Combines N single-architecture binaries into one.
pub trait BinaryMerger {
    /// Merge `inputs` into a new file inside `outdir` and return its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the merge tool fails.
    fn merge(&self, inputs: &[PathBuf], outdir: &Path) -> Result<PathBuf, ToolError>;
}

/// What to emit for one aligned member set.
#[derive(Debug)]
pub enum MergeAction {
    /// Emit this member once.
    Keep(Member),
    /// Merge these per-architecture binaries into one file at `relpath`.
    Universal {
        /// Path relative to the archive base.
        relpath: String,
        /// One input per archive.
        inputs: Vec<FileSource>,
    },
    /// Emit every member individually.
    Relocate(Vec<Member>),
}

/// Decide how to merge one member set.
///
/// # Errors
///
/// Returns a [`MergeError`] describing the conflict when the members cannot
/// be reconciled, or an I/O error if file contents cannot be read.
pub fn plan(mut set: MemberSet, tokens: &ArchTokens) -> Result<MergeAction, MergeError> {
    let relpaths: Vec<String> = set.relpaths().into_iter().map(str::to_owned).collect();
    let kind = set.common_kind();

    if !set.same_relpath() {
        if !relpaths.iter().all(|p| tokens.is_arch_qualified(p)) {
            return Err(MergeError::PathMismatch(relpaths));
        }
        return match kind {
            Some(MemberKind::Dir | MemberKind::File) => {
                Ok(MergeAction::Relocate(set.into_members()))
            }
            _ => Err(MergeError::RelocationMismatch(relpaths)),
        };
    }

    let relpath = relpaths.into_iter().next().unwrap_or_default();
    match kind {
        Some(MemberKind::Dir) => Ok(MergeAction::Keep(first(set)?)),
        Some(MemberKind::Symlink) => {
            let targets: Vec<String> = set
                .members()
                .iter()
                .filter_map(|m| match m {
                    Member::Symlink(link) => Some(link.target.clone()),
                    _ => None,
                })
                .collect();
            if all_equal(targets.iter()) {
                Ok(MergeAction::Keep(first(set)?))
            } else {
                Err(MergeError::SymlinkMismatch {
                    path: relpath,
                    targets,
                })
            }
        }
        Some(MemberKind::File) => {
            let sources: Vec<FileSource> = set
                .files()
                .unwrap_or_default()
                .into_iter()
                .map(|f| f.source.clone())
                .collect();
            if is_macho(&set, &sources)? {
                return Ok(MergeAction::Universal {
                    relpath,
                    inputs: sources,
                });
            }
            if all_equal(set.datas()?.iter()) {
                Ok(MergeAction::Keep(first(set)?))
            } else {
                Err(MergeError::ContentMismatch(relpath))
            }
        }
        None => Err(MergeError::TypeMismatch {
            path: relpath,
            kinds: set.members().iter().map(|m| m.kind().to_string()).collect(),
        }),
    }
}

/// Whether every input starts with the 64-bit Mach-O magic.
fn is_macho(set: &MemberSet, sources: &[FileSource]) -> Result<bool, ArchiveError> {
    for (member, source) in set.members().iter().zip(sources) {
        let head = source
            .head(MACHO_MAGIC_64.len())
            .map_err(|e| ArchiveError::member_io(member.path(), e))?;
        if head != MACHO_MAGIC_64 {
            return Ok(false);
        }
    }
    Ok(!sources.is_empty())
}

fn first(set: MemberSet) -> Result<Member, ArchiveError> {
    let position = set.position();
    set.into_members()
        .into_iter()
        .next()
        .ok_or(ArchiveError::MissingMember {
            position,
            archives: Vec::new(),
        })
}

/// Counts of what a merge emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Members emitted once, unchanged.
    pub kept: usize,
    /// Members emitted per architecture.
    pub relocated: usize,
    /// Fat binaries produced by the binary merger.
    pub universal: usize,
}

/// Applies [`MergeAction`]s to an output archive.
///
/// Owns a scratch directory for merged binaries. The writer reads them when
/// it finishes, so finish the writer before dropping the merger.
pub struct UniversalMerger<'a> {
    merger: &'a dyn BinaryMerger,
    tokens: ArchTokens,
    scratch: TempDir,
    jobs: usize,
    stats: MergeStats,
}

impl std::fmt::Debug for UniversalMerger<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalMerger")
            .field("tokens", &self.tokens)
            .field("scratch", &self.scratch.path())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'a> UniversalMerger<'a> {
    /// Merger using `merger` for Mach-O files and `tokens` to recognize
    /// architecture-specific paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created.
    pub fn new(merger: &'a dyn BinaryMerger, tokens: ArchTokens) -> Result<Self, MergeError> {
        let scratch = tempfile::Builder::new()
            .prefix("distpack-")
            .tempdir()
            .map_err(ArchiveError::from)?;
        Ok(Self {
            merger,
            tokens,
            scratch,
            jobs: 0,
            stats: MergeStats::default(),
        })
    }

    /// What has been emitted so far.
    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Walk `group` in lockstep and emit every decision into `out`.
    ///
    /// # Errors
    ///
    /// Stops at the first alignment failure, conflict or tool failure.
    pub fn merge_all(
        &mut self,
        group: &mut ReaderGroup,
        out: &mut dyn ArchiveWriter,
    ) -> Result<MergeStats, MergeError> {
        for set in group.aligned()? {
            let action = plan(set?, &self.tokens)?;
            self.apply(action, out)?;
        }
        Ok(self.stats)
    }

    /// Emit one decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer rejects a member or the binary merger
    /// fails.
    pub fn apply(
        &mut self,
        action: MergeAction,
        out: &mut dyn ArchiveWriter,
    ) -> Result<(), MergeError> {
        match action {
            MergeAction::Keep(member) => {
                tracing::debug!(path = member.relpath(), kind = %member.kind(), "keep");
                out.add(member.rebase(out.base()))?;
                self.stats.kept += 1;
            }
            MergeAction::Relocate(members) => {
                for member in members {
                    tracing::debug!(path = member.relpath(), "relocate");
                    out.add(member.rebase(out.base()))?;
                    self.stats.relocated += 1;
                }
            }
            MergeAction::Universal { relpath, inputs } => {
                tracing::debug!(path = %relpath, inputs = inputs.len(), "merge binary");
                let merged = self.merge_binary(&relpath, &inputs)?;
                let path = out.base().join(&relpath)?;
                out.add(Member::file(path, FileSource::Path(merged)))?;
                self.stats.universal += 1;
            }
        }
        Ok(())
    }

    fn merge_binary(&mut self, relpath: &str, inputs: &[FileSource]) -> Result<PathBuf, MergeError> {
        let job = self.jobs;
        self.jobs += 1;
        let name = relpath.rsplit('/').next().unwrap_or(relpath);
        let jobdir = self.scratch.path().join(format!("{job}"));

        let paths = inputs
            .iter()
            .enumerate()
            .map(|(i, source)| source.materialize(&jobdir.join(format!("in-{i}")), name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ToolError::from)?;
        let outdir = jobdir.join("out");
        fs::create_dir_all(&outdir).map_err(ToolError::from)?;
        Ok(self.merger.merge(&paths, &outdir)?)
    }
}

/// Parse an input filename and require a macOS bdist.
fn macos_bdist(path: &Path) -> Result<BDistName, MergeError> {
    let name = BDistName::from_path(path)?;
    if name.system != System::MacOS {
        return Err(MergeError::NotMacOS {
            path: path.display().to_string(),
            system: name.system,
        });
    }
    Ok(name)
}

/// Merge per-architecture macOS bdists at `inputs` into one tarball at
/// `output`. On failure the partial output file is removed.
///
/// # Errors
///
/// Returns [`MergeError::NotMacOS`] or a name error for inputs that are not
/// macOS bdists, else the first alignment failure, conflict, tool failure
/// or I/O error.
pub fn merge_universal<P: AsRef<Path>>(
    inputs: &[P],
    output: &Path,
    merger: &dyn BinaryMerger,
    tokens: ArchTokens,
) -> Result<MergeStats, MergeError> {
    if inputs.is_empty() {
        return Err(MergeError::NoInputs);
    }
    let names = inputs
        .iter()
        .map(|p| macos_bdist(p.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    let qualifiers: Vec<&str> = names.iter().map(|n| n.qualifier.as_str()).collect();
    let mut group = ReaderGroup::open(inputs)?;
    let mut engine = UniversalMerger::new(merger, tokens)?;
    let mut writer = TarArchiveWriter::create(output)?;

    let result = engine
        .merge_all(&mut group, &mut writer)
        .and_then(|stats| {
            writer.finish()?;
            Ok(stats)
        });
    match result {
        Ok(stats) => {
            tracing::info!(
                output = %output.display(),
                name = %names[0].name,
                qualifiers = %qualifiers.join(" "),
                kept = stats.kept,
                relocated = stats.relocated,
                universal = stats.universal,
                "wrote universal archive"
            );
            Ok(stats)
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(output) {
                tracing::warn!(output = %output.display(), error = %rm, "could not remove partial output");
            }
            Err(e)
        }
    }
}
