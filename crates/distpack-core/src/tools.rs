//! External binary utilities.
//!
//! Every tool is an opaque command resolved once into a [`Toolchain`]:
//! an environment variable (`$LIPO`, `$STRIP`, ...) wins, then the config
//! file's `[tools]` table, then the bare tool name looked up on `PATH` at
//! spawn time. Commands are run to completion; a non-zero exit is an error
//! carrying the tool's stderr.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::merge::BinaryMerger;

/// Errors from running external tools.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The program could not be found.
    #[error("'{program}' not found. Install it or set ${env} to its path")]
    NotFound {
        /// Program that was looked up.
        program: String,
        /// Environment variable that overrides it.
        env: &'static str,
    },

    /// The program exists but could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Cause.
        source: io::Error,
    },

    /// The program exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The program's output was not what the caller needs.
    #[error("Unexpected output from {program}: {message}")]
    Output {
        /// Program whose output was rejected.
        program: String,
        /// What was wrong.
        message: String,
    },

    /// Preparing inputs or outputs failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A `[tools]` key does not name a known tool.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// The external utilities distpack knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolKind {
    /// Combines thin Mach-O files into a universal binary.
    Lipo,
    /// Removes symbols.
    Strip,
    /// Extracts macOS debug info into a `.dSYM` bundle.
    Dsymutil,
    /// ELF/PE section manipulation.
    Objcopy,
    /// ELF/PE inspection.
    Objdump,
    /// Mach-O export listing.
    DyldInfo,
    /// Mach-O load-command inspection.
    Otool,
    /// Mach-O load-command editing.
    InstallNameTool,
    /// ELF rpath editing.
    Patchelf,
    /// Wheel platform-tag verification.
    Auditwheel,
}

impl ToolKind {
    /// Every tool.
    pub const ALL: [Self; 10] = [
        Self::Lipo,
        Self::Strip,
        Self::Dsymutil,
        Self::Objcopy,
        Self::Objdump,
        Self::DyldInfo,
        Self::Otool,
        Self::InstallNameTool,
        Self::Patchelf,
        Self::Auditwheel,
    ];

    /// Default program name, also the key in the config file's `[tools]`.
    pub fn program(self) -> &'static str {
        match self {
            Self::Lipo => "lipo",
            Self::Strip => "strip",
            Self::Dsymutil => "dsymutil",
            Self::Objcopy => "objcopy",
            Self::Objdump => "objdump",
            Self::DyldInfo => "dyld_info",
            Self::Otool => "otool",
            Self::InstallNameTool => "install_name_tool",
            Self::Patchelf => "patchelf",
            Self::Auditwheel => "auditwheel",
        }
    }

    /// Environment variable overriding the program path.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Lipo => "LIPO",
            Self::Strip => "STRIP",
            Self::Dsymutil => "DSYMUTIL",
            Self::Objcopy => "OBJCOPY",
            Self::Objdump => "OBJDUMP",
            Self::DyldInfo => "DYLD_INFO",
            Self::Otool => "OTOOL",
            Self::InstallNameTool => "INSTALL_NAME_TOOL",
            Self::Patchelf => "PATCHELF",
            Self::Auditwheel => "AUDITWHEEL",
        }
    }

    /// Look a tool up by its config key.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] for unrecognized keys.
    pub fn from_key(key: &str) -> Result<Self, ToolError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.program() == key)
            .ok_or_else(|| ToolError::UnknownTool(key.to_string()))
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// A resolved external program.
#[derive(Debug, Clone)]
pub struct Tool {
    kind: ToolKind,
    program: PathBuf,
}

impl Tool {
    /// Tool run as `program`.
    pub fn new(kind: ToolKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
        }
    }

    /// Which tool this is.
    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    /// Program path or name.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Locate the program on `PATH` (or check an explicit path).
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] if no executable matches.
    pub fn resolve(&self) -> Result<PathBuf, ToolError> {
        which::which(&self.program).map_err(|_| ToolError::NotFound {
            program: self.program.display().to_string(),
            env: self.kind.env_var(),
        })
    }

    /// A fresh command for this program, for callers that need to set a
    /// working directory or build arguments incrementally.
    pub fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Run with `args` and return standard output.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn run<I, S>(&self, args: I) -> Result<String, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(args);
        self.execute(cmd)
    }

    /// Run a command built with [`command`](Self::command) and return
    /// standard output.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] if the program does not exist,
    /// [`ToolError::Spawn`] if it cannot be started, and
    /// [`ToolError::Failed`] with its stderr if it exits unsuccessfully.
    pub fn execute(&self, mut cmd: Command) -> Result<String, ToolError> {
        tracing::debug!(tool = %self.kind, command = ?cmd, "running");
        let output = match cmd.output() {
            Ok(o) => o,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound {
                    program: self.program.display().to_string(),
                    env: self.kind.env_var(),
                });
            }
            Err(e) => {
                return Err(ToolError::Spawn {
                    program: self.program.display().to_string(),
                    source: e,
                });
            }
        };

        if !output.status.success() {
            return Err(ToolError::Failed {
                program: self.program.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resolved paths for every external tool.
#[derive(Debug, Clone)]
pub struct Toolchain {
    tools: BTreeMap<ToolKind, PathBuf>,
    configured: BTreeSet<ToolKind>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            tools: ToolKind::ALL
                .into_iter()
                .map(|kind| (kind, PathBuf::from(kind.program())))
                .collect(),
            configured: BTreeSet::new(),
        }
    }
}

impl Toolchain {
    /// Resolve every tool from the environment, falling back to the bare
    /// program names.
    pub fn from_env() -> Self {
        Self::resolve(&BTreeMap::new(), |var| std::env::var_os(var))
    }

    /// Resolve every tool from the environment, then `overrides` (keyed by
    /// [`ToolKind`]), then the bare program names.
    pub fn from_env_with(overrides: &BTreeMap<ToolKind, PathBuf>) -> Self {
        Self::resolve(overrides, |var| std::env::var_os(var))
    }

    fn resolve(
        overrides: &BTreeMap<ToolKind, PathBuf>,
        env: impl Fn(&str) -> Option<OsString>,
    ) -> Self {
        let mut toolchain = Self::default();
        for (kind, program) in &mut toolchain.tools {
            if let Some(value) = env(kind.env_var()).filter(|v| !v.is_empty()) {
                *program = PathBuf::from(value);
            } else if let Some(path) = overrides.get(kind) {
                program.clone_from(path);
            } else {
                continue;
            }
            toolchain.configured.insert(*kind);
        }
        toolchain
    }

    /// Replace one tool's program.
    #[must_use]
    pub fn with_tool(mut self, kind: ToolKind, program: impl Into<PathBuf>) -> Self {
        self.tools.insert(kind, program.into());
        self.configured.insert(kind);
        self
    }

    /// Whether `kind` was set explicitly (environment, config or
    /// [`with_tool`](Self::with_tool)) rather than defaulted.
    pub fn is_configured(&self, kind: ToolKind) -> bool {
        self.configured.contains(&kind)
    }

    /// The resolved tool of `kind`.
    pub fn tool(&self, kind: ToolKind) -> Tool {
        let program = self
            .tools
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(kind.program()));
        Tool::new(kind, program)
    }

    /// Check that every tool in `kinds` can be found, before any of them
    /// is run.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] for the first missing tool.
    pub fn require(&self, kinds: &[ToolKind]) -> Result<(), ToolError> {
        for &kind in kinds {
            let path = self.tool(kind).resolve()?;
            tracing::debug!(tool = %kind, path = %path.display(), "found");
        }
        Ok(())
    }

    /// The configured `lipo`.
    pub fn lipo(&self) -> Lipo {
        Lipo::new(self.tool(ToolKind::Lipo))
    }
}

/// Merges thin Mach-O files with `lipo -create`.
#[derive(Debug, Clone)]
pub struct Lipo {
    tool: Tool,
}

impl Lipo {
    /// Wrap a resolved `lipo`.
    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }
}

impl BinaryMerger for Lipo {
    fn merge(&self, inputs: &[PathBuf], outdir: &Path) -> Result<PathBuf, ToolError> {
        let name = inputs
            .first()
            .and_then(|p| p.file_name())
            .ok_or_else(|| ToolError::Output {
                program: self.tool.program().display().to_string(),
                message: "no input files".to_string(),
            })?;
        let output = outdir.join(name);

        let mut cmd = self.tool.command();
        cmd.args(["-create", "-output"]).arg(&output).args(inputs);
        self.tool.execute(cmd)?;
        Ok(output)
    }
}
