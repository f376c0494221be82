//! Binary post-processing: split debug info, verify exported symbols and
//! make executables find their libraries relative to themselves.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use distpack_schema::System;
use regex::Regex;
use thiserror::Error;

use crate::tools::{ToolError, ToolKind, Toolchain};

static LIBRARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(dll|dylib|so[.0-9]*)$").expect("valid library pattern"));
static SHARED_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.so[.0-9]*$").expect("valid soname pattern"));

/// rpath given to Linux executables.
pub const LINUX_RPATH: &str = "$ORIGIN/../lib";
/// rpath given to macOS executables.
pub const MACOS_RPATH: &str = "@loader_path/../lib";

/// Errors from post-processing a binary.
#[derive(Error, Debug)]
pub enum PostprocessError {
    /// An external tool failed or printed something unparseable.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The library exports nothing, which means the symbol query is broken.
    #[error("Couldn't find exported symbols in {}", .0.display())]
    NoExports(PathBuf),

    /// The library exports symbols outside the public prefix.
    #[error("Unexpected exports in {}: {}", .path.display(), .symbols.join(", "))]
    UnexpectedExports {
        /// Library checked.
        path: PathBuf,
        /// Offending symbols.
        symbols: Vec<String>,
    },

    /// ELF debuglinks carry no directory, so the debug file must sit next
    /// to the output.
    #[error("Debug info {} must be in the same directory as {}", .debuginfo.display(), .output.display())]
    DebugDirMismatch {
        /// Requested debug file.
        debuginfo: PathBuf,
        /// Requested output.
        output: PathBuf,
    },

    /// `otool -l` listed no `LC_RPATH`.
    #[error("Couldn't read LC_RPATH from {}", .0.display())]
    NoRpath(PathBuf),
}

/// Whether `name` is a shared library whose exports should be checked.
pub fn is_library(name: &str) -> bool {
    LIBRARY_RE.is_match(name)
}

/// Post-processes binaries built for one host.
#[derive(Debug)]
pub struct Postprocessor<'a> {
    toolchain: &'a Toolchain,
    host: System,
    export_prefix: String,
}

impl<'a> Postprocessor<'a> {
    /// Libraries may only export symbols starting with `export_prefix`.
    pub fn new(toolchain: &'a Toolchain, host: System, export_prefix: impl Into<String>) -> Self {
        Self {
            toolchain,
            host,
            export_prefix: export_prefix.into(),
        }
    }

    /// Strip `file` into `output`, writing its debug info to `debuginfo`,
    /// then check exports (libraries) or fix the rpath (executables).
    ///
    /// # Errors
    ///
    /// Returns the first tool failure or check failure.
    pub fn run(&self, file: &Path, output: &Path, debuginfo: &Path) -> Result<(), PostprocessError> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.toolchain.require(&self.required_tools(&name))?;

        self.split_debug(file, output, debuginfo)?;

        if is_library(&name) {
            self.check_exports(file)?;
        }
        match self.host {
            System::Linux if !SHARED_OBJECT_RE.is_match(&name) => {
                self.toolchain
                    .tool(ToolKind::Patchelf)
                    .run([
                        Path::new("--set-rpath"),
                        Path::new(LINUX_RPATH),
                        output,
                    ])?;
                tracing::debug!(output = %output.display(), rpath = LINUX_RPATH, "set rpath");
            }
            System::MacOS if !name.ends_with(".dylib") => self.replace_macos_rpath(output)?,
            _ => {}
        }
        tracing::info!(file = %file.display(), output = %output.display(), "postprocessed");
        Ok(())
    }

    /// Tools [`run`](Self::run) needs for a binary called `name`.
    pub fn required_tools(&self, name: &str) -> Vec<ToolKind> {
        let library = is_library(name);
        let mut kinds = Vec::new();
        match self.host {
            System::MacOS => {
                kinds.extend([ToolKind::Dsymutil, ToolKind::Strip]);
                if library {
                    kinds.push(ToolKind::DyldInfo);
                }
                if !name.ends_with(".dylib") {
                    kinds.extend([ToolKind::Otool, ToolKind::InstallNameTool]);
                }
            }
            System::Linux | System::Windows => {
                kinds.push(ToolKind::Objcopy);
                if library {
                    kinds.push(ToolKind::Objdump);
                }
                if self.host == System::Linux && !SHARED_OBJECT_RE.is_match(name) {
                    kinds.push(ToolKind::Patchelf);
                }
            }
        }
        kinds
    }

    /// Move debug info out of `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tool fails, or on ELF/PE hosts if `debuginfo`
    /// and `output` are in different directories.
    pub fn split_debug(
        &self,
        file: &Path,
        output: &Path,
        debuginfo: &Path,
    ) -> Result<(), PostprocessError> {
        if self.host == System::MacOS {
            self.toolchain
                .tool(ToolKind::Dsymutil)
                .run([Path::new("-o"), debuginfo, file])?;
            self.toolchain
                .tool(ToolKind::Strip)
                .run([Path::new("-u"), Path::new("-r"), Path::new("-o"), output, file])?;
            return Ok(());
        }

        let dir = debuginfo.parent().unwrap_or_else(|| Path::new(""));
        if output.parent().unwrap_or_else(|| Path::new("")) != dir {
            return Err(PostprocessError::DebugDirMismatch {
                debuginfo: debuginfo.to_path_buf(),
                output: output.to_path_buf(),
            });
        }
        let objcopy = self.toolchain.tool(ToolKind::Objcopy);
        objcopy.run([Path::new("--only-keep-debug"), file, debuginfo])?;
        set_mode(debuginfo, 0o644)?;

        let link_name = debuginfo
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut cmd = objcopy.command();
        cmd.arg("-S")
            .arg(format!("--add-gnu-debuglink={link_name}"))
            .arg(std::path::absolute(file)?)
            .arg(std::path::absolute(output)?);
        if !dir.as_os_str().is_empty() {
            cmd.current_dir(dir);
        }
        objcopy.execute(cmd)?;
        Ok(())
    }

    /// Exported symbols of `library`, as reported by the host's tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails or its output cannot be parsed.
    pub fn library_symbols(&self, library: &Path) -> Result<Vec<String>, ToolError> {
        match self.host {
            System::Linux => {
                let tool = self.toolchain.tool(ToolKind::Objdump);
                let out = tool.run([Path::new("-T"), library])?;
                parse_objdump_dynamic(&out).ok_or_else(|| unparseable(&tool, "objdump -T"))
            }
            System::MacOS => {
                let out = self
                    .toolchain
                    .tool(ToolKind::DyldInfo)
                    .run([Path::new("-exports"), library])?;
                Ok(parse_dyld_exports(&out))
            }
            System::Windows => {
                let tool = self.toolchain.tool(ToolKind::Objdump);
                let out = tool.run([Path::new("-p"), library])?;
                parse_pe_exports(&out).ok_or_else(|| unparseable(&tool, "objdump -p"))
            }
        }
    }

    /// Fail unless `library` exports at least one symbol and every export
    /// starts with the allowed prefix.
    ///
    /// # Errors
    ///
    /// Returns [`PostprocessError::NoExports`] or
    /// [`PostprocessError::UnexpectedExports`].
    pub fn check_exports(&self, library: &Path) -> Result<(), PostprocessError> {
        let symbols = self.library_symbols(library)?;
        if symbols.is_empty() {
            return Err(PostprocessError::NoExports(library.to_path_buf()));
        }
        let count = symbols.len();
        let unexpected: Vec<String> = symbols
            .into_iter()
            .filter(|sym| !sym.starts_with(&self.export_prefix))
            .collect();
        if !unexpected.is_empty() {
            return Err(PostprocessError::UnexpectedExports {
                path: library.to_path_buf(),
                symbols: unexpected,
            });
        }
        tracing::debug!(library = %library.display(), exports = count, "exports ok");
        Ok(())
    }

    fn replace_macos_rpath(&self, output: &Path) -> Result<(), PostprocessError> {
        let out = self
            .toolchain
            .tool(ToolKind::Otool)
            .run([Path::new("-l"), output])?;
        let old = parse_lc_rpath(&out).ok_or_else(|| PostprocessError::NoRpath(output.to_path_buf()))?;
        self.toolchain.tool(ToolKind::InstallNameTool).run([
            Path::new("-rpath"),
            Path::new(&old),
            Path::new(MACOS_RPATH),
            output,
        ])?;
        tracing::debug!(output = %output.display(), old = %old, new = MACOS_RPATH, "replaced rpath");
        Ok(())
    }
}

fn unparseable(tool: &crate::tools::Tool, what: &str) -> ToolError {
    ToolError::Output {
        program: tool.program().display().to_string(),
        message: format!("couldn't parse {what} output"),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: u32) -> std::io::Result<()> {
    fs::metadata(path).map(drop)
}

/// Symbol names from `objdump -T`: the seventh field of every `.text`
/// line. `None` if such a line is too short.
pub fn parse_objdump_dynamic(out: &str) -> Option<Vec<String>> {
    out.lines()
        .filter(|line| line.contains(".text"))
        .map(|line| line.split_whitespace().nth(6).map(str::to_owned))
        .collect()
}

/// Symbol names from `dyld_info -exports`, without the leading underscore.
pub fn parse_dyld_exports(out: &str) -> Vec<String> {
    out.lines()
        .filter(|line| line.contains(" 0x"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|sym| sym.trim_start_matches('_').to_string())
        .collect()
}

/// Symbol names from the export table in `objdump -p` output. `None` if
/// the table is missing or unterminated.
pub fn parse_pe_exports(out: &str) -> Option<Vec<String>> {
    let mut lines = out.lines();
    lines.find(|line| line.contains("Ordinal/Name Pointer"))?;
    let mut symbols = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            return Some(symbols);
        }
        match line.split_whitespace().last() {
            Some("Name") | None => {}
            Some(sym) => symbols.push(sym.to_string()),
        }
    }
    None
}

/// Path of the first `LC_RPATH` load command in `otool -l` output.
pub fn parse_lc_rpath(out: &str) -> Option<String> {
    let mut lines = out.lines();
    lines.find(|line| line.contains("cmd LC_RPATH"))?;
    lines.find_map(|line| {
        let mut words = line.split_whitespace();
        (words.next() == Some("path"))
            .then(|| words.next().map(str::to_owned))
            .flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objdump_dynamic_symbols() {
        let out = "\n\
libopenslide.so.1:     file format elf64-x86-64\n\
\n\
DYNAMIC SYMBOL TABLE:\n\
0000000000000000      DF *UND*  0000000000000000 (GLIBC_2.2.5) free\n\
0000000000012340 g    DF .text  0000000000000123  Base        openslide_open\n\
0000000000012460 g    DF .text  0000000000000050  Base        openslide_close\n";
        assert_eq!(
            parse_objdump_dynamic(out).unwrap(),
            ["openslide_open", "openslide_close"]
        );
        assert!(parse_objdump_dynamic("0 g DF .text short\n").is_none());
    }

    #[test]
    fn dyld_exports_strip_underscore() {
        let out = r"/tmp/libopenslide.1.dylib [arm64]:
    -exports:
        offset      symbol
        0x00012340  _openslide_open
        0x00012460  _openslide_close
";
        assert_eq!(parse_dyld_exports(out), ["openslide_open", "openslide_close"]);
    }

    #[test]
    fn pe_export_table() {
        let out = "The Export Tables (interpreted .edata section contents)\n\
\n\
[Ordinal/Name Pointer] Table\n\
\t[   0] openslide_close\n\
\t[   1] openslide_open\n\
\n\
The Function Table\n";
        assert_eq!(
            parse_pe_exports(out).unwrap(),
            ["openslide_close", "openslide_open"]
        );
        assert!(parse_pe_exports("no table here\n").is_none());
        assert!(parse_pe_exports("[Ordinal/Name Pointer] Table\n\t[0] x\n").is_none());
    }

    #[test]
    fn lc_rpath() {
        let out = r"Load command 12
          cmd LC_RPATH
      cmdsize 32
         path /opt/build/lib (offset 12)
Load command 13
";
        assert_eq!(parse_lc_rpath(out).as_deref(), Some("/opt/build/lib"));
        assert_eq!(parse_lc_rpath("Load command 1\n cmd LC_ID_DYLIB\n"), None);
    }

    #[test]
    fn library_names() {
        assert!(is_library("libopenslide-1.dll"));
        assert!(is_library("libopenslide.1.dylib"));
        assert!(is_library("libopenslide.so.1.2.3"));
        assert!(!is_library("slidetool"));
        assert!(!is_library("slidetool.exe"));
    }

    #[test]
    fn required_tools_follow_host_and_name() {
        let toolchain = Toolchain::default();
        let linux = Postprocessor::new(&toolchain, System::Linux, "openslide_");
        assert_eq!(
            linux.required_tools("libopenslide.so.1"),
            [ToolKind::Objcopy, ToolKind::Objdump]
        );
        assert_eq!(
            linux.required_tools("slidetool"),
            [ToolKind::Objcopy, ToolKind::Patchelf]
        );
        let mac = Postprocessor::new(&toolchain, System::MacOS, "openslide_");
        assert_eq!(
            mac.required_tools("libopenslide.1.dylib"),
            [ToolKind::Dsymutil, ToolKind::Strip, ToolKind::DyldInfo]
        );
        let windows = Postprocessor::new(&toolchain, System::Windows, "openslide_");
        assert_eq!(
            windows.required_tools("slidetool.exe"),
            [ToolKind::Objcopy]
        );
    }

    #[test]
    fn debug_file_must_share_output_dir() {
        let toolchain = Toolchain::default();
        let pp = Postprocessor::new(&toolchain, System::Linux, "openslide_");
        let err = pp
            .split_debug(
                Path::new("in/libx.so.1"),
                Path::new("out/libx.so.1"),
                Path::new("dbg/libx.so.1.debug"),
            )
            .unwrap_err();
        assert!(matches!(err, PostprocessError::DebugDirMismatch { .. }));
    }

    #[cfg(unix)]
    mod linux_flow {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn toolchain(dir: &Path, symbols: &str) -> Toolchain {
            // Copy input to output: `--only-keep-debug IN OUT` or
            // `-S --add-gnu-debuglink=X IN OUT`.
            let objcopy = script(
                dir,
                "objcopy",
                "if [ \"$1\" = --only-keep-debug ]; then cp \"$2\" \"$3\"; else cp \"$3\" \"$4\"; fi",
            );
            let objdump = script(dir, "objdump", &format!("printf '{symbols}'"));
            let patchelf = script(
                dir,
                "patchelf",
                &format!("echo \"$@\" > {}", dir.join("patchelf.log").display()),
            );
            Toolchain::default()
                .with_tool(ToolKind::Objcopy, objcopy)
                .with_tool(ToolKind::Objdump, objdump)
                .with_tool(ToolKind::Patchelf, patchelf)
        }

        const GOOD: &str =
            "0000000000012340 g    DF .text  0000000000000123  Base        openslide_open\\n";
        const LEAKY: &str = "0000000000012340 g    DF .text  0000000000000123  Base        openslide_open\\n\
0000000000012400 g    DF .text  0000000000000010  Base        png_read\\n";

        #[test]
        fn library_is_split_and_checked() {
            let tmp = tempfile::tempdir().unwrap();
            let tools = toolchain(tmp.path(), GOOD);
            let input = tmp.path().join("libopenslide.so.1.2.3");
            fs::write(&input, b"ELF").unwrap();
            let out_dir = tmp.path().join("out");
            fs::create_dir(&out_dir).unwrap();
            let output = out_dir.join("libopenslide.so.1.2.3");
            let debug = out_dir.join("libopenslide.so.1.2.3.debug");

            Postprocessor::new(&tools, System::Linux, "openslide_")
                .run(&input, &output, &debug)
                .unwrap();
            assert_eq!(fs::read(&output).unwrap(), b"ELF");
            assert_eq!(
                fs::metadata(&debug).unwrap().permissions().mode() & 0o777,
                0o644
            );
            // Shared objects keep their rpath.
            assert!(!tmp.path().join("patchelf.log").exists());
        }

        #[test]
        fn unexpected_exports_fail() {
            let tmp = tempfile::tempdir().unwrap();
            let tools = toolchain(tmp.path(), LEAKY);
            let input = tmp.path().join("libopenslide.so.1");
            fs::write(&input, b"ELF").unwrap();
            let err = Postprocessor::new(&tools, System::Linux, "openslide_")
                .check_exports(&input)
                .unwrap_err();
            match err {
                PostprocessError::UnexpectedExports { symbols, .. } => {
                    assert_eq!(symbols, ["png_read"]);
                }
                other => panic!("unexpected {other}"),
            }
        }

        #[test]
        fn missing_tool_fails_before_anything_runs() {
            let tmp = tempfile::tempdir().unwrap();
            let tools = toolchain(tmp.path(), GOOD)
                .with_tool(ToolKind::Patchelf, tmp.path().join("no-patchelf"));
            let input = tmp.path().join("slidetool");
            fs::write(&input, b"ELF").unwrap();
            let output = tmp.path().join("out-slidetool");

            let err = Postprocessor::new(&tools, System::Linux, "openslide_")
                .run(&input, &output, &tmp.path().join("slidetool.debug"))
                .unwrap_err();
            assert!(matches!(
                err,
                PostprocessError::Tool(ToolError::NotFound { env: "PATCHELF", .. })
            ));
            assert!(!output.exists());
        }

        #[test]
        fn executable_gets_rpath() {
            let tmp = tempfile::tempdir().unwrap();
            let tools = toolchain(tmp.path(), GOOD);
            let input = tmp.path().join("slidetool");
            fs::write(&input, b"ELF").unwrap();
            let out_dir = tmp.path().join("out");
            fs::create_dir(&out_dir).unwrap();
            let output = out_dir.join("slidetool");

            Postprocessor::new(&tools, System::Linux, "openslide_")
                .run(&input, &output, &out_dir.join("slidetool.debug"))
                .unwrap();
            let log = fs::read_to_string(tmp.path().join("patchelf.log")).unwrap();
            assert_eq!(log.trim(), format!("--set-rpath $ORIGIN/../lib {}", output.display()));
        }
    }
}
