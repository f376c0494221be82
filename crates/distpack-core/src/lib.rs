//! Packaging library for distpack: archives, universal merges, bdist and
//! wheel layout, and binary post-processing.

pub mod archive;
pub mod config;
pub mod context;
pub mod layout;
pub mod merge;
pub mod postprocess;
pub mod tools;

pub use archive::{ArchiveError, ArchivePath, ArchiveWriter, Member};
pub use config::Config;
pub use context::BuildContext;
pub use tools::{ToolKind, Toolchain};
