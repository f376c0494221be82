//! Read-only facts about the build being packaged.

use std::fs;
use std::path::{Path, PathBuf};

use distpack_schema::System;
use serde::Deserialize;
use thiserror::Error;

/// Errors loading build introspection data.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The introspection file could not be read.
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },

    /// The introspection file is not valid.
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Cause.
        source: serde_json::Error,
    },
}

/// The machine the packaged binaries run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Host operating system.
    pub host: System,
    /// Host CPU family as reported by the build system, if known.
    pub cpu_family: Option<String>,
}

#[derive(Deserialize)]
struct Machines {
    host: Machine,
}

#[derive(Deserialize)]
struct Machine {
    system: System,
    #[serde(default)]
    cpu_family: Option<String>,
}

impl BuildContext {
    /// Context for an explicitly given host.
    pub fn new(host: System) -> Self {
        Self {
            host,
            cpu_family: None,
        }
    }

    /// Load `<build_dir>/meson-info/intro-machines.json`.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::Io` if the file is missing or unreadable, or
    /// `ContextError::Parse` if it is not valid introspection JSON.
    pub fn from_build_dir(build_dir: &Path) -> Result<Self, ContextError> {
        let path = build_dir.join("meson-info").join("intro-machines.json");
        let content = fs::read_to_string(&path).map_err(|source| ContextError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_machines_json(&content).map_err(|source| ContextError::Parse { path, source })
    }

    /// Parse the contents of `intro-machines.json`.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the content is not valid.
    pub fn from_machines_json(content: &str) -> Result<Self, serde_json::Error> {
        let machines: Machines = serde_json::from_str(content)?;
        Ok(Self {
            host: machines.host.system,
            cpu_family: machines.host.cpu_family,
        })
    }
}
