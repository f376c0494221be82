//! Optional `distpack.toml` configuration.
//!
//! ```toml
//! [tools]
//! lipo = "/opt/cctools/bin/lipo"
//! install_name_tool = "/opt/cctools/bin/install_name_tool"
//!
//! [merge]
//! arch_tokens = ["aarch64", "arm64", "x86_64"]
//! ```
//!
//! Environment variables (`$LIPO`, ...) still take precedence over
//! `[tools]`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merge::ArchTokens;
use crate::tools::{ToolError, ToolKind, Toolchain};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content is invalid.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// `[tools]` names an unknown tool.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tool program overrides keyed by tool name.
    #[serde(default)]
    pub tools: BTreeMap<String, PathBuf>,
    /// Universal merge settings.
    #[serde(default)]
    pub merge: MergeConfig,
}

/// `[merge]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Path segments marking architecture-specific content. Replaces the
    /// default set when present.
    #[serde(default)]
    pub arch_tokens: Option<Vec<String>>,
}

impl Config {
    /// Read and parse a config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, or
    /// `ConfigError::Parse` if the TOML is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the TOML is invalid or has unknown
    /// keys.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Toolchain from the environment with this file's overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Tool` if `[tools]` names an unknown tool.
    pub fn toolchain(&self) -> Result<Toolchain, ConfigError> {
        let overrides = self
            .tools
            .iter()
            .map(|(key, path)| Ok((ToolKind::from_key(key)?, path.clone())))
            .collect::<Result<BTreeMap<_, _>, ToolError>>()?;
        Ok(Toolchain::from_env_with(&overrides))
    }

    /// Architecture tokens: `extra` if non-empty, else the configured set,
    /// else the default.
    pub fn arch_tokens(&self, extra: &[String]) -> ArchTokens {
        if !extra.is_empty() {
            return ArchTokens::new(extra.iter().cloned());
        }
        self.merge
            .arch_tokens
            .as_ref()
            .map_or_else(ArchTokens::default, |tokens| {
                ArchTokens::new(tokens.iter().cloned())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"
            [tools]
            dyld_info = "/opt/xcode/dyld_info"

            [merge]
            arch_tokens = ["arm64e", "x86_64h"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.tools.get("dyld_info"),
            Some(&PathBuf::from("/opt/xcode/dyld_info"))
        );
        let tokens = config.arch_tokens(&[]);
        assert!(tokens.is_arch_qualified("x/arm64e/y"));
        assert!(!tokens.is_arch_qualified("x/aarch64/y"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.arch_tokens(&[]), ArchTokens::default());
        assert!(config.toolchain().is_ok());
    }

    #[test]
    fn cli_tokens_win() {
        let config = Config::parse("[merge]\narch_tokens = [\"ppc\"]\n").unwrap();
        let tokens = config.arch_tokens(&["sparc".to_string()]);
        assert_eq!(tokens.iter().collect::<Vec<_>>(), ["sparc"]);
    }

    #[test]
    fn unknown_tool_rejected() {
        let config = Config::parse("[tools]\nld = \"/usr/bin/ld\"\n").unwrap();
        assert!(matches!(config.toolchain(), Err(ConfigError::Tool(_))));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            Config::parse("[merge]\ntokens = []\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
