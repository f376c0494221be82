use serde::{Deserialize, Deserializer, Serialize};

/// Operating system a build targets.
///
/// Meson reports macOS as `darwin` while bdist filenames say `macos`; both
/// spellings parse to [`System::MacOS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum System {
    /// Linux (glibc)
    Linux,
    /// macOS
    #[serde(rename = "macos")]
    MacOS,
    /// Windows
    Windows,
}

impl System {
    /// Token used in bdist filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOS => "macos",
            Self::Windows => "windows",
        }
    }

    /// Human-readable name for reports.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Linux => "Linux",
            Self::MacOS => "macOS",
            Self::Windows => "Windows",
        }
    }
}

impl std::fmt::Display for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for System {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "macos" | "darwin" => Ok(Self::MacOS),
            "windows" => Ok(Self::Windows),
            _ => Err(format!("Unknown system: {s}")),
        }
    }
}

impl<'de> Deserialize<'de> for System {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn darwin_is_macos() {
        assert_eq!("darwin".parse::<System>(), Ok(System::MacOS));
        assert_eq!(System::MacOS.as_str(), "macos");
        assert_eq!(System::MacOS.display_name(), "macOS");
    }

    #[test]
    fn unknown_system_rejected() {
        assert!("freebsd".parse::<System>().is_err());
    }
}
