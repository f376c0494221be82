/// CPU architecture of a per-architecture build.
///
/// distpack supports 64-bit ARM and 64-bit x86. Per-architecture debug
/// symbol bundles are laid out under a directory named after the
/// architecture, which is how the universal merge recognizes entries that
/// must be kept side by side instead of merged.
///
/// # Example
///
/// ```
/// use distpack_schema::Arch;
///
/// assert_eq!(Arch::Aarch64.as_str(), "aarch64");
/// assert_eq!(Arch::X86_64.to_string(), "x86_64");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit ARM (Apple Silicon, aarch64 Linux)
    Aarch64,
    /// 64-bit x86
    X86_64,
}

impl Arch {
    /// Every supported architecture.
    pub const ALL: [Self; 2] = [Self::Aarch64, Self::X86_64];

    /// Build-system CPU family name (`aarch64` / `x86_64`).
    ///
    /// This is the spelling used for the per-architecture directories in
    /// a bdist.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::X86_64 => "x86_64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
