//! Shared naming and platform types for distpack.
//!
//! Nothing in this crate touches the filesystem; it only interprets names.

pub mod arch;
pub mod names;
pub mod system;

// Re-exports
pub use arch::*;
pub use names::*;
pub use system::*;

/// Leading bytes of a 64-bit little-endian Mach-O image (`MH_MAGIC_64`
/// stored little-endian: 0xFEEDFACF -> CF FA ED FE).
pub const MACHO_MAGIC_64: [u8; 4] = [0xCF, 0xFA, 0xED, 0xFE];
