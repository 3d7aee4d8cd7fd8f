// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Access configuration consumed when opening a container: access flags,
//! file-locking behaviour, and the link-access properties used while
//! following external links.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, Result};

/// Hop limit applied when no link-access properties set one.
pub const DEFAULT_NLINKS: u32 = 16;

bitflags! {
    /// Container open flags. Read-only is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const RDWR = 0x0001;
        const SWMR_WRITE = 0x0020;
        const SWMR_READ = 0x0040;
    }
}

impl AccessFlags {
    pub const RDONLY: Self = Self::empty();

    pub fn is_writable(self) -> bool {
        self.contains(Self::RDWR)
    }

    pub fn is_swmr(self) -> bool {
        self.intersects(Self::SWMR_READ | Self::SWMR_WRITE)
    }

    pub fn mode(self) -> AccessMode {
        if self.is_writable() {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        }
    }

    /// SWMR writers must be writable and SWMR readers must not be.
    pub(crate) fn validate(self) -> Result<()> {
        if self.contains(Self::SWMR_WRITE) && !self.is_writable() {
            return Err(ChunkError::Config(
                "SWMR_WRITE requires read-write access".into(),
            ));
        }
        if self.contains(Self::SWMR_READ) && self.is_writable() {
            return Err(ChunkError::Config(
                "SWMR_READ requires read-only access".into(),
            ));
        }
        Ok(())
    }
}

/// Container access mode, spelled `"r"` or `"r+"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "r",
            AccessMode::ReadWrite => "r+",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(AccessMode::ReadOnly),
            "r+" => Ok(AccessMode::ReadWrite),
            other => Err(ChunkError::Config(format!(
                "Unsupported link access mode: {other:?}"
            ))),
        }
    }
}

impl TryFrom<String> for AccessMode {
    type Error = ChunkError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AccessMode> for String {
    fn from(mode: AccessMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Advisory file-locking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLocking {
    pub use_file_locking: bool,
    /// Carry on without a lock when it cannot be acquired.
    pub ignore_when_disabled: bool,
}

impl Default for FileLocking {
    fn default() -> Self {
        Self { use_file_locking: true, ignore_when_disabled: false }
    }
}

/// File-access configuration of an open container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAccess {
    locking: FileLocking,
}

impl FileAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_locking(&self) -> FileLocking {
        self.locking
    }

    pub fn set_file_locking(&mut self, use_file_locking: bool, ignore_when_disabled: bool) {
        self.locking = FileLocking { use_file_locking, ignore_when_disabled };
    }
}

/// Properties applied while traversing an external link.
///
/// Unset properties fall back to the referencing container's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkAccessProps {
    elink_fapl: Option<FileAccess>,
    elink_acc_flags: Option<AccessFlags>,
    elink_prefix: Option<String>,
    nlinks: Option<u32>,
}

impl LinkAccessProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_elink_fapl(&mut self, fapl: FileAccess) {
        self.elink_fapl = Some(fapl);
    }

    pub fn set_elink_acc_flags(&mut self, flags: AccessFlags) {
        self.elink_acc_flags = Some(flags);
    }

    pub fn set_elink_prefix(&mut self, prefix: &str) {
        self.elink_prefix = Some(prefix.to_string());
    }

    pub fn set_nlinks(&mut self, nlinks: u32) {
        self.nlinks = Some(nlinks);
    }

    pub fn elink_fapl(&self) -> Option<&FileAccess> {
        self.elink_fapl.as_ref()
    }

    pub fn elink_acc_flags(&self) -> Option<AccessFlags> {
        self.elink_acc_flags
    }

    pub fn elink_prefix(&self) -> Option<&str> {
        self.elink_prefix.as_deref()
    }

    pub fn nlinks(&self) -> Option<u32> {
        self.nlinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_consistency() {
        assert!((AccessFlags::RDONLY | AccessFlags::SWMR_READ).validate().is_ok());
        assert!((AccessFlags::RDWR | AccessFlags::SWMR_WRITE).validate().is_ok());
        assert!(AccessFlags::SWMR_WRITE.validate().is_err());
        assert!((AccessFlags::RDWR | AccessFlags::SWMR_READ).validate().is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("r".parse::<AccessMode>().unwrap(), AccessMode::ReadOnly);
        assert_eq!("r+".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
        assert!(matches!("w".parse::<AccessMode>(), Err(ChunkError::Config(_))));
    }
}
