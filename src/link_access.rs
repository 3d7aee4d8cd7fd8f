// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Link-access policy: how an external link opens the container it points to.
//!
//! A policy is either [`LinkAccess::NoPolicy`] (the engine applies its own
//! defaults and inherits everything from the referencing container) or a set
//! of explicitly chosen fields. Resolving a policy against the referencing
//! container yields the [`LinkAccessProps`] the engine consumes; only the
//! sub-configurations whose fields were set are materialised.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChunkError, Result};
use crate::storage::access::{AccessFlags, AccessMode, LinkAccessProps};
use crate::storage::container::Container;
use crate::storage::dataset::Dataset;

/// Advisory locking requested for the externally referenced container.
///
/// Parsed from `true`/`"true"`, `false`/`"false"` or `"best-effort"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LockingRepr", into = "LockingRepr")]
pub enum Locking {
    /// No lock is taken.
    Disabled,
    /// A lock is taken and failing to acquire it fails the open.
    Required,
    /// A lock is attempted; failing to acquire it is tolerated.
    BestEffort,
}

impl Locking {
    /// `(use_file_locking, ignore_when_disabled)` for the file-access config.
    pub fn file_locking(self) -> (bool, bool) {
        match self {
            Locking::Disabled => (false, false),
            Locking::Required => (true, false),
            Locking::BestEffort => (true, true),
        }
    }
}

impl From<bool> for Locking {
    fn from(enabled: bool) -> Self {
        if enabled {
            Locking::Required
        } else {
            Locking::Disabled
        }
    }
}

impl FromStr for Locking {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "true" => Ok(Locking::Required),
            "false" => Ok(Locking::Disabled),
            "best-effort" => Ok(Locking::BestEffort),
            other => Err(ChunkError::Config(format!(
                "Unsupported link access locking: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Locking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Locking::Disabled => "false",
            Locking::Required => "true",
            Locking::BestEffort => "best-effort",
        })
    }
}

/// Wire form accepting either a TOML/JSON boolean or a string.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LockingRepr {
    Flag(bool),
    Text(String),
}

impl TryFrom<LockingRepr> for Locking {
    type Error = ChunkError;

    fn try_from(repr: LockingRepr) -> Result<Self> {
        match repr {
            LockingRepr::Flag(b) => Ok(b.into()),
            LockingRepr::Text(s) => s.parse(),
        }
    }
}

impl From<Locking> for LockingRepr {
    fn from(locking: Locking) -> Self {
        match locking {
            Locking::Disabled => LockingRepr::Flag(false),
            Locking::Required => LockingRepr::Flag(true),
            Locking::BestEffort => LockingRepr::Text("best-effort".into()),
        }
    }
}

/// Individually optional policy fields. `None` means "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkAccessFields {
    pub locking: Option<Locking>,
    pub mode: Option<AccessMode>,
    pub swmr_mode: Option<bool>,
    /// Prepended to relative external-link targets.
    pub prefix: Option<String>,
    /// Maximum number of link hops to follow.
    pub nlinks: Option<u32>,
}

impl LinkAccessFields {
    pub fn is_unset(&self) -> bool {
        self.locking.is_none()
            && self.mode.is_none()
            && self.swmr_mode.is_none()
            && self.prefix.is_none()
            && self.nlinks.is_none()
    }

    /// Fields set in `changes` replace ours; the rest are kept.
    fn merged(self, changes: LinkAccessFields) -> Self {
        Self {
            locking: changes.locking.or(self.locking),
            mode: changes.mode.or(self.mode),
            swmr_mode: changes.swmr_mode.or(self.swmr_mode),
            prefix: changes.prefix.or(self.prefix),
            nlinks: changes.nlinks.or(self.nlinks),
        }
    }
}

/// A link-access policy. Built immutably: every update returns a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LinkAccess {
    #[default]
    NoPolicy,
    Policy(LinkAccessFields),
}

impl From<LinkAccessFields> for LinkAccess {
    fn from(fields: LinkAccessFields) -> Self {
        if fields.is_unset() {
            LinkAccess::NoPolicy
        } else {
            LinkAccess::Policy(fields)
        }
    }
}

impl LinkAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_no_policy(&self) -> bool {
        matches!(self, LinkAccess::NoPolicy)
    }

    /// Current field values; all unset for [`LinkAccess::NoPolicy`].
    pub fn fields(&self) -> LinkAccessFields {
        match self {
            LinkAccess::NoPolicy => LinkAccessFields::default(),
            LinkAccess::Policy(fields) => fields.clone(),
        }
    }

    pub fn update(&self, changes: LinkAccessFields) -> Self {
        self.fields().merged(changes).into()
    }

    pub fn with_locking(self, locking: Locking) -> Self {
        self.update(LinkAccessFields { locking: Some(locking), ..Default::default() })
    }

    pub fn with_mode(self, mode: AccessMode) -> Self {
        self.update(LinkAccessFields { mode: Some(mode), ..Default::default() })
    }

    pub fn with_swmr_mode(self, swmr_mode: bool) -> Self {
        self.update(LinkAccessFields { swmr_mode: Some(swmr_mode), ..Default::default() })
    }

    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        self.update(LinkAccessFields { prefix: Some(prefix.into()), ..Default::default() })
    }

    pub fn with_nlinks(self, nlinks: u32) -> Self {
        self.update(LinkAccessFields { nlinks: Some(nlinks), ..Default::default() })
    }

    /// Build the link-access properties for links followed from `container`.
    ///
    /// Returns `None` when no field is set.
    pub fn resolve(&self, container: &Container) -> Result<Option<LinkAccessProps>> {
        let fields = match self {
            LinkAccess::NoPolicy => return Ok(None),
            LinkAccess::Policy(fields) => fields,
        };
        let mut props = LinkAccessProps::new();

        if let Some(locking) = fields.locking {
            let mut fapl = container.access_config();
            let (use_file_locking, ignore_when_disabled) = locking.file_locking();
            fapl.set_file_locking(use_file_locking, ignore_when_disabled);
            props.set_elink_fapl(fapl);
        }

        if fields.mode.is_some() || fields.swmr_mode.is_some() {
            let mode = fields.mode.unwrap_or_else(|| container.mode());
            let swmr_mode = fields.swmr_mode.unwrap_or_else(|| container.swmr_mode());
            props.set_elink_acc_flags(access_flags(mode, swmr_mode));
        }

        if let Some(prefix) = &fields.prefix {
            props.set_elink_prefix(prefix);
        }

        if let Some(nlinks) = fields.nlinks {
            if nlinks == 0 {
                return Err(ChunkError::Config("nlinks must be a positive integer".into()));
            }
            props.set_nlinks(nlinks);
        }

        debug!(policy = ?fields, props = ?props, "Link access policy resolved");
        Ok(Some(props))
    }

    /// Resolve this policy against `container` and follow its external link `name`.
    pub fn open_external(&self, container: &Container, name: &str) -> Result<Dataset> {
        let props = self.resolve(container)?;
        container.open_external(name, props.as_ref())
    }
}

/// Open flags for an external container: `"r"` maps to read-only plus
/// `SWMR_READ`, `"r+"` to read-write plus `SWMR_WRITE`, the SWMR bit only
/// when `swmr_mode` is on.
pub fn access_flags(mode: AccessMode, swmr_mode: bool) -> AccessFlags {
    match mode {
        AccessMode::ReadOnly if swmr_mode => AccessFlags::RDONLY | AccessFlags::SWMR_READ,
        AccessMode::ReadOnly => AccessFlags::RDONLY,
        AccessMode::ReadWrite if swmr_mode => AccessFlags::RDWR | AccessFlags::SWMR_WRITE,
        AccessMode::ReadWrite => AccessFlags::RDWR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locking_spellings() {
        assert_eq!("true".parse::<Locking>().unwrap(), Locking::Required);
        assert_eq!("false".parse::<Locking>().unwrap(), Locking::Disabled);
        assert_eq!("best-effort".parse::<Locking>().unwrap(), Locking::BestEffort);
        assert!(matches!("sometimes".parse::<Locking>(), Err(ChunkError::Config(_))));
        assert!(matches!("True".parse::<Locking>(), Err(ChunkError::Config(_))));
    }

    #[test]
    fn test_update_keeps_unspecified_fields() {
        let base = LinkAccess::new().with_prefix("/data").with_nlinks(4);
        let next = base.update(LinkAccessFields { nlinks: Some(8), ..Default::default() });

        assert_eq!(base.fields().nlinks, Some(4));
        assert_eq!(next.fields().nlinks, Some(8));
        assert_eq!(next.fields().prefix.as_deref(), Some("/data"));
    }

    #[test]
    fn test_empty_update_stays_no_policy() {
        let policy = LinkAccess::new().update(LinkAccessFields::default());
        assert!(policy.is_no_policy());
    }

    #[test]
    fn test_access_flags_mapping() {
        assert_eq!(access_flags(AccessMode::ReadOnly, false), AccessFlags::RDONLY);
        assert_eq!(
            access_flags(AccessMode::ReadOnly, true),
            AccessFlags::SWMR_READ
        );
        assert_eq!(access_flags(AccessMode::ReadWrite, false), AccessFlags::RDWR);
        assert_eq!(
            access_flags(AccessMode::ReadWrite, true),
            AccessFlags::RDWR | AccessFlags::SWMR_WRITE
        );
    }
}
