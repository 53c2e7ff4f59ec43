//! # Version Registry
//!
//! One strategy deployment per version: tag, description, frozen
//! configuration snapshot and a contiguous activity interval. Exactly one
//! version is active at any instant; retiring the current version and
//! activating the next is a single operation on the registry. "Active" is a
//! query over the interval (no end time yet), never a separate flag that
//! can drift out of sync.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SimConfig;
use crate::errors::{PerpArenaError, Result};

/// Stable identifier assigned at deploy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub u64);

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One strategy deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    /// Unique human-assigned tag, e.g. `"v1.0.2"`.
    pub tag: String,
    pub description: String,
    /// Configuration frozen for the lifetime of this version's activity.
    pub config: SimConfig,
    pub deployed_at: DateTime<Utc>,
    /// `None` while the version is active.
    pub retired_at: Option<DateTime<Utc>>,
}

impl Version {
    pub fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }

    /// Length of the activity interval, up to `now` while still active.
    pub fn active_duration(&self, now: DateTime<Utc>) -> Duration {
        self.retired_at.unwrap_or(now) - self.deployed_at
    }
}

/// Append-only registry of deployments with contiguous activity intervals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionRegistry {
    versions: Vec<Version>,
    next_id: u64,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire the active version (if any) and activate a new one in a
    /// single step: no gap, no overlap. The configuration is validated and
    /// then frozen into the version record.
    pub fn deploy(
        &mut self,
        tag: &str,
        description: &str,
        config: SimConfig,
        now: DateTime<Utc>,
    ) -> Result<VersionId> {
        config.validate()?;
        if self.versions.iter().any(|v| v.tag == tag) {
            return Err(PerpArenaError::DuplicateVersionTag(tag.to_string()));
        }

        if let Some(active) = self.versions.iter_mut().find(|v| v.is_active()) {
            active.retired_at = Some(now);
            info!(tag = %active.tag, "version retired");
        }

        let id = VersionId(self.next_id);
        self.next_id += 1;
        self.versions.push(Version {
            id,
            tag: tag.to_string(),
            description: description.to_string(),
            config,
            deployed_at: now,
            retired_at: None,
        });
        info!(%id, tag, "version deployed");
        Ok(id)
    }

    /// The currently active version, by interval query.
    pub fn active(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.is_active())
    }

    pub fn get(&self, id: VersionId) -> Option<&Version> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn by_tag(&self, tag: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.tag == tag)
    }

    /// All versions in deployment order.
    pub fn all(&self) -> &[Version] {
        &self.versions
    }
}
