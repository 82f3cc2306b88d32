use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleStatus {
    /// Payload is on disk but has not passed verification yet.
    Pending,
    Verified,
    Active,
    /// Was active and launched, then superseded by a newer activation.
    Retired,
    RolledBack,
    Corrupt,
}

impl BundleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Active => "active",
            Self::Retired => "retired",
            Self::RolledBack => "rolled-back",
            Self::Corrupt => "corrupt",
        }
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Records only move forward. The single way back to `Active` is a
    /// rollback restoring a retired last-known-good bundle. Nothing
    /// re-enters `Pending` or `Verified`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use BundleStatus::{Active, Corrupt, Pending, Retired, RolledBack, Verified};

        matches!(
            (self, next),
            (Pending, Verified | Corrupt)
                | (Verified, Active | Corrupt)
                | (Active, Retired | RolledBack | Corrupt)
                | (Retired, Active | Corrupt)
        ) || self == next
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub id: String,
    /// Resolved against the store root on load; never persisted.
    #[serde(skip)]
    pub file_path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub status: BundleStatus,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_count: u32,
}

impl BundleRecord {
    /// Ordering key for picking the newest candidate: download time, then id.
    #[must_use]
    pub fn recency_key(&self) -> (DateTime<Utc>, &str) {
        (self.downloaded_at, self.id.as_str())
    }
}

/// Remote descriptor of the latest available bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub checksum: String,
    #[serde(rename = "minAppVersion", default)]
    pub min_app_version: Option<String>,
}

/// Process-wide activation pointer, persisted as one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationState {
    #[serde(default)]
    pub active_bundle_id: Option<String>,
    #[serde(default)]
    pub last_known_good_id: Option<String>,
    /// Bundle handed to the host whose launch outcome has not been reported.
    #[serde(default)]
    pub pending_launch_id: Option<String>,
    /// Ids that were rolled back, oldest first.
    #[serde(default)]
    pub blocked_ids: Vec<String>,
}

impl ActivationState {
    #[must_use]
    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocked_ids.iter().any(|blocked| blocked == id)
    }

    pub fn block(&mut self, id: &str, limit: usize) {
        if self.is_blocked(id) {
            return;
        }
        self.blocked_ids.push(id.to_string());
        if self.blocked_ids.len() > limit {
            let excess = self.blocked_ids.len() - limit;
            self.blocked_ids.drain(..excess);
        }
    }
}
