use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reserved id of the bundle shipped inside the host application.
pub const BUILTIN_BUNDLE_ID: &str = "builtin";

/// Entry point every bundle directory must contain to be considered present.
pub const BUNDLE_ENTRY_POINT: &str = "index.html";

const BUNDLE_ID_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Pending,
    Downloading,
    Success,
    Error,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Allowed forward transitions of the download state machine.
    pub fn can_transition_to(&self, next: BundleStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Downloading) => true,
            (Self::Downloading, Self::Success) => true,
            (Self::Pending | Self::Downloading, Self::Error) => true,
            // Manual failure marking and rollback demote a landed bundle.
            (Self::Success, Self::Error) => true,
            _ => false,
        }
    }
}

impl Display for BundleStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub downloaded: String,
    #[serde(default)]
    pub checksum: String,
    pub status: BundleStatus,
}

impl BundleInfo {
    pub fn builtin() -> Self {
        Self {
            id: BUILTIN_BUNDLE_ID.to_string(),
            version: BUILTIN_BUNDLE_ID.to_string(),
            downloaded: String::new(),
            checksum: String::new(),
            status: BundleStatus::Success,
        }
    }

    pub fn pending(version: &str) -> Self {
        Self {
            id: generate_bundle_id(),
            version: version.trim().to_string(),
            downloaded: String::new(),
            checksum: String::new(),
            status: BundleStatus::Pending,
        }
    }

    pub fn is_builtin(&self) -> bool {
        is_builtin_id(&self.id)
    }

    pub fn mark_downloaded(&mut self, checksum: String) {
        self.checksum = checksum;
        self.downloaded = Utc::now().to_rfc3339();
        self.status = BundleStatus::Success;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUpdate {
    pub bundle: BundleInfo,
    pub failed_at: String,
}

impl FailedUpdate {
    pub fn new(bundle: BundleInfo) -> Self {
        Self {
            bundle,
            failed_at: Utc::now().to_rfc3339(),
        }
    }
}

pub fn is_builtin_id(id: &str) -> bool {
    id.trim() == BUILTIN_BUNDLE_ID
}

pub fn generate_bundle_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BUNDLE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Bundle ids become directory names, so only a conservative charset passes.
pub fn is_valid_bundle_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// On-disk layout of downloaded bundles and the builtin location.
#[derive(Debug, Clone)]
pub struct BundleLayout {
    bundles_dir: PathBuf,
    builtin_dir: PathBuf,
}

impl BundleLayout {
    pub fn new(bundles_dir: impl AsRef<Path>, builtin_dir: impl AsRef<Path>) -> Self {
        Self {
            bundles_dir: bundles_dir.as_ref().to_path_buf(),
            builtin_dir: builtin_dir.as_ref().to_path_buf(),
        }
    }

    pub fn bundles_dir(&self) -> &Path {
        &self.bundles_dir
    }

    pub fn builtin_dir(&self) -> &Path {
        &self.builtin_dir
    }

    pub fn bundle_dir(&self, id: &str) -> PathBuf {
        if is_builtin_id(id) {
            return self.builtin_dir.clone();
        }
        self.bundles_dir.join(id)
    }

    pub fn entry_point(&self, id: &str) -> PathBuf {
        self.bundle_dir(id).join(BUNDLE_ENTRY_POINT)
    }

    pub fn files_present(&self, id: &str) -> bool {
        if is_builtin_id(id) {
            return true;
        }
        self.entry_point(id).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_bundle_id, is_valid_bundle_id, BundleLayout, BundleStatus};

    #[test]
    fn generated_ids_are_valid_directory_names() {
        let id = generate_bundle_id();
        assert_eq!(id.len(), 10);
        assert!(is_valid_bundle_id(&id));
        assert!(!is_valid_bundle_id("../escape"));
        assert!(!is_valid_bundle_id(""));
    }

    #[test]
    fn terminal_states_only_allow_demotion() {
        assert!(BundleStatus::Pending.can_transition_to(BundleStatus::Downloading));
        assert!(BundleStatus::Downloading.can_transition_to(BundleStatus::Error));
        assert!(BundleStatus::Success.can_transition_to(BundleStatus::Error));
        assert!(!BundleStatus::Error.can_transition_to(BundleStatus::Success));
        assert!(!BundleStatus::Pending.can_transition_to(BundleStatus::Success));
    }

    #[test]
    fn builtin_resolves_outside_bundles_dir() {
        let layout = BundleLayout::new("/data/bundles", "/app/public");
        assert_eq!(
            layout.bundle_dir("builtin"),
            std::path::PathBuf::from("/app/public")
        );
        assert_eq!(
            layout.bundle_dir("abc123"),
            std::path::PathBuf::from("/data/bundles/abc123")
        );
        assert!(layout.files_present("builtin"));
    }
}
