use serde::{Deserialize, Serialize};

use crate::bundle::BundleInfo;
use crate::integrity::FileManifestEntry;

/// Body returned by the update server for a version check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCheckResponse {
    pub version: String,
    pub url: Option<String>,
    pub checksum: Option<String>,
    pub breaking: Option<bool>,
    /// Older servers flag breaking updates as `major`.
    pub major: Option<bool>,
    pub message: Option<String>,
    #[serde(rename = "session_key", alias = "sessionKey")]
    pub session_key: Option<String>,
    pub error: Option<String>,
    pub old: Option<String>,
    pub manifest: Option<Vec<FileManifestEntry>>,
}

/// What a download collaborator needs to fetch an offered update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub version: String,
    pub session_key: Option<String>,
    pub checksum: Option<String>,
    pub manifest: Option<Vec<FileManifestEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// The server reported an error; nothing is actionable.
    Rejected { error: String, message: Option<String> },
    UpToDate { version: String },
    Breaking { version: String, message: Option<String> },
    Available(DownloadRequest),
}

impl UpdateCheckResponse {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn is_breaking(&self) -> bool {
        self.breaking.unwrap_or(false) || self.major.unwrap_or(false)
    }

    pub fn classify(&self, current: &BundleInfo) -> UpdateDecision {
        if let Some(error) = self.error.as_deref().map(str::trim) {
            return UpdateDecision::Rejected {
                error: if error.is_empty() {
                    "unknown_error".to_string()
                } else {
                    error.to_string()
                },
                message: self.message.clone(),
            };
        }

        let version = self.version.trim().to_string();
        if self.is_breaking() {
            return UpdateDecision::Breaking {
                version,
                message: self.message.clone(),
            };
        }

        let url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());
        let has_manifest = self
            .manifest
            .as_ref()
            .is_some_and(|entries| !entries.is_empty());
        if version.is_empty()
            || version == current.version.trim()
            || (url.is_none() && !has_manifest)
        {
            return UpdateDecision::UpToDate { version };
        }

        UpdateDecision::Available(DownloadRequest {
            url: url.unwrap_or_default().to_string(),
            version,
            session_key: self
                .session_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string),
            checksum: self
                .checksum
                .as_deref()
                .map(str::trim)
                .filter(|checksum| !checksum.is_empty())
                .map(ToString::to_string),
            manifest: self.manifest.clone(),
        })
    }
}
