use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

const TELEMETRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Activate,
    ApplyPending,
    Confirm,
    Rollback,
    Reset,
    Delete,
    Download,
    Cleanup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub timestamp: String,
    pub action: LifecycleAction,
    pub bundle_id: Option<String>,
    pub status: String,
    pub error_kind: Option<String>,
    pub detail: Option<String>,
}

impl LifecycleRecord {
    pub fn ok(action: LifecycleAction, bundle_id: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            action,
            bundle_id: bundle_id.map(ToString::to_string),
            status: "ok".to_string(),
            error_kind: None,
            detail: None,
        }
    }

    pub fn failed(
        action: LifecycleAction,
        bundle_id: Option<&str>,
        error_kind: &str,
        detail: String,
    ) -> Self {
        Self {
            status: "error".to_string(),
            error_kind: Some(error_kind.to_string()),
            detail: Some(detail),
            ..Self::ok(action, bundle_id)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    pub schema_version: u32,
    pub updated_at: String,
    pub activations: u64,
    pub confirmations: u64,
    pub rollbacks: u64,
    pub deletions: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub integrity_failures: u64,
    pub errors: u64,
    pub last_action: Option<LifecycleRecord>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            activations: 0,
            confirmations: 0,
            rollbacks: 0,
            deletions: 0,
            downloads_completed: 0,
            downloads_failed: 0,
            integrity_failures: 0,
            errors: 0,
            last_action: None,
        }
    }
}

/// Local JSON snapshot of lifecycle outcomes, rewritten after every record.
pub struct TelemetryStore {
    path: PathBuf,
    snapshot: TelemetrySnapshot,
}

impl TelemetryStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load_snapshot(&path)?;
        Ok(Self { path, snapshot })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    pub fn record(&mut self, record: LifecycleRecord) -> Result<()> {
        let snapshot = &mut self.snapshot;
        snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
        snapshot.updated_at = Utc::now().to_rfc3339();

        if record.is_ok() {
            let counter = match record.action {
                LifecycleAction::Activate | LifecycleAction::ApplyPending => {
                    Some(&mut snapshot.activations)
                }
                LifecycleAction::Confirm => Some(&mut snapshot.confirmations),
                LifecycleAction::Rollback => Some(&mut snapshot.rollbacks),
                LifecycleAction::Delete => Some(&mut snapshot.deletions),
                LifecycleAction::Download => Some(&mut snapshot.downloads_completed),
                LifecycleAction::Reset | LifecycleAction::Cleanup => None,
            };
            if let Some(counter) = counter {
                *counter = counter.saturating_add(1);
            }
        } else {
            snapshot.errors = snapshot.errors.saturating_add(1);
            if record.action == LifecycleAction::Download {
                snapshot.downloads_failed = snapshot.downloads_failed.saturating_add(1);
            }
            if record.error_kind.as_deref() == Some("integrity_failure") {
                snapshot.integrity_failures = snapshot.integrity_failures.saturating_add(1);
            }
        }

        snapshot.last_action = Some(record);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating telemetry dir {}", parent.display()))?;
        }

        let payload = serde_json::to_string_pretty(&self.snapshot)
            .context("failed encoding telemetry snapshot")?;
        let tmp_path = self.path.with_extension("tmp");

        fs::write(&tmp_path, payload).with_context(|| {
            format!(
                "failed writing temporary telemetry file {}",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed moving telemetry snapshot {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<TelemetrySnapshot> {
    if !path.exists() {
        return Ok(TelemetrySnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading telemetry file {}", path.display()))?;
    let mut snapshot: TelemetrySnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding telemetry file {}", path.display()))?;

    if snapshot.schema_version == 0 {
        snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
    }
    if snapshot.updated_at.trim().is_empty() {
        snapshot.updated_at = Utc::now().to_rfc3339();
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::{LifecycleAction, LifecycleRecord, TelemetryStore};

    #[test]
    fn records_count_by_action_and_survive_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("telemetry").join("latest.json");
        let mut telemetry = TelemetryStore::new(&path).expect("telemetry");

        telemetry
            .record(LifecycleRecord::ok(LifecycleAction::Activate, Some("abc")))
            .expect("activate");
        telemetry
            .record(LifecycleRecord::ok(LifecycleAction::Rollback, Some("abc")))
            .expect("rollback");
        telemetry
            .record(LifecycleRecord::failed(
                LifecycleAction::Download,
                Some("def"),
                "integrity_failure",
                "checksum mismatch".to_string(),
            ))
            .expect("download failure");

        let reloaded = TelemetryStore::new(&path).expect("reload").snapshot();
        assert_eq!(reloaded.activations, 1);
        assert_eq!(reloaded.rollbacks, 1);
        assert_eq!(reloaded.downloads_failed, 1);
        assert_eq!(reloaded.integrity_failures, 1);
        assert_eq!(reloaded.errors, 1);
        let last = reloaded.last_action.expect("last action");
        assert_eq!(last.action, LifecycleAction::Download);
        assert_eq!(last.bundle_id.as_deref(), Some("def"));
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("latest.json");
        std::fs::write(&path, "nope").expect("write");
        assert!(TelemetryStore::new(&path).is_err());
    }
}
