use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::bundle::{
    is_builtin_id, is_valid_bundle_id, BundleInfo, BundleLayout, BundleStatus, FailedUpdate,
    BUILTIN_BUNDLE_ID,
};
use crate::delay::{DelayCondition, DelayGate};
use crate::error::{BundleError, BundleResult};
use crate::events::{EventBus, UpdaterEvent};
use crate::integrity::{
    normalize_checksum, verify_file_manifest, BundleVerifier, ChecksumVerifier, FileManifestEntry,
    SessionDecryptor,
};
use crate::observability;
use crate::store::{EndpointOverrides, LoadedStore, Manifest};
use crate::watchdog::ReadinessTarget;

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub auto_delete_previous: bool,
    pub auto_delete_failed: bool,
    pub allow_manual_bundle_error: bool,
    pub allow_modify_url: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            auto_delete_previous: true,
            auto_delete_failed: true,
            allow_manual_bundle_error: false,
            allow_modify_url: false,
        }
    }
}

/// Metadata handed over by the fetch collaborator once files are extracted.
#[derive(Debug, Clone, Default)]
pub struct DownloadArtifacts {
    pub checksum: Option<String>,
    pub session_key: Option<String>,
    pub file_manifest: Option<Vec<FileManifestEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub bundle: BundleInfo,
    pub previous_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub swapped: bool,
    pub deferred: bool,
    pub current: BundleInfo,
    pub previous_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub rolled_back: bool,
    pub failed: Option<BundleInfo>,
    pub current: BundleInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_failed: Vec<String>,
    pub removed_orphans: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Update,
    Stats,
    Channel,
    AppId,
}

/// Owns the manifest and every bundle status transition.
///
/// Each operation holds the store lock for its whole read-modify-persist
/// sequence, so concurrent callers are serialized.
pub struct BundleManager {
    store: Mutex<LoadedStore>,
    layout: BundleLayout,
    verifier: Arc<dyn BundleVerifier>,
    decryptor: SessionDecryptor,
    policy: LifecyclePolicy,
    events: Arc<EventBus>,
    default_channel: Option<String>,
}

impl BundleManager {
    pub fn new(store: LoadedStore, layout: BundleLayout) -> BundleResult<Self> {
        fs::create_dir_all(layout.bundles_dir()).map_err(|err| {
            BundleError::io(
                format!("failed creating {}", layout.bundles_dir().display()),
                err,
            )
        })?;
        Ok(Self {
            store: Mutex::new(store),
            layout,
            verifier: Arc::new(ChecksumVerifier::default()),
            decryptor: SessionDecryptor::default(),
            policy: LifecyclePolicy::default(),
            events: Arc::new(EventBus::default()),
            default_channel: None,
        })
    }

    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn BundleVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_decryptor(mut self, decryptor: SessionDecryptor) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_default_channel(mut self, channel: Option<String>) -> Self {
        self.default_channel = channel.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    pub async fn manifest(&self) -> Manifest {
        self.store.lock().await.manifest().clone()
    }

    pub async fn current(&self) -> BundleInfo {
        self.store.lock().await.manifest().current()
    }

    pub async fn get(&self, id: &str) -> BundleResult<BundleInfo> {
        self.store
            .lock()
            .await
            .manifest()
            .bundle(id)
            .ok_or_else(|| BundleError::not_found(id))
    }

    pub async fn next_bundle(&self) -> Option<BundleInfo> {
        let store = self.store.lock().await;
        store
            .manifest()
            .next_bundle_id
            .as_deref()
            .and_then(|id| store.manifest().bundle(id))
    }

    /// Builtin first, then stored bundles. Unless `raw`, entries whose files
    /// are gone from disk are hidden (but kept in the manifest).
    pub async fn list(&self, raw: bool) -> Vec<BundleInfo> {
        let store = self.store.lock().await;
        let mut bundles = vec![BundleInfo::builtin()];
        bundles.extend(
            store
                .manifest()
                .bundles
                .values()
                .filter(|bundle| raw || self.layout.files_present(&bundle.id))
                .cloned(),
        );
        bundles
    }

    #[instrument(skip(self))]
    pub async fn next(&self, id: &str) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        let bundle = self.activatable(&store, id)?;
        if !bundle.is_builtin() {
            self.verify_bundle(&bundle).await?;
        }
        store.commit(|manifest| manifest.next_bundle_id = Some(bundle.id.clone()))?;
        info!(bundle_id = %bundle.id, version = %bundle.version, "bundle queued for next launch");
        Ok(bundle)
    }

    #[instrument(skip(self))]
    pub async fn set(&self, id: &str) -> BundleResult<Activation> {
        let mut store = self.store.lock().await;
        let bundle = self.activatable(&store, id)?;
        if !bundle.is_builtin() {
            self.verify_bundle(&bundle).await?;
        }

        let previous_id = store.manifest().current_bundle_id.clone();
        store.commit(|manifest| {
            manifest.current_bundle_id = bundle.id.clone();
            manifest.next_bundle_id = None;
        })?;
        info!(bundle_id = %bundle.id, previous = %previous_id, "bundle activated");
        observability::record_activation("set");

        if self.policy.auto_delete_previous && previous_id != bundle.id {
            self.best_effort_delete(&mut store, &previous_id, "auto_delete_previous");
        }
        self.events.publish(UpdaterEvent::AppReloaded {});

        Ok(Activation {
            bundle,
            previous_id,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_bundle(&self, id: &str) -> BundleResult<()> {
        let mut store = self.store.lock().await;
        self.delete_locked(&mut store, id)?;
        info!(bundle_id = %id, "bundle deleted");
        Ok(())
    }

    pub async fn set_bundle_error(&self, id: &str) -> BundleResult<BundleInfo> {
        if !self.policy.allow_manual_bundle_error {
            return Err(BundleError::PermissionDenied {
                operation: "set_bundle_error",
            });
        }
        let mut store = self.store.lock().await;
        if is_builtin_id(id) {
            return Err(BundleError::invalid_state(id, "builtin bundle cannot fail"));
        }
        let mut bundle = store
            .manifest()
            .bundles
            .get(id)
            .cloned()
            .ok_or_else(|| BundleError::not_found(id))?;
        bundle.status = BundleStatus::Error;
        store.commit(|manifest| {
            if let Some(stored) = manifest.bundles.get_mut(id) {
                stored.status = BundleStatus::Error;
            }
            // next must always point at a success bundle
            if manifest.next_bundle_id.as_deref() == Some(id) {
                manifest.next_bundle_id = None;
            }
        })?;
        warn!(bundle_id = %id, "bundle manually marked as failed");

        if self.policy.auto_delete_failed && !self.is_pinned(store.manifest(), id) {
            self.best_effort_delete(&mut store, id, "auto_delete_failed");
        }
        Ok(bundle)
    }

    /// Returns the last failed update once, then forgets it.
    pub async fn get_failed_update(&self) -> BundleResult<Option<FailedUpdate>> {
        let mut store = self.store.lock().await;
        let failed = store.manifest().failed_update.clone();
        if failed.is_some() {
            store.commit(|manifest| manifest.failed_update = None)?;
        }
        Ok(failed)
    }

    pub async fn reset(&self, to_last_successful: bool) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        let target = if to_last_successful {
            self.rollback_target(store.manifest(), None)
        } else {
            BUILTIN_BUNDLE_ID.to_string()
        };
        store.commit(|manifest| {
            manifest.current_bundle_id = target.clone();
            manifest.next_bundle_id = None;
        })?;
        info!(bundle_id = %target, to_last_successful, "bundle reset");
        self.events.publish(UpdaterEvent::AppReloaded {});
        Ok(store.manifest().current())
    }

    /// Start-up activation of the queued bundle, gated by `gate`.
    #[instrument(skip(self, gate))]
    pub async fn apply_pending_update(&self, gate: &DelayGate) -> BundleResult<ApplyOutcome> {
        let mut store = self.store.lock().await;
        let manifest = store.manifest();
        let idle = ApplyOutcome {
            swapped: false,
            deferred: false,
            current: manifest.current(),
            previous_id: None,
        };
        let Some(next_id) = manifest.next_bundle_id.clone() else {
            return Ok(idle);
        };
        if next_id == manifest.current_bundle_id {
            return Ok(idle);
        }
        if !gate.is_satisfied(&manifest.delay_conditions) {
            info!(bundle_id = %next_id, "pending update deferred by delay conditions");
            return Ok(ApplyOutcome {
                deferred: true,
                ..idle
            });
        }

        let candidate = manifest.bundle(&next_id);
        let verdict = match candidate.as_ref() {
            None => Err(BundleError::not_found(&next_id)),
            Some(bundle) if bundle.status != BundleStatus::Success => {
                Err(BundleError::invalid_state(
                    &next_id,
                    format!("status is {}", bundle.status),
                ))
            }
            Some(bundle) if bundle.is_builtin() => Ok(()),
            Some(bundle) => self.verify_bundle(bundle).await,
        };
        if let Err(err) = verdict {
            warn!(bundle_id = %next_id, error = %err, "pending update failed verification, not activating");
            store.commit(|manifest| {
                if let Some(stored) = manifest.bundles.get_mut(&next_id) {
                    stored.status = BundleStatus::Error;
                }
                manifest.next_bundle_id = None;
            })?;
            return Ok(ApplyOutcome {
                current: store.manifest().current(),
                ..idle
            });
        }

        let previous_id = store.manifest().current_bundle_id.clone();
        store.commit(|manifest| {
            manifest.current_bundle_id = next_id.clone();
            manifest.next_bundle_id = None;
            manifest.delay_conditions.clear();
        })?;
        info!(bundle_id = %next_id, previous = %previous_id, "pending update applied");
        observability::record_activation("pending");

        if self.policy.auto_delete_previous {
            self.best_effort_delete(&mut store, &previous_id, "auto_delete_previous");
        }

        Ok(ApplyOutcome {
            swapped: true,
            deferred: false,
            current: store.manifest().current(),
            previous_id: Some(previous_id),
        })
    }

    pub async fn mark_bundle_successful(&self) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        let current = store.manifest().current();
        if !current.is_builtin() {
            store.commit(|manifest| {
                manifest.last_successful_bundle_id = Some(current.id.clone())
            })?;
            info!(bundle_id = %current.id, "bundle confirmed healthy");
        }
        Ok(current)
    }

    /// Demotes the current bundle and returns to the last known-good one.
    ///
    /// Only a failure to persist the manifest is reported; file cleanup is
    /// best effort.
    #[instrument(skip(self))]
    pub async fn rollback(&self) -> BundleResult<RollbackReport> {
        let mut store = self.store.lock().await;
        let current = store.manifest().current();
        if current.is_builtin() {
            return Ok(RollbackReport {
                rolled_back: false,
                failed: None,
                current,
            });
        }

        let failed = BundleInfo {
            status: BundleStatus::Error,
            ..current
        };
        let target = self.rollback_target(store.manifest(), Some(&failed.id));
        store.commit(|manifest| {
            if let Some(stored) = manifest.bundles.get_mut(&failed.id) {
                stored.status = BundleStatus::Error;
            }
            if manifest.last_successful_bundle_id.as_deref() == Some(failed.id.as_str()) {
                manifest.last_successful_bundle_id = None;
            }
            manifest.failed_update = Some(FailedUpdate::new(failed.clone()));
            manifest.current_bundle_id = target.clone();
            manifest.next_bundle_id = None;
        })?;
        warn!(failed = %failed.id, restored = %target, "rolled back failed bundle");
        observability::record_rollback("readiness_timeout");
        self.events.publish(UpdaterEvent::UpdateFailed {
            bundle: failed.clone(),
        });

        if self.policy.auto_delete_failed {
            self.best_effort_delete(&mut store, &failed.id, "auto_delete_failed");
        }

        Ok(RollbackReport {
            rolled_back: true,
            failed: Some(failed),
            current: store.manifest().current(),
        })
    }

    /// Best effort: removes failed bundles (when enabled) and bundle
    /// directories with no manifest entry. Never fails.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut store = self.store.lock().await;
        let mut report = CleanupReport::default();

        if self.policy.auto_delete_failed {
            let failed = store
                .manifest()
                .bundles
                .values()
                .filter(|bundle| bundle.status == BundleStatus::Error)
                .filter(|bundle| !self.is_pinned(store.manifest(), &bundle.id))
                .map(|bundle| bundle.id.clone())
                .collect::<Vec<_>>();
            for id in failed {
                if self.best_effort_delete(&mut store, &id, "cleanup") {
                    report.deleted_failed.push(id);
                }
            }
        }

        let known = store
            .manifest()
            .bundles
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>();
        let entries = match fs::read_dir(self.layout.bundles_dir()) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.layout.bundles_dir().display(), error = %err, "cleanup could not list bundles dir");
                return report;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if known.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(dir = %path.display(), "removed orphaned bundle directory");
                    report.removed_orphans.push(name);
                }
                Err(err) => {
                    warn!(dir = %path.display(), error = %err, "failed removing orphaned bundle directory");
                }
            }
        }
        report.removed_orphans.sort();
        report
    }

    /// Registers a new `pending` bundle and creates its directory.
    pub async fn stage_download(&self, version: &str) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        let bundle = BundleInfo::pending(version);
        let dir = self.layout.bundle_dir(&bundle.id);
        fs::create_dir_all(&dir).map_err(|err| {
            BundleError::io(format!("failed creating bundle dir {}", dir.display()), err)
        })?;
        store.commit(|manifest| {
            manifest.bundles.insert(bundle.id.clone(), bundle.clone());
        })?;
        Ok(bundle)
    }

    pub async fn mark_downloading(&self, id: &str) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        self.transition(&mut store, id, BundleStatus::Downloading)
    }

    pub async fn report_download_progress(&self, id: &str, percent: u8) -> BundleResult<()> {
        let bundle = self.get(id).await?;
        self.events.publish(UpdaterEvent::Download {
            percent: percent.min(100),
            bundle,
        });
        Ok(())
    }

    /// Lands a downloaded bundle in `success` or `error` after verification.
    #[instrument(skip(self, artifacts))]
    pub async fn complete_download(
        &self,
        id: &str,
        artifacts: DownloadArtifacts,
    ) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        let bundle = store
            .manifest()
            .bundles
            .get(id)
            .cloned()
            .ok_or_else(|| BundleError::not_found(id))?;
        if !bundle.status.can_transition_to(BundleStatus::Success) {
            return Err(BundleError::invalid_state(
                id,
                format!("cannot complete a download in status {}", bundle.status),
            ));
        }

        let verdict = match self.resolve_checksum(&artifacts) {
            Ok(checksum) => {
                let mut candidate = bundle.clone();
                candidate.mark_downloaded(checksum);
                let manifest_check = artifacts
                    .file_manifest
                    .as_deref()
                    .map(|entries| verify_file_manifest(&self.layout.bundle_dir(id), entries))
                    .unwrap_or(Ok(()))
                    .map_err(|reason| BundleError::integrity(id, reason));
                match manifest_check {
                    Ok(()) => {
                        let verified = self.verify_bundle(&candidate).await;
                        verified.map(|_| candidate)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(reason) => Err(BundleError::integrity(id, reason)),
        };

        match verdict {
            Ok(landed) => {
                store.commit(|manifest| {
                    manifest.bundles.insert(landed.id.clone(), landed.clone());
                })?;
                info!(bundle_id = %landed.id, version = %landed.version, "bundle download verified");
                self.events.publish(UpdaterEvent::DownloadComplete {
                    bundle: landed.clone(),
                });
                self.events.publish(UpdaterEvent::UpdateAvailable {
                    bundle: landed.clone(),
                });
                Ok(landed)
            }
            Err(err) => {
                store.commit(|manifest| {
                    if let Some(stored) = manifest.bundles.get_mut(id) {
                        stored.status = BundleStatus::Error;
                    }
                })?;
                warn!(bundle_id = %id, error = %err, "bundle download rejected");
                self.events.publish(UpdaterEvent::DownloadFailed {
                    version: bundle.version.clone(),
                });
                if self.policy.auto_delete_failed {
                    self.best_effort_delete(&mut store, id, "auto_delete_failed");
                }
                Err(err)
            }
        }
    }

    pub async fn fail_download(&self, id: &str, reason: &str) -> BundleResult<BundleInfo> {
        let mut store = self.store.lock().await;
        let failed = self.transition(&mut store, id, BundleStatus::Error)?;
        warn!(bundle_id = %id, reason, "bundle download failed");
        self.events.publish(UpdaterEvent::DownloadFailed {
            version: failed.version.clone(),
        });
        Ok(failed)
    }

    /// Copies an already extracted tree into the bundles dir and registers it.
    pub async fn import_directory(
        &self,
        source: &Path,
        version: &str,
        checksum: Option<String>,
    ) -> BundleResult<BundleInfo> {
        let artifacts = DownloadArtifacts {
            checksum,
            ..DownloadArtifacts::default()
        };
        self.import_tree(source, version, artifacts).await
    }

    /// Imports a tree whose files are encrypted under `session_key`. Each file
    /// is decrypted while copying and the checksum is decrypted with the same key.
    pub async fn import_encrypted_directory(
        &self,
        source: &Path,
        version: &str,
        checksum: Option<String>,
        session_key: &str,
    ) -> BundleResult<BundleInfo> {
        let artifacts = DownloadArtifacts {
            checksum,
            session_key: Some(session_key.to_string()),
            ..DownloadArtifacts::default()
        };
        self.import_tree(source, version, artifacts).await
    }

    async fn import_tree(
        &self,
        source: &Path,
        version: &str,
        artifacts: DownloadArtifacts,
    ) -> BundleResult<BundleInfo> {
        if !source.is_dir() {
            return Err(BundleError::io(
                format!("bundle source {} is not a directory", source.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let staged = self.stage_download(version).await?;
        self.mark_downloading(&staged.id).await?;
        let destination = self.layout.bundle_dir(&staged.id);
        let copied = match artifacts.session_key.as_deref() {
            Some(session_key) => copy_dir_recursive(source, &destination, &|bytes| {
                self.decryptor
                    .decrypt_content(&bytes, session_key)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            }),
            None => copy_dir_recursive(source, &destination, &Ok),
        };
        if let Err(err) = copied {
            if err.kind() == io::ErrorKind::InvalidData {
                self.fail_download(&staged.id, "decrypt failed").await?;
                return Err(BundleError::integrity(
                    &staged.id,
                    format!("failed decrypting bundle content: {err}"),
                ));
            }
            self.fail_download(&staged.id, "copy failed").await?;
            return Err(BundleError::io(
                format!(
                    "failed copying {} -> {}",
                    source.display(),
                    destination.display()
                ),
                err,
            ));
        }
        self.complete_download(&staged.id, artifacts).await
    }

    pub async fn delay_conditions(&self) -> Vec<DelayCondition> {
        self.store.lock().await.manifest().delay_conditions.clone()
    }

    pub async fn set_delay_conditions(&self, conditions: Vec<DelayCondition>) -> BundleResult<()> {
        let mut store = self.store.lock().await;
        store.commit(|manifest| manifest.delay_conditions = conditions)
    }

    pub async fn cancel_delay(&self) -> BundleResult<()> {
        self.set_delay_conditions(Vec::new()).await
    }

    pub async fn device_id(&self) -> String {
        self.store.lock().await.device_id().to_string()
    }

    pub async fn custom_id(&self) -> Option<String> {
        self.store.lock().await.manifest().custom_id.clone()
    }

    pub async fn set_custom_id(&self, custom_id: Option<String>) -> BundleResult<()> {
        let custom_id = custom_id.filter(|value| !value.trim().is_empty());
        let mut store = self.store.lock().await;
        store.commit(|manifest| manifest.custom_id = custom_id)
    }

    /// Stored channel, falling back to the configured default.
    pub async fn channel(&self) -> Option<String> {
        self.store
            .lock()
            .await
            .manifest()
            .channel
            .clone()
            .or_else(|| self.default_channel.clone())
    }

    pub async fn set_channel(&self, channel: Option<String>) -> BundleResult<()> {
        let channel = channel.filter(|value| !value.trim().is_empty());
        let mut store = self.store.lock().await;
        store.commit(|manifest| manifest.channel = channel)
    }

    pub async fn endpoint_overrides(&self) -> EndpointOverrides {
        self.store.lock().await.endpoints().clone()
    }

    pub async fn set_endpoint(
        &self,
        kind: EndpointKind,
        value: Option<String>,
    ) -> BundleResult<()> {
        if !self.policy.allow_modify_url {
            return Err(BundleError::PermissionDenied {
                operation: "set_endpoint",
            });
        }
        let value = value.filter(|value| !value.trim().is_empty());
        let mut store = self.store.lock().await;
        store.commit_endpoints(|endpoints| match kind {
            EndpointKind::Update => endpoints.update_url = value,
            EndpointKind::Stats => endpoints.stats_url = value,
            EndpointKind::Channel => endpoints.channel_url = value,
            EndpointKind::AppId => endpoints.app_id = value,
        })
    }

    fn activatable(&self, store: &LoadedStore, id: &str) -> BundleResult<BundleInfo> {
        let bundle = store
            .manifest()
            .bundle(id)
            .ok_or_else(|| BundleError::not_found(id))?;
        if bundle.status != BundleStatus::Success {
            return Err(BundleError::invalid_state(
                id,
                format!("only success bundles can be activated, status is {}", bundle.status),
            ));
        }
        Ok(bundle)
    }

    async fn verify_bundle(&self, bundle: &BundleInfo) -> BundleResult<()> {
        let verifier = Arc::clone(&self.verifier);
        let dir = self.layout.bundle_dir(&bundle.id);
        let candidate = bundle.clone();
        let verdict =
            tokio::task::spawn_blocking(move || verifier.verify_integrity(&candidate, &dir))
                .await
            .map_err(|err| {
                BundleError::integrity(&bundle.id, format!("verification task failed: {err}"))
            })?;
        verdict.map_err(|reason| {
            observability::record_integrity_failure("verification");
            BundleError::integrity(&bundle.id, reason)
        })
    }

    fn resolve_checksum(&self, artifacts: &DownloadArtifacts) -> Result<String, String> {
        let Some(raw) = artifacts
            .checksum
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Ok(String::new());
        };
        match artifacts
            .session_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(session_key) => self
                .decryptor
                .decrypt_checksum(raw, session_key)
                .map_err(|err| format!("failed decrypting checksum: {err}")),
            None => normalize_checksum(raw)
                .ok_or_else(|| format!("checksum '{raw}' is not a SHA-256 hex digest")),
        }
    }

    fn transition(
        &self,
        store: &mut LoadedStore,
        id: &str,
        next: BundleStatus,
    ) -> BundleResult<BundleInfo> {
        let mut bundle = store
            .manifest()
            .bundles
            .get(id)
            .cloned()
            .ok_or_else(|| BundleError::not_found(id))?;
        if !bundle.status.can_transition_to(next) {
            return Err(BundleError::invalid_state(
                id,
                format!("cannot move from {} to {}", bundle.status, next),
            ));
        }
        bundle.status = next;
        store.commit(|manifest| {
            manifest.bundles.insert(bundle.id.clone(), bundle.clone());
        })?;
        Ok(bundle)
    }

    fn is_pinned(&self, manifest: &Manifest, id: &str) -> bool {
        manifest.current_bundle_id == id || manifest.next_bundle_id.as_deref() == Some(id)
    }

    /// Last successful bundle when it is still usable, otherwise builtin.
    fn rollback_target(&self, manifest: &Manifest, excluding: Option<&str>) -> String {
        manifest
            .last_successful_bundle_id
            .as_deref()
            .filter(|id| Some(*id) != excluding)
            .and_then(|id| manifest.bundle(id))
            .filter(|bundle| bundle.status == BundleStatus::Success)
            .filter(|bundle| self.layout.files_present(&bundle.id))
            .map(|bundle| bundle.id)
            .unwrap_or_else(|| BUILTIN_BUNDLE_ID.to_string())
    }

    fn delete_locked(&self, store: &mut LoadedStore, id: &str) -> BundleResult<()> {
        if is_builtin_id(id) {
            return Err(BundleError::invalid_state(id, "builtin bundle cannot be deleted"));
        }
        if self.is_pinned(store.manifest(), id) {
            return Err(BundleError::invalid_state(
                id,
                "bundle is current or queued as next",
            ));
        }
        if !store.manifest().bundles.contains_key(id) {
            return Err(BundleError::not_found(id));
        }

        if is_valid_bundle_id(id) {
            let dir = self.layout.bundle_dir(id);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|err| {
                    BundleError::io(format!("failed removing {}", dir.display()), err)
                })?;
            }
        }
        store.commit(|manifest| {
            manifest.bundles.remove(id);
            if manifest.last_successful_bundle_id.as_deref() == Some(id) {
                manifest.last_successful_bundle_id = None;
            }
        })
    }

    /// Deletes `id` and swallows any failure. Returns whether it was removed.
    fn best_effort_delete(&self, store: &mut LoadedStore, id: &str, reason: &str) -> bool {
        if is_builtin_id(id) {
            return false;
        }
        match self.delete_locked(store, id) {
            Ok(()) => {
                info!(bundle_id = %id, reason, "bundle removed");
                true
            }
            Err(err) => {
                warn!(bundle_id = %id, reason, error = %err, "best-effort bundle removal failed");
                false
            }
        }
    }
}

#[async_trait]
impl ReadinessTarget for BundleManager {
    async fn confirm_ready(&self) -> BundleResult<BundleInfo> {
        let bundle = self.mark_bundle_successful().await?;
        self.events.publish(UpdaterEvent::AppReady {
            bundle: bundle.clone(),
            status: "ok".to_string(),
        });
        Ok(bundle)
    }

    async fn rollback(&self) -> BundleResult<RollbackReport> {
        BundleManager::rollback(self).await
    }
}

fn copy_dir_recursive<F>(source: &Path, destination: &Path, decode: &F) -> io::Result<()>
where
    F: Fn(Vec<u8>) -> io::Result<Vec<u8>>,
{
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target, decode)?;
        } else if file_type.is_file() {
            fs::write(&target, decode(fs::read(entry.path())?)?)?;
        }
    }
    Ok(())
}
