use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::bundle::{BundleInfo, BundleLayout};
use crate::config::{DoctorReport, Settings};
use crate::delay::{DelayGate, RunMarker};
use crate::error::BundleResult;
use crate::events::{EventBus, UpdaterEvent};
use crate::integrity::{ChecksumVerifier, SessionDecryptor};
use crate::lifecycle::{Activation, ApplyOutcome, BundleManager, CleanupReport, RollbackReport};
use crate::observability::emit_event;
use crate::store::{AesGcmSealer, EndpointOverrides, ManifestStore, SecureStorage};
use crate::telemetry::{LifecycleAction, LifecycleRecord, TelemetryStore};
use crate::update_check::{UpdateCheckResponse, UpdateDecision};
use crate::watchdog::{FatalHandler, ReadinessTarget, ReadinessWatchdog, WatchdogState};

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub outcome: ApplyOutcome,
    pub watchdog_armed: bool,
    pub previous_run_unclean: bool,
}

/// Wires the manifest store, lifecycle manager, readiness watchdog, delay
/// gate, event queue and telemetry into one host-facing surface.
pub struct OtaApp {
    settings: Settings,
    manager: Arc<BundleManager>,
    events: Arc<EventBus>,
    watchdog: ReadinessWatchdog,
    gate: Mutex<DelayGate>,
    telemetry: Arc<Mutex<TelemetryStore>>,
    run_marker: Option<RunMarker>,
}

impl OtaApp {
    pub fn new(settings: Settings) -> Result<Self> {
        let sealer: Option<Arc<dyn SecureStorage>> = match settings.security.device_key.as_deref() {
            Some(raw) => Some(Arc::new(
                AesGcmSealer::from_base64(raw).context("invalid RUSTY_OTA_DEVICE_KEY")?,
            )),
            None => None,
        };
        let store = ManifestStore::new(settings.manifest_path())
            .with_secure_storage(sealer)
            .with_persist_policy(settings.persist_policy())
            .load();
        let decryptor = SessionDecryptor::new(settings.security.public_key.as_deref())
            .context("invalid RUSTY_OTA_PUBLIC_KEY")?;
        let events = Arc::new(EventBus::new(
            settings.events.capacity,
            settings.events.overflow,
        ));
        let layout = BundleLayout::new(settings.bundles_dir(), &settings.builtin_dir);
        let manager = Arc::new(
            BundleManager::new(store, layout)
                .context("failed preparing bundle storage")?
                .with_policy(settings.lifecycle_policy())
                .with_verifier(Arc::new(ChecksumVerifier::new(
                    settings.lifecycle.require_checksum,
                )))
                .with_decryptor(decryptor)
                .with_events(Arc::clone(&events))
                .with_default_channel(settings.device.default_channel.clone()),
        );

        let telemetry = Arc::new(Mutex::new(TelemetryStore::new(&settings.telemetry_file)?));
        let target = Arc::new(TrackedTarget {
            manager: Arc::clone(&manager),
            telemetry: Arc::clone(&telemetry),
        });
        let watchdog = ReadinessWatchdog::new(
            target,
            Duration::from_millis(settings.app_ready_timeout_ms),
        );
        let gate = DelayGate::new(&settings.host_version, &[], false);

        Ok(Self {
            settings,
            manager,
            events,
            watchdog,
            gate: Mutex::new(gate),
            telemetry,
            run_marker: None,
        })
    }

    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.watchdog = self.watchdog.with_fatal_handler(fatal);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn doctor(&self) -> DoctorReport {
        self.settings.doctor_report()
    }

    pub fn manager(&self) -> &Arc<BundleManager> {
        &self.manager
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<UpdaterEvent> {
        self.events.drain()
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.state()
    }

    /// Process start: detects an unclean previous run, applies the queued
    /// bundle when the delay gate allows it, and arms the readiness watchdog
    /// for any non-builtin bundle about to be served.
    pub async fn launch(&mut self) -> Result<LaunchReport> {
        let (marker, previous_run_unclean) = RunMarker::acquire(&self.settings.data_dir)?;
        self.run_marker = Some(marker);

        let conditions = self.manager.delay_conditions().await;
        let gate = DelayGate::new(&self.settings.host_version, &conditions, previous_run_unclean);
        *self.lock_gate() = gate.clone();

        let applied = self.manager.apply_pending_update(&gate).await;
        if let Ok(outcome) = applied.as_ref() {
            if outcome.swapped {
                self.record(LifecycleRecord::ok(
                    LifecycleAction::ApplyPending,
                    Some(&outcome.current.id),
                ));
            }
        } else {
            self.record_result(LifecycleAction::ApplyPending, None, &applied);
        }
        let outcome = applied.context("failed applying pending update")?;
        let watchdog_armed = self.arm_for(&outcome.current);

        emit_event(
            "launch",
            json!({
                "bundle_id": outcome.current.id,
                "swapped": outcome.swapped,
                "deferred": outcome.deferred,
                "watchdog_armed": watchdog_armed,
                "previous_run_unclean": previous_run_unclean,
            }),
        );

        Ok(LaunchReport {
            outcome,
            watchdog_armed,
            previous_run_unclean,
        })
    }

    /// Clean shutdown: stops the watchdog without rolling back and removes
    /// the run marker.
    pub fn shutdown(&mut self) {
        self.watchdog.disarm();
        self.run_marker = None;
    }

    pub async fn set_bundle(&self, id: &str) -> BundleResult<Activation> {
        let result = self.manager.set(id).await;
        self.record_result(LifecycleAction::Activate, Some(id), &result);
        let activation = result?;
        self.arm_for(&activation.bundle);
        Ok(activation)
    }

    pub async fn next_bundle(&self, id: &str) -> BundleResult<BundleInfo> {
        self.manager.next(id).await
    }

    pub async fn delete_bundle(&self, id: &str) -> BundleResult<()> {
        let result = self.manager.delete_bundle(id).await;
        self.record_result(LifecycleAction::Delete, Some(id), &result);
        result
    }

    pub async fn reset(&self, to_last_successful: bool) -> BundleResult<BundleInfo> {
        let result = self.manager.reset(to_last_successful).await;
        self.record_result(LifecycleAction::Reset, None, &result);
        let current = result?;
        self.arm_for(&current);
        Ok(current)
    }

    pub async fn import_directory(
        &self,
        source: &Path,
        version: &str,
        checksum: Option<String>,
    ) -> BundleResult<BundleInfo> {
        let result = self
            .manager
            .import_directory(source, version, checksum)
            .await;
        let bundle_id = result.as_ref().ok().map(|bundle| bundle.id.clone());
        self.record_result(LifecycleAction::Download, bundle_id.as_deref(), &result);
        result
    }

    pub async fn import_encrypted_directory(
        &self,
        source: &Path,
        version: &str,
        checksum: Option<String>,
        session_key: &str,
    ) -> BundleResult<BundleInfo> {
        let result = self
            .manager
            .import_encrypted_directory(source, version, checksum, session_key)
            .await;
        let bundle_id = result.as_ref().ok().map(|bundle| bundle.id.clone());
        self.record_result(LifecycleAction::Download, bundle_id.as_deref(), &result);
        result
    }

    pub async fn cleanup(&self) -> CleanupReport {
        let report = self.manager.cleanup().await;
        self.record(
            LifecycleRecord::ok(LifecycleAction::Cleanup, None).with_detail(format!(
                "deleted_failed={} removed_orphans={}",
                report.deleted_failed.len(),
                report.removed_orphans.len()
            )),
        );
        report
    }

    /// The running bundle reports itself healthy. `None` means the watchdog
    /// already rolled it back.
    pub async fn notify_app_ready(&self) -> BundleResult<Option<BundleInfo>> {
        self.watchdog.confirm().await
    }

    /// Starts background tracking and applies the queued bundle if that
    /// satisfies the delay gate.
    pub async fn app_backgrounded(&self) -> BundleResult<Option<ApplyOutcome>> {
        let gate = {
            let mut gate = self.lock_gate();
            gate.on_background();
            gate.clone()
        };
        self.apply_if_due(&gate).await
    }

    pub fn app_foregrounded(&self) {
        self.lock_gate().on_foreground();
    }

    /// Re-evaluates the delay gate, e.g. once a background duration elapsed.
    pub async fn poll_pending_update(&self) -> BundleResult<Option<ApplyOutcome>> {
        let gate = self.lock_gate().clone();
        self.apply_if_due(&gate).await
    }

    pub async fn evaluate_update_response(&self, response: &UpdateCheckResponse) -> UpdateDecision {
        let current = self.manager.current().await;
        let decision = response.classify(&current);
        match &decision {
            UpdateDecision::Rejected { error, message } => {
                warn!(error = %error, message = ?message, "update server rejected the check");
                self.events
                    .publish(UpdaterEvent::NoNeedUpdate { bundle: current });
            }
            UpdateDecision::UpToDate { .. } => {
                self.events
                    .publish(UpdaterEvent::NoNeedUpdate { bundle: current });
            }
            UpdateDecision::Breaking { version, .. } => {
                self.events.publish_breaking(version);
            }
            UpdateDecision::Available(_) => {}
        }
        decision
    }

    /// Runtime overrides resolved over the configured endpoints.
    pub async fn endpoints(&self) -> EndpointOverrides {
        let overrides = self.manager.endpoint_overrides().await;
        let configured = &self.settings.endpoints;
        EndpointOverrides {
            update_url: overrides.update_url.or_else(|| configured.update_url.clone()),
            stats_url: overrides.stats_url.or_else(|| configured.stats_url.clone()),
            channel_url: overrides
                .channel_url
                .or_else(|| configured.channel_url.clone()),
            app_id: overrides.app_id.or_else(|| configured.app_id.clone()),
        }
    }

    pub fn stats_json(&self) -> Result<String> {
        let events = self.events.stats();
        let telemetry = self.lock_telemetry();
        let snapshot = telemetry.snapshot();
        let payload = json!({
            "events": {
                "published": events.published,
                "consumed": events.consumed,
                "dropped": events.dropped,
                "depth": events.depth
            },
            "telemetry": {
                "file": telemetry.path().display().to_string(),
                "schema_version": snapshot.schema_version,
                "updated_at": snapshot.updated_at,
                "activations": snapshot.activations,
                "confirmations": snapshot.confirmations,
                "rollbacks": snapshot.rollbacks,
                "deletions": snapshot.deletions,
                "downloads_completed": snapshot.downloads_completed,
                "downloads_failed": snapshot.downloads_failed,
                "integrity_failures": snapshot.integrity_failures,
                "errors": snapshot.errors
            },
            "last_action": snapshot.last_action
        });

        serde_json::to_string_pretty(&payload).context("failed to encode stats")
    }

    async fn apply_if_due(&self, gate: &DelayGate) -> BundleResult<Option<ApplyOutcome>> {
        if self.manager.next_bundle().await.is_none() {
            return Ok(None);
        }
        let result = self.manager.apply_pending_update(gate).await;
        match result.as_ref() {
            Ok(outcome) if outcome.swapped => self.record(LifecycleRecord::ok(
                LifecycleAction::ApplyPending,
                Some(&outcome.current.id),
            )),
            Ok(_) => {}
            Err(_) => self.record_result(LifecycleAction::ApplyPending, None, &result),
        }
        let outcome = result?;
        if outcome.swapped {
            self.arm_for(&outcome.current);
            self.events.publish(UpdaterEvent::AppReloaded {});
        }
        Ok(Some(outcome))
    }

    fn arm_for(&self, bundle: &BundleInfo) -> bool {
        if bundle.is_builtin() {
            self.watchdog.disarm();
            return false;
        }
        self.watchdog.arm(&bundle.id);
        true
    }

    fn record_result<T>(
        &self,
        action: LifecycleAction,
        bundle_id: Option<&str>,
        result: &BundleResult<T>,
    ) {
        record_outcome(&self.telemetry, action, bundle_id, result);
    }

    fn record(&self, record: LifecycleRecord) {
        record_lifecycle(&self.telemetry, record);
    }

    fn lock_gate(&self) -> MutexGuard<'_, DelayGate> {
        self.gate.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn lock_telemetry(&self) -> MutexGuard<'_, TelemetryStore> {
        self.telemetry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Watchdog target that records confirmations and rollbacks in telemetry.
struct TrackedTarget {
    manager: Arc<BundleManager>,
    telemetry: Arc<Mutex<TelemetryStore>>,
}

#[async_trait]
impl ReadinessTarget for TrackedTarget {
    async fn confirm_ready(&self) -> BundleResult<BundleInfo> {
        let result = self.manager.confirm_ready().await;
        let bundle_id = result.as_ref().ok().map(|bundle| bundle.id.clone());
        record_outcome(
            &self.telemetry,
            LifecycleAction::Confirm,
            bundle_id.as_deref(),
            &result,
        );
        result
    }

    async fn rollback(&self) -> BundleResult<RollbackReport> {
        let result = self.manager.rollback().await;
        let failed_id = result
            .as_ref()
            .ok()
            .and_then(|report| report.failed.as_ref().map(|bundle| bundle.id.clone()));
        record_outcome(
            &self.telemetry,
            LifecycleAction::Rollback,
            failed_id.as_deref(),
            &result,
        );
        result
    }
}

fn record_outcome<T>(
    telemetry: &Mutex<TelemetryStore>,
    action: LifecycleAction,
    bundle_id: Option<&str>,
    result: &BundleResult<T>,
) {
    let record = match result {
        Ok(_) => LifecycleRecord::ok(action, bundle_id),
        Err(err) => LifecycleRecord::failed(action, bundle_id, err.kind(), err.to_string()),
    };
    record_lifecycle(telemetry, record);
}

fn record_lifecycle(telemetry: &Mutex<TelemetryStore>, record: LifecycleRecord) {
    emit_event(
        "lifecycle",
        serde_json::to_value(&record).unwrap_or_default(),
    );
    let mut telemetry = telemetry
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
    if let Err(err) = telemetry.record(record) {
        emit_event("telemetry_error", json!({ "message": err.to_string() }));
    }
}
