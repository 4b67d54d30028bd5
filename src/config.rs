use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::bundle::BUNDLE_ENTRY_POINT;
use crate::events::OverflowPolicy;
use crate::integrity::SessionDecryptor;
use crate::lifecycle::LifecyclePolicy;
use crate::store::{AesGcmSealer, PersistPolicy};

const ENV_FILE_ENV: &str = "RUSTY_OTA_ENV_FILE";
const MANIFEST_FILE: &str = "manifest.json";
const BUNDLES_DIR: &str = "bundles";

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub builtin_dir: PathBuf,
    pub telemetry_file: PathBuf,
    pub app_ready_timeout_ms: u64,
    pub host_version: String,
    pub lifecycle: LifecycleSettings,
    pub security: SecuritySettings,
    pub device: DeviceSettings,
    pub endpoints: EndpointSettings,
    pub events: EventSettings,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub auto_delete_previous: bool,
    pub auto_delete_failed: bool,
    pub allow_manual_bundle_error: bool,
    pub require_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct SecuritySettings {
    pub public_key: Option<String>,
    pub device_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub persist_custom_id: bool,
    pub allow_modify_url: bool,
    pub persist_modify_url: bool,
    pub default_channel: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointSettings {
    pub app_id: Option<String>,
    pub update_url: Option<String>,
    pub stats_url: Option<String>,
    pub channel_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let data_dir =
            read_path_env("RUSTY_OTA_DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let builtin_dir =
            read_path_env("RUSTY_OTA_BUILTIN_DIR").unwrap_or_else(|| PathBuf::from("./public"));
        let telemetry_file = read_path_env("RUSTY_OTA_TELEMETRY_FILE")
            .unwrap_or_else(|| data_dir.join("telemetry/latest.json"));

        let lifecycle = LifecycleSettings {
            auto_delete_previous: read_bool_env("RUSTY_OTA_AUTO_DELETE_PREVIOUS", true),
            auto_delete_failed: read_bool_env("RUSTY_OTA_AUTO_DELETE_FAILED", true),
            allow_manual_bundle_error: read_bool_env("RUSTY_OTA_ALLOW_MANUAL_BUNDLE_ERROR", false),
            require_checksum: read_bool_env("RUSTY_OTA_REQUIRE_CHECKSUM", false),
        };

        let public_key = match read_non_empty_env("RUSTY_OTA_PUBLIC_KEY") {
            Some(inline) => Some(inline),
            None => match read_path_env("RUSTY_OTA_PUBLIC_KEY_FILE") {
                Some(path) => Some(
                    fs::read_to_string(&path)
                        .with_context(|| format!("failed reading public key {}", path.display()))?
                        .trim()
                        .to_string(),
                ),
                None => None,
            },
        };
        let security = SecuritySettings {
            public_key,
            device_key: read_non_empty_env("RUSTY_OTA_DEVICE_KEY"),
        };

        let device = DeviceSettings {
            persist_custom_id: read_bool_env("RUSTY_OTA_PERSIST_CUSTOM_ID", false),
            allow_modify_url: read_bool_env("RUSTY_OTA_ALLOW_MODIFY_URL", false),
            persist_modify_url: read_bool_env("RUSTY_OTA_PERSIST_MODIFY_URL", false),
            default_channel: read_non_empty_env("RUSTY_OTA_DEFAULT_CHANNEL"),
        };

        let endpoints = EndpointSettings {
            app_id: read_non_empty_env("RUSTY_OTA_APP_ID"),
            update_url: read_non_empty_env("RUSTY_OTA_UPDATE_URL"),
            stats_url: read_non_empty_env("RUSTY_OTA_STATS_URL"),
            channel_url: read_non_empty_env("RUSTY_OTA_CHANNEL_URL"),
        };

        let events = EventSettings {
            capacity: read_usize_env("RUSTY_OTA_EVENT_CAPACITY", 100),
            overflow: read_non_empty_env("RUSTY_OTA_EVENT_OVERFLOW")
                .map(|raw| OverflowPolicy::from_env(&raw))
                .unwrap_or(OverflowPolicy::DropOldest),
        };

        Ok(Self {
            data_dir,
            builtin_dir,
            telemetry_file,
            app_ready_timeout_ms: read_u64_env("RUSTY_OTA_APP_READY_TIMEOUT_MS", 10_000),
            host_version: read_non_empty_env("RUSTY_OTA_HOST_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            lifecycle,
            security,
            device,
            endpoints,
            events,
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.data_dir.join(BUNDLES_DIR)
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            auto_delete_previous: self.lifecycle.auto_delete_previous,
            auto_delete_failed: self.lifecycle.auto_delete_failed,
            allow_manual_bundle_error: self.lifecycle.allow_manual_bundle_error,
            allow_modify_url: self.device.allow_modify_url,
        }
    }

    pub fn persist_policy(&self) -> PersistPolicy {
        PersistPolicy {
            custom_id: self.device.persist_custom_id,
            endpoints: self.device.persist_modify_url,
        }
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();
        if self.app_ready_timeout_ms == 0 {
            warnings.push(
                "RUSTY_OTA_APP_READY_TIMEOUT_MS is 0; every activation rolls back immediately"
                    .to_string(),
            );
        }
        if !self.builtin_dir.join(BUNDLE_ENTRY_POINT).is_file() {
            warnings.push(format!(
                "builtin bundle has no {} under {}",
                BUNDLE_ENTRY_POINT,
                self.builtin_dir.display()
            ));
        }
        if let Some(public_key) = self.security.public_key.as_deref() {
            if let Err(err) = SessionDecryptor::new(Some(public_key)) {
                warnings.push(format!("RUSTY_OTA_PUBLIC_KEY is unusable: {err}"));
            }
        }
        if let Some(device_key) = self.security.device_key.as_deref() {
            if let Err(err) = AesGcmSealer::from_base64(device_key) {
                warnings.push(format!("RUSTY_OTA_DEVICE_KEY is unusable: {err}"));
            }
        }
        if self.device.persist_modify_url && !self.device.allow_modify_url {
            warnings.push(
                "RUSTY_OTA_PERSIST_MODIFY_URL=true has no effect while RUSTY_OTA_ALLOW_MODIFY_URL=false"
                    .to_string(),
            );
        }
        if self.events.capacity == 0 {
            warnings.push("RUSTY_OTA_EVENT_CAPACITY should be > 0; using 1".to_string());
        }

        DoctorReport {
            data_dir: self.data_dir.clone(),
            builtin_dir: self.builtin_dir.clone(),
            telemetry_file: self.telemetry_file.clone(),
            manifest_file: self.manifest_path(),
            app_ready_timeout_ms: self.app_ready_timeout_ms,
            host_version: self.host_version.clone(),
            auto_delete_previous: self.lifecycle.auto_delete_previous,
            auto_delete_failed: self.lifecycle.auto_delete_failed,
            allow_manual_bundle_error: self.lifecycle.allow_manual_bundle_error,
            require_checksum: self.lifecycle.require_checksum,
            public_key_loaded: self.security.public_key.is_some(),
            device_key_loaded: self.security.device_key.is_some(),
            persist_custom_id: self.device.persist_custom_id,
            allow_modify_url: self.device.allow_modify_url,
            persist_modify_url: self.device.persist_modify_url,
            default_channel: self.device.default_channel.clone(),
            update_url: self.endpoints.update_url.clone(),
            event_capacity: self.events.capacity,
            warnings,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub data_dir: PathBuf,
    pub builtin_dir: PathBuf,
    pub telemetry_file: PathBuf,
    pub manifest_file: PathBuf,
    pub app_ready_timeout_ms: u64,
    pub host_version: String,
    pub auto_delete_previous: bool,
    pub auto_delete_failed: bool,
    pub allow_manual_bundle_error: bool,
    pub require_checksum: bool,
    pub public_key_loaded: bool,
    pub device_key_loaded: bool,
    pub persist_custom_id: bool,
    pub allow_modify_url: bool,
    pub persist_modify_url: bool,
    pub default_channel: Option<String>,
    pub update_url: Option<String>,
    pub event_capacity: usize,
    pub warnings: Vec<String>,
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_path_env(key: &str) -> Option<PathBuf> {
    read_non_empty_env(key).map(PathBuf::from)
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_usize_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
