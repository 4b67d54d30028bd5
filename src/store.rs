use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bundle::{is_builtin_id, BundleInfo, FailedUpdate, BUILTIN_BUNDLE_ID};
use crate::delay::DelayCondition;
use crate::error::{BundleError, BundleResult};

const STORE_SCHEMA_VERSION: u32 = 1;
const SEALED_PREFIX: &str = "sealed:v1:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub bundles: BTreeMap<String, BundleInfo>,
    pub current_bundle_id: String,
    pub next_bundle_id: Option<String>,
    pub last_successful_bundle_id: Option<String>,
    pub failed_update: Option<FailedUpdate>,
    pub delay_conditions: Vec<DelayCondition>,
    pub custom_id: Option<String>,
    pub channel: Option<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            bundles: BTreeMap::new(),
            current_bundle_id: BUILTIN_BUNDLE_ID.to_string(),
            next_bundle_id: None,
            last_successful_bundle_id: None,
            failed_update: None,
            delay_conditions: Vec::new(),
            custom_id: None,
            channel: None,
        }
    }
}

impl Manifest {
    /// Resolves a bundle id, including the builtin sentinel.
    pub fn bundle(&self, id: &str) -> Option<BundleInfo> {
        if is_builtin_id(id) {
            return Some(BundleInfo::builtin());
        }
        self.bundles.get(id).cloned()
    }

    pub fn current(&self) -> BundleInfo {
        self.bundle(&self.current_bundle_id)
            .unwrap_or_else(BundleInfo::builtin)
    }

    /// Repairs pointers that no longer resolve after a partial or hand-edited document.
    fn normalize(&mut self) {
        self.bundles.remove(BUILTIN_BUNDLE_ID);
        if self.current_bundle_id.trim().is_empty()
            || (!is_builtin_id(&self.current_bundle_id)
                && !self.bundles.contains_key(&self.current_bundle_id))
        {
            self.current_bundle_id = BUILTIN_BUNDLE_ID.to_string();
        }
        if let Some(next) = self.next_bundle_id.as_deref() {
            if !is_builtin_id(next) && !self.bundles.contains_key(next) {
                self.next_bundle_id = None;
            }
        }
        if let Some(last) = self.last_successful_bundle_id.as_deref() {
            if !is_builtin_id(last) && !self.bundles.contains_key(last) {
                self.last_successful_bundle_id = None;
            }
        }
    }
}

/// Runtime overrides of configured endpoints; `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverrides {
    pub update_url: Option<String>,
    pub stats_url: Option<String>,
    pub channel_url: Option<String>,
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StoreDocument {
    schema_version: u32,
    updated_at: String,
    device_id: String,
    manifest: Manifest,
    endpoints: EndpointOverrides,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            device_id: String::new(),
            manifest: Manifest::default(),
            endpoints: EndpointOverrides::default(),
        }
    }
}

/// Platform facility used to keep the device identifier encrypted at rest.
pub trait SecureStorage: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String>;
    fn unseal(&self, sealed: &str) -> Result<String>;
}

/// AES-256-GCM sealing with a key provisioned by the host.
pub struct AesGcmSealer {
    key: [u8; 32],
}

impl AesGcmSealer {
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_base64(raw: &str) -> Result<Self> {
        let decoded = general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|err| anyhow!("device key is not valid base64: {}", err))?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|bytes: Vec<u8>| anyhow!("device key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self::from_key(key))
    }
}

impl SecureStorage for AesGcmSealer {
    fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|err| anyhow!("failed to create cipher: {}", err))?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(&Nonce::from(nonce_bytes), plaintext.as_bytes())
            .map_err(|err| anyhow!("encryption failed: {}", err))?;

        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            SEALED_PREFIX,
            general_purpose::STANDARD.encode(payload)
        ))
    }

    fn unseal(&self, sealed: &str) -> Result<String> {
        let encoded = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| anyhow!("value is not sealed"))?;
        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| anyhow!("sealed value is not valid base64: {}", err))?;
        if payload.len() <= NONCE_LEN {
            return Err(anyhow!("sealed value too short"));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|err| anyhow!("failed to create cipher: {}", err))?;
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|err| anyhow!("decryption failed: {}", err))?;
        String::from_utf8(plaintext).map_err(|_| anyhow!("sealed value is not UTF-8"))
    }
}

/// Which device-scoped values survive a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistPolicy {
    pub custom_id: bool,
    pub endpoints: bool,
}

/// Manifest store before its document has been read.
pub struct ManifestStore {
    path: PathBuf,
    secure_storage: Option<Arc<dyn SecureStorage>>,
    persist: PersistPolicy,
}

impl ManifestStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            secure_storage: None,
            persist: PersistPolicy::default(),
        }
    }

    pub fn with_secure_storage(mut self, storage: Option<Arc<dyn SecureStorage>>) -> Self {
        self.secure_storage = storage;
        self
    }

    pub fn with_persist_policy(mut self, persist: PersistPolicy) -> Self {
        self.persist = persist;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document, falling back to defaults when it is missing or corrupt.
    pub fn load(self) -> LoadedStore {
        let document = match read_document(&self.path) {
            Ok(Some(document)) => document,
            Ok(None) => StoreDocument::default(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "manifest unreadable, starting from defaults");
                StoreDocument::default()
            }
        };

        let StoreDocument {
            device_id: stored_device_id,
            mut manifest,
            endpoints,
            ..
        } = document;
        manifest.normalize();

        let (device_id, needs_save) = self.resolve_device_id(stored_device_id.trim());
        let loaded = LoadedStore {
            store: self,
            manifest,
            endpoints,
            device_id,
        };
        if needs_save {
            if let Err(err) = loaded.save() {
                warn!(error = %err, "failed persisting device identifier");
            }
        }
        loaded
    }

    fn resolve_device_id(&self, stored: &str) -> (String, bool) {
        if stored.is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            info!(device_id = %generated, "generated device identifier");
            return (generated, true);
        }

        let Some(storage) = self.secure_storage.as_ref() else {
            return (stored.to_string(), false);
        };
        if !stored.starts_with(SEALED_PREFIX) {
            // Plaintext from before secure storage existed; seal it on the next write.
            return (stored.to_string(), true);
        }
        match storage.unseal(stored) {
            Ok(plain) => (plain, false),
            Err(err) => {
                warn!(error = %err, "device identifier could not be unsealed, treating as plaintext");
                (stored.to_string(), false)
            }
        }
    }
}

/// Manifest store holding the loaded document. Every mutation goes through here.
pub struct LoadedStore {
    store: ManifestStore,
    manifest: Manifest,
    endpoints: EndpointOverrides,
    device_id: String,
}

impl LoadedStore {
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn endpoints(&self) -> &EndpointOverrides {
        &self.endpoints
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Applies `mutate` and persists the result. The in-memory manifest only
    /// changes once the full document has been written.
    pub fn commit<F>(&mut self, mutate: F) -> BundleResult<()>
    where
        F: FnOnce(&mut Manifest),
    {
        let mut staged = self.manifest.clone();
        mutate(&mut staged);
        self.write(&staged, &self.endpoints)?;
        self.manifest = staged;
        Ok(())
    }

    pub fn commit_endpoints<F>(&mut self, mutate: F) -> BundleResult<()>
    where
        F: FnOnce(&mut EndpointOverrides),
    {
        let mut staged = self.endpoints.clone();
        mutate(&mut staged);
        self.write(&self.manifest, &staged)?;
        self.endpoints = staged;
        Ok(())
    }

    pub fn save(&self) -> BundleResult<()> {
        self.write(&self.manifest, &self.endpoints)
    }

    fn write(&self, manifest: &Manifest, endpoints: &EndpointOverrides) -> BundleResult<()> {
        let mut manifest = manifest.clone();
        if !self.store.persist.custom_id {
            manifest.custom_id = None;
        }
        let endpoints = if self.store.persist.endpoints {
            endpoints.clone()
        } else {
            EndpointOverrides::default()
        };
        let document = StoreDocument {
            schema_version: STORE_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            device_id: self.sealed_device_id(),
            manifest,
            endpoints,
        };
        write_document(self.path(), &document)
    }

    fn sealed_device_id(&self) -> String {
        let Some(storage) = self.store.secure_storage.as_ref() else {
            return self.device_id.clone();
        };
        match storage.seal(&self.device_id) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(error = %err, "secure storage unavailable, persisting device identifier in plaintext");
                self.device_id.clone()
            }
        }
    }
}

fn read_document(path: &Path) -> Result<Option<StoreDocument>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed reading manifest {}: {}", path.display(), err))?;
    let document = serde_json::from_str(&raw)
        .map_err(|err| anyhow!("failed decoding manifest {}: {}", path.display(), err))?;
    Ok(Some(document))
}

fn write_document(path: &Path, document: &StoreDocument) -> BundleResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            BundleError::io(format!("failed creating manifest dir {}", parent.display()), err)
        })?;
    }
    let payload = serde_json::to_vec_pretty(document)
        .map_err(|err| BundleError::io("failed encoding manifest", err.into()))?;
    let tmp = atomic_tmp_path(path);
    let mut file = fs::File::create(&tmp).map_err(|err| {
        BundleError::io(format!("failed creating manifest temp {}", tmp.display()), err)
    })?;
    file.write_all(&payload)
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            BundleError::io(format!("failed writing manifest temp {}", tmp.display()), err)
        })?;
    fs::rename(&tmp, path).map_err(|err| {
        BundleError::io(
            format!(
                "failed replacing manifest {} -> {}",
                tmp.display(),
                path.display()
            ),
            err,
        )
    })
}

fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("manifest");
    path.with_file_name(format!("{file_name}.tmp"))
}
