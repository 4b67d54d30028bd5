use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use aes::{Aes128, Aes256};
use base64::{engine::general_purpose, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bundle::BundleInfo;

const AES_BLOCK_LEN: usize = 16;
const BROTLI_BUFFER_LEN: usize = 4096;
const MIN_PKCS1_PADDING_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    #[error("session key must contain exactly two ':'-separated fields, got {fields}")]
    MalformedSessionKey { fields: usize },
    #[error("no public key configured for session key decryption")]
    NoPublicKey,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("failed recovering symmetric key: {0}")]
    KeyRecovery(String),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("encoding failure: {0}")]
    Encoding(String),
}

/// Per-file entry of a delta manifest delivered with an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub file_name: String,
    pub file_hash: String,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Parsed `IV:encryptedKey` session key, still base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub iv: String,
    pub encrypted_key: String,
}

impl SessionKey {
    pub fn parse(raw: &str) -> Result<Self, DecryptError> {
        let fields = raw.trim().split(':').collect::<Vec<_>>();
        if fields.len() != 2 || fields.iter().any(|field| field.trim().is_empty()) {
            return Err(DecryptError::MalformedSessionKey {
                fields: fields.len(),
            });
        }
        Ok(Self {
            iv: fields[0].trim().to_string(),
            encrypted_key: fields[1].trim().to_string(),
        })
    }
}

/// Lower-case hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of an extracted bundle tree.
///
/// Files are visited in sorted relative-path order (`/` separated); each
/// contributes its path bytes, a NUL byte and its raw SHA-256.
pub fn digest_directory(dir: &Path) -> io::Result<String> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (relative, path) in files {
        let file_digest = digest_file(&path)?;
        let raw = hex::decode(&file_digest).map_err(io::Error::other)?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(&raw);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push((relative, path));
        }
    }
    Ok(())
}

/// Case-insensitive comparison of the digest at `path` (file or directory)
/// against `expected`. Unreadable paths never verify.
pub fn verify(path: &Path, expected: &str) -> bool {
    let actual = if path.is_dir() {
        digest_directory(path)
    } else {
        digest_file(path)
    };
    match actual {
        Ok(actual) => actual.eq_ignore_ascii_case(expected.trim()),
        Err(_) => false,
    }
}

pub fn normalize_checksum(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.len() == 64 && normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        Some(normalized)
    } else {
        None
    }
}

pub fn verify_file_manifest(dir: &Path, entries: &[FileManifestEntry]) -> Result<(), String> {
    for entry in entries {
        let relative = Path::new(entry.file_name.trim());
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|part| !matches!(part, Component::Normal(_)))
        {
            return Err(format!("manifest entry '{}' escapes bundle", entry.file_name));
        }
        let path = dir.join(relative);
        if !path.is_file() {
            return Err(format!("manifest entry '{}' is missing", entry.file_name));
        }
        if !verify(&path, &entry.file_hash) {
            return Err(format!(
                "manifest entry '{}' checksum mismatch",
                entry.file_name
            ));
        }
    }
    Ok(())
}

/// Collaborator contract used to re-check a bundle before it is trusted.
pub trait BundleVerifier: Send + Sync {
    fn verify_integrity(&self, bundle: &BundleInfo, dir: &Path) -> Result<(), String>;
}

/// Re-hashes the bundle tree from disk on every call.
#[derive(Debug, Clone, Default)]
pub struct ChecksumVerifier {
    require_checksum: bool,
}

impl ChecksumVerifier {
    pub fn new(require_checksum: bool) -> Self {
        Self { require_checksum }
    }
}

impl BundleVerifier for ChecksumVerifier {
    fn verify_integrity(&self, bundle: &BundleInfo, dir: &Path) -> Result<(), String> {
        if !dir.is_dir() {
            return Err(format!("bundle directory {} is missing", dir.display()));
        }
        if bundle.checksum.trim().is_empty() {
            if self.require_checksum {
                return Err("bundle has no recorded checksum".to_string());
            }
            return Ok(());
        }
        let actual = digest_directory(dir)
            .map_err(|err| format!("failed hashing {}: {}", dir.display(), err))?;
        if !actual.eq_ignore_ascii_case(bundle.checksum.trim()) {
            return Err(format!(
                "checksum mismatch (expected {}, got {})",
                bundle.checksum.trim().to_ascii_lowercase(),
                actual
            ));
        }
        Ok(())
    }
}

/// Recovers per-update symmetric keys with the configured RSA public key.
#[derive(Debug, Clone, Default)]
pub struct SessionDecryptor {
    public_key: Option<RsaPublicKey>,
}

impl SessionDecryptor {
    pub fn new(public_key_pem: Option<&str>) -> Result<Self, DecryptError> {
        let public_key = public_key_pem
            .map(str::trim)
            .filter(|pem| !pem.is_empty())
            .map(parse_public_key)
            .transpose()?;
        Ok(Self { public_key })
    }

    pub fn has_public_key(&self) -> bool {
        self.public_key.is_some()
    }

    /// Returns the AES key and IV carried by `session_key`.
    pub fn recover(&self, session_key: &str) -> Result<(Vec<u8>, Vec<u8>), DecryptError> {
        let parsed = SessionKey::parse(session_key)?;
        let public_key = self.public_key.as_ref().ok_or(DecryptError::NoPublicKey)?;
        let iv = decode_base64(&parsed.iv)?;
        if iv.len() != AES_BLOCK_LEN {
            return Err(DecryptError::Encoding(format!(
                "IV must be {} bytes, got {}",
                AES_BLOCK_LEN,
                iv.len()
            )));
        }
        let encrypted_key = decode_base64(&parsed.encrypted_key)?;
        let key = recover_symmetric_key(public_key, &encrypted_key)?;
        Ok((key, iv))
    }

    /// Decrypts bundle content; a Brotli layer underneath is removed if present.
    pub fn decrypt_content(&self, data: &[u8], session_key: &str) -> Result<Vec<u8>, DecryptError> {
        let (key, iv) = self.recover(session_key)?;
        let plain = aes_cbc_decrypt(&key, &iv, data)?;
        Ok(decompress_best_effort(plain))
    }

    /// Decrypts a base64 checksum into lower-case hex.
    pub fn decrypt_checksum(
        &self,
        encrypted: &str,
        session_key: &str,
    ) -> Result<String, DecryptError> {
        let data = decode_base64(encrypted)?;
        let (key, iv) = self.recover(session_key)?;
        let plain = aes_cbc_decrypt(&key, &iv, &data)?;
        if plain.len() == 32 {
            return Ok(hex::encode(plain));
        }
        let text = String::from_utf8(plain)
            .map_err(|_| DecryptError::Encoding("checksum is not valid UTF-8".to_string()))?;
        normalize_checksum(&text)
            .ok_or_else(|| DecryptError::Encoding("checksum is not SHA-256 hex".to_string()))
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, DecryptError> {
    let pem = pem.replace("\\n", "\n");
    RsaPublicKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(&pem))
        .map_err(|err| DecryptError::InvalidPublicKey(err.to_string()))
}

/// Public-key RSA operation followed by PKCS#1 v1.5 type 1 unpadding.
fn recover_symmetric_key(
    public_key: &RsaPublicKey,
    encrypted: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    let size = public_key.size();
    if encrypted.len() != size {
        return Err(DecryptError::KeyRecovery(format!(
            "encrypted key must be {} bytes, got {}",
            size,
            encrypted.len()
        )));
    }
    let cipher = BigUint::from_bytes_be(encrypted);
    if &cipher >= public_key.n() {
        return Err(DecryptError::KeyRecovery(
            "encrypted key is out of range".to_string(),
        ));
    }
    let raw = cipher.modpow(public_key.e(), public_key.n()).to_bytes_be();
    let mut block = vec![0u8; size.saturating_sub(raw.len())];
    block.extend_from_slice(&raw);

    if block.len() < 3 || block[0] != 0x00 || block[1] != 0x01 {
        return Err(DecryptError::KeyRecovery("bad padding header".to_string()));
    }
    let separator = block[2..]
        .iter()
        .position(|byte| *byte != 0xff)
        .map(|offset| offset + 2)
        .ok_or_else(|| DecryptError::KeyRecovery("padding has no separator".to_string()))?;
    if block[separator] != 0x00 || separator - 2 < MIN_PKCS1_PADDING_LEN {
        return Err(DecryptError::KeyRecovery("bad padding body".to_string()));
    }
    Ok(block[separator + 1..].to_vec())
}

pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let result = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|err| DecryptError::Cipher(err.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|err| DecryptError::Cipher(err.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        other => {
            return Err(DecryptError::Cipher(format!(
                "unsupported AES key length {}",
                other
            )))
        }
    };
    result.map_err(|_| DecryptError::Cipher("invalid padding".to_string()))
}

/// Brotli-decodes `data` when it is a complete stream, otherwise returns it as-is.
pub fn decompress_best_effort(data: Vec<u8>) -> Vec<u8> {
    if data.is_empty() {
        return data;
    }
    let mut decoded = Vec::new();
    let mut reader = brotli::Decompressor::new(data.as_slice(), BROTLI_BUFFER_LEN);
    match reader.read_to_end(&mut decoded) {
        Ok(_) if !decoded.is_empty() => decoded,
        _ => data,
    }
}

fn decode_base64(value: &str) -> Result<Vec<u8>, DecryptError> {
    let value = value.trim();
    general_purpose::STANDARD
        .decode(value)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(value))
        .or_else(|_| general_purpose::URL_SAFE.decode(value))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(value))
        .map_err(|err| DecryptError::Encoding(err.to_string()))
}
