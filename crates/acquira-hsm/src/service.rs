use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use acquira_core::error::GatewayError;
use acquira_core::types::{now_ts, Timestamp};

use crate::audit::{AuditEntry, KeyOp};

/// The only algorithm this service accepts.
pub const AES_256_GCM: &str = "AES-256-GCM";

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

// ── Key material (internal) ──────────────────────────────────────────────────

/// All versions of one key. The byte map is private to this module and is
/// wiped on drop; only [`KeyInfo`] metadata leaves the service.
struct KeyMaterial {
    key_id: String,
    current_version: u32,
    versions: HashMap<u32, Zeroizing<[u8; KEY_LEN]>>,
    created_at: Timestamp,
    rotated_at: Option<Timestamp>,
}

impl KeyMaterial {
    fn info(&self) -> KeyInfo {
        KeyInfo {
            key_id: self.key_id.clone(),
            algorithm: AES_256_GCM.to_string(),
            current_version: self.current_version,
            version_count: self.versions.len() as u32,
            created_at: self.created_at,
            rotated_at: self.rotated_at,
        }
    }
}

/// Externally visible key metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub algorithm: String,
    pub current_version: u32,
    pub version_count: u32,
    pub created_at: Timestamp,
    pub rotated_at: Option<Timestamp>,
}

/// Ciphertext plus the parameters needed to decrypt it later.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub key_version: u32,
}

// ── Service ──────────────────────────────────────────────────────────────────

/// Versioned AES-256-GCM key service.
///
/// Operations on the same key serialize on that key's lock; independent keys
/// proceed in parallel. Every operation, successful or not, appends one audit
/// entry.
pub struct HsmKeyService {
    keys: RwLock<HashMap<String, Arc<RwLock<KeyMaterial>>>>,
    audit: Mutex<Vec<AuditEntry>>,
    audit_seq: AtomicU64,
}

impl HsmKeyService {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            audit_seq: AtomicU64::new(0),
        }
    }

    /// Create a fresh key under `key_id`. Only AES-256-GCM is accepted.
    pub fn generate_key(&self, key_id: &str, algorithm: &str) -> Result<KeyInfo, GatewayError> {
        let result = self.generate_key_inner(key_id, algorithm);
        self.record(KeyOp::Generate, key_id, result.as_ref().ok().map(|i| i.current_version), &result);
        result
    }

    fn generate_key_inner(&self, key_id: &str, algorithm: &str) -> Result<KeyInfo, GatewayError> {
        if algorithm != AES_256_GCM {
            return Err(GatewayError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        let mut keys = self.keys.write().expect("key map lock");
        if keys.contains_key(key_id) {
            return Err(GatewayError::KeyExists(key_id.to_string()));
        }
        let mut versions = HashMap::new();
        versions.insert(1, fresh_key());
        let material = KeyMaterial {
            key_id: key_id.to_string(),
            current_version: 1,
            versions,
            created_at: now_ts(),
            rotated_at: None,
        };
        let info = material.info();
        keys.insert(key_id.to_string(), Arc::new(RwLock::new(material)));
        Ok(info)
    }

    /// Encrypt under the key's current version. Returns ciphertext, nonce and
    /// the version used.
    pub fn encrypt(
        &self,
        key_id: &str,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<EncryptedBlob, GatewayError> {
        let result = self.encrypt_inner(key_id, plaintext, aad);
        self.record(KeyOp::Encrypt, key_id, result.as_ref().ok().map(|b| b.key_version), &result);
        result
    }

    fn encrypt_inner(
        &self,
        key_id: &str,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<EncryptedBlob, GatewayError> {
        let material = self.material(key_id)?;
        let material = material.read().expect("key lock");
        let version = material.current_version;
        let key = material
            .versions
            .get(&version)
            .ok_or_else(|| GatewayError::Internal("current key version missing".into()))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| GatewayError::Internal("encryption failure".into()))?;

        Ok(EncryptedBlob { ciphertext, nonce, key_version: version })
    }

    /// Decrypt a blob produced at any (possibly rotated-away) version.
    ///
    /// A missing version reports `InvalidKeyVersion`; tampered ciphertext,
    /// nonce or AAD all collapse to the indistinguishable `DecryptionFailed`.
    pub fn decrypt(
        &self,
        key_id: &str,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        version: u32,
    ) -> Result<Zeroizing<Vec<u8>>, GatewayError> {
        let result = self.decrypt_inner(key_id, ciphertext, nonce, aad, version);
        self.record(KeyOp::Decrypt, key_id, Some(version), &result);
        result
    }

    fn decrypt_inner(
        &self,
        key_id: &str,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        version: u32,
    ) -> Result<Zeroizing<Vec<u8>>, GatewayError> {
        let material = self.material(key_id)?;
        let material = material.read().expect("key lock");
        let key = material.versions.get(&version).ok_or(GatewayError::InvalidKeyVersion {
            key_id: key_id.to_string(),
            version,
        })?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map(Zeroizing::new)
            .map_err(|_| GatewayError::DecryptionFailed)
    }

    /// Mint a new current version; all prior versions remain decryptable.
    /// Returns (new_version, old_version).
    pub fn rotate_key(&self, key_id: &str) -> Result<(u32, u32), GatewayError> {
        let result = self.rotate_inner(key_id);
        self.record(KeyOp::Rotate, key_id, result.as_ref().ok().map(|(n, _)| *n), &result);
        result
    }

    fn rotate_inner(&self, key_id: &str) -> Result<(u32, u32), GatewayError> {
        let material = self.material(key_id)?;
        let mut material = material.write().expect("key lock");
        let old = material.current_version;
        let new = old + 1;
        material.versions.insert(new, fresh_key());
        material.current_version = new;
        material.rotated_at = Some(now_ts());
        Ok((new, old))
    }

    /// Metadata only; never includes key bytes.
    pub fn key_info(&self, key_id: &str) -> Result<KeyInfo, GatewayError> {
        let result = self
            .material(key_id)
            .map(|m| m.read().expect("key lock").info());
        self.record(KeyOp::Inspect, key_id, result.as_ref().ok().map(|i| i.current_version), &result);
        result
    }

    /// Snapshot of the audit trail.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().expect("audit lock").clone()
    }

    fn material(&self, key_id: &str) -> Result<Arc<RwLock<KeyMaterial>>, GatewayError> {
        self.keys
            .read()
            .expect("key map lock")
            .get(key_id)
            .cloned()
            .ok_or_else(|| GatewayError::KeyNotFound(key_id.to_string()))
    }

    fn record<T>(
        &self,
        op: KeyOp,
        key_id: &str,
        version: Option<u32>,
        result: &Result<T, GatewayError>,
    ) {
        let entry = AuditEntry {
            seq: self.audit_seq.fetch_add(1, Ordering::Relaxed),
            op,
            key_id: key_id.to_string(),
            version,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            timestamp: now_ts(),
        };
        if !entry.success {
            warn!(op = op.as_str(), key_id, error = ?entry.error, "HSM operation failed");
        }
        self.audit.lock().expect("audit lock").push(entry);
    }
}

impl Default for HsmKeyService {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(bytes.as_mut());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_key() -> HsmKeyService {
        let svc = HsmKeyService::new();
        svc.generate_key("card-vault", AES_256_GCM).unwrap();
        svc
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let svc = service_with_key();
        let blob = svc.encrypt("card-vault", b"4532015112830366|12/2030", b"tok").unwrap();
        let plain = svc
            .decrypt("card-vault", &blob.ciphertext, &blob.nonce, b"tok", blob.key_version)
            .unwrap();
        assert_eq!(plain.as_slice(), b"4532015112830366|12/2030");
    }

    #[test]
    fn wrong_aad_is_indistinguishable_decryption_failure() {
        let svc = service_with_key();
        let blob = svc.encrypt("card-vault", b"secret", b"aad-a").unwrap();
        let err = svc
            .decrypt("card-vault", &blob.ciphertext, &blob.nonce, b"aad-b", blob.key_version)
            .unwrap_err();
        assert!(matches!(err, GatewayError::DecryptionFailed));

        let mut tampered = blob.ciphertext.clone();
        tampered[0] ^= 0xff;
        let err = svc
            .decrypt("card-vault", &tampered, &blob.nonce, b"aad-a", blob.key_version)
            .unwrap_err();
        assert!(matches!(err, GatewayError::DecryptionFailed));
    }

    #[test]
    fn rotation_preserves_old_versions() {
        let svc = service_with_key();
        let blob_v1 = svc.encrypt("card-vault", b"old data", b"").unwrap();
        assert_eq!(blob_v1.key_version, 1);

        for _ in 0..3 {
            svc.rotate_key("card-vault").unwrap();
        }
        let info = svc.key_info("card-vault").unwrap();
        assert_eq!(info.current_version, 4);
        assert_eq!(info.version_count, 4);

        let plain = svc
            .decrypt("card-vault", &blob_v1.ciphertext, &blob_v1.nonce, b"", 1)
            .unwrap();
        assert_eq!(plain.as_slice(), b"old data");

        let blob_v4 = svc.encrypt("card-vault", b"new data", b"").unwrap();
        assert_eq!(blob_v4.key_version, 4);
    }

    #[test]
    fn unknown_version_is_typed() {
        let svc = service_with_key();
        let blob = svc.encrypt("card-vault", b"x", b"").unwrap();
        let err = svc
            .decrypt("card-vault", &blob.ciphertext, &blob.nonce, b"", 99)
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidKeyVersion { version: 99, .. }));
    }

    #[test]
    fn only_aes_256_gcm_is_accepted() {
        let svc = HsmKeyService::new();
        assert!(matches!(
            svc.generate_key("k", "AES-128-CBC").unwrap_err(),
            GatewayError::UnsupportedAlgorithm(_)
        ));
        svc.generate_key("k", AES_256_GCM).unwrap();
        assert!(matches!(
            svc.generate_key("k", AES_256_GCM).unwrap_err(),
            GatewayError::KeyExists(_)
        ));
    }

    #[test]
    fn audit_trail_records_every_operation_without_key_bytes() {
        let svc = service_with_key();
        let blob = svc.encrypt("card-vault", b"p", b"a").unwrap();
        let _ = svc.decrypt("card-vault", &blob.ciphertext, &blob.nonce, b"wrong", blob.key_version);
        svc.rotate_key("card-vault").unwrap();

        let log = svc.audit_log();
        assert_eq!(log.len(), 4); // generate, encrypt, decrypt(fail), rotate
        assert!(log.iter().any(|e| e.op == KeyOp::Decrypt && !e.success));
        for entry in &log {
            let rendered = format!("{entry:?}");
            assert!(!rendered.to_lowercase().contains("key bytes"));
            assert!(entry.error.iter().all(|e| !e.contains("key")));
        }
        // Sequence numbers are strictly increasing.
        for w in log.windows(2) {
            assert!(w[1].seq > w[0].seq);
        }
    }
}
