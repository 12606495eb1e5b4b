use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration as StdDuration, Instant};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::error::CryptoError;
use crate::config::EncryptionConfig;

const WRAPPING_SALT: &[u8] = b"master_salt";
/// Associated data binding the sealed store to its role.
const STORE_AAD: &[u8] = b"encryption-key-store";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// A lock file older than this is assumed abandoned by a crashed process.
const STALE_LOCK_SECONDS: u64 = 30;
/// How long opening waits for a peer that is creating the store; long
/// enough for an abandoned lock to go stale.
const OPEN_LOCK_WAIT: StdDuration = StdDuration::from_secs(STALE_LOCK_SECONDS + 5);
/// Rotation is retried by its callers, so it gives up sooner.
const ROTATE_LOCK_WAIT: StdDuration = StdDuration::from_secs(2);
const MAX_LOCK_BACKOFF: StdDuration = StdDuration::from_millis(250);

pub type DataKey = Zeroizing<[u8; KEY_LEN]>;

/// Public view of one key record.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    revision: u64,
    keys: BTreeMap<String, StoredKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    wrapped_key: String,
    created_at: DateTime<Utc>,
    is_current: bool,
}

struct KeyRecord {
    dek: DataKey,
    created_at: DateTime<Utc>,
}

struct KeyRing {
    revision: u64,
    current: String,
    keys: HashMap<String, KeyRecord>,
}

/// Owns the data-encryption keys (DEKs) and their on-disk store.
///
/// The store file is one AES-GCM sealed blob under a key derived from the
/// master secret, so key metadata and the revision are authenticated along
/// with the DEKs. Inside it each DEK is wrapped again under its key id.
/// Plaintext DEKs exist only in memory. Rotation adds a key and never
/// removes one, so older envelopes stay decryptable.
pub struct KeyManager {
    path: PathBuf,
    wrapping_key: Zeroizing<[u8; KEY_LEN]>,
    auto_rotate: Duration,
    ring: RwLock<KeyRing>,
}

impl KeyManager {
    /// Open the key store at `config.key_store_path`, creating it with a
    /// first key when it does not exist.
    pub fn open(config: &EncryptionConfig) -> Result<Self, CryptoError> {
        let wrapping_key = derive_wrapping_key(
            config.master_key.expose_secret().as_bytes(),
            config.kdf_iterations,
        );
        let path = PathBuf::from(&config.key_store_path);

        let ring = match read_store(&path, &wrapping_key)? {
            Some(file) => unwrap_ring(&wrapping_key, file)?,
            None => initialize_store(&path, &wrapping_key)?,
        };

        tracing::info!(
            path = %path.display(),
            keys = ring.keys.len(),
            current = %ring.current,
            "Key store opened"
        );

        Ok(Self {
            path,
            wrapping_key,
            auto_rotate: Duration::days(config.auto_rotate_days),
            ring: RwLock::new(ring),
        })
    }

    pub fn current_key_id(&self) -> Result<String, CryptoError> {
        Ok(self.read_ring()?.current.clone())
    }

    /// The current key id and DEK.
    pub fn current_key(&self) -> Result<(String, DataKey), CryptoError> {
        let ring = self.read_ring()?;
        let record = ring
            .keys
            .get(&ring.current)
            .ok_or_else(|| CryptoError::KeyStore("current key missing from ring".to_string()))?;
        Ok((ring.current.clone(), record.dek.clone()))
    }

    pub fn key(&self, key_id: &str) -> Result<DataKey, CryptoError> {
        let ring = self.read_ring()?;
        ring.keys
            .get(key_id)
            .map(|record| record.dek.clone())
            .ok_or_else(|| CryptoError::UnknownEncryptionKey(key_id.to_string()))
    }

    pub fn keys(&self) -> Result<Vec<KeyInfo>, CryptoError> {
        let ring = self.read_ring()?;
        let mut keys: Vec<KeyInfo> = ring
            .keys
            .iter()
            .map(|(id, record)| KeyInfo {
                key_id: id.clone(),
                created_at: record.created_at,
                is_current: *id == ring.current,
            })
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    pub fn revision(&self) -> Result<u64, CryptoError> {
        Ok(self.read_ring()?.revision)
    }

    /// Generate a new current key and persist it.
    ///
    /// Serialized across processes by an exclusive lock file plus a
    /// compare-and-swap on the store revision. If another process rotated
    /// first, the store is reloaded and `RotationConflict` returned; the
    /// winner's key is then current here too.
    pub fn rotate(&self) -> Result<String, CryptoError> {
        let _lock = LockGuard::acquire(&lock_path(&self.path), ROTATE_LOCK_WAIT)?;

        let expected = self.read_ring()?.revision;
        let on_disk = read_store(&self.path, &self.wrapping_key)?;
        let found = on_disk.as_ref().map(|f| f.revision).unwrap_or(0);

        if found != expected {
            if let Some(file) = on_disk {
                let ring = unwrap_ring(&self.wrapping_key, file)?;
                *self.write_ring()? = ring;
            }
            tracing::warn!(expected, found, "Key rotation lost a race, adopted stored keys");
            return Err(CryptoError::RotationConflict { expected, found });
        }

        let mut ring = self.write_ring()?;
        let key_id = Uuid::new_v4().to_string();
        ring.keys.insert(
            key_id.clone(),
            KeyRecord {
                dek: generate_dek(),
                created_at: Utc::now(),
            },
        );
        let previous = std::mem::replace(&mut ring.current, key_id.clone());
        ring.revision = expected + 1;

        if let Err(e) = write_store(&self.path, &self.wrapping_key, &ring) {
            ring.keys.remove(&key_id);
            ring.current = previous;
            ring.revision = expected;
            return Err(e);
        }

        tracing::info!(key_id = %key_id, revision = ring.revision, "Encryption key rotated");
        metrics::counter!("encryption_key_rotations_total").increment(1);
        Ok(key_id)
    }

    /// Rotate when the current key is older than the configured age.
    /// Failures are logged and the existing key stays in use.
    pub fn rotate_if_due(&self) -> Result<(), CryptoError> {
        let created_at = {
            let ring = self.read_ring()?;
            ring.keys
                .get(&ring.current)
                .map(|r| r.created_at)
                .ok_or_else(|| CryptoError::KeyStore("current key missing from ring".to_string()))?
        };

        if Utc::now() - created_at <= self.auto_rotate {
            return Ok(());
        }

        match self.rotate() {
            Ok(_) | Err(CryptoError::RotationConflict { .. }) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Scheduled key rotation failed, keeping current key");
                Ok(())
            }
        }
    }

    /// Re-read the store from disk, picking up keys rotated by other
    /// processes.
    pub fn reload(&self) -> Result<(), CryptoError> {
        let file = read_store(&self.path, &self.wrapping_key)?
            .ok_or_else(|| CryptoError::KeyStore("Key store file disappeared".to_string()))?;
        let ring = unwrap_ring(&self.wrapping_key, file)?;
        *self.write_ring()? = ring;
        Ok(())
    }

    fn read_ring(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyRing>, CryptoError> {
        self.ring
            .read()
            .map_err(|e| CryptoError::KeyStore(format!("Lock poisoned: {}", e)))
    }

    fn write_ring(&self) -> Result<std::sync::RwLockWriteGuard<'_, KeyRing>, CryptoError> {
        self.ring
            .write()
            .map_err(|e| CryptoError::KeyStore(format!("Lock poisoned: {}", e)))
    }

    #[cfg(test)]
    fn backdate_current(&self, age: Duration) {
        let mut ring = self.ring.write().unwrap();
        let current = ring.current.clone();
        if let Some(record) = ring.keys.get_mut(&current) {
            record.created_at = Utc::now() - age;
        }
    }
}

fn derive_wrapping_key(master: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(master, WRAPPING_SALT, iterations, &mut key[..]);
    key
}

fn generate_dek() -> DataKey {
    let mut dek = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut dek[..]);
    dek
}

fn wrap_dek(wrapping_key: &[u8; KEY_LEN], key_id: &str, dek: &DataKey) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping_key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &dek[..],
                aad: key_id.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::KeyStore(format!("Failed to wrap key: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(B64.encode(out))
}

fn unwrap_dek(wrapping_key: &[u8; KEY_LEN], key_id: &str, wrapped: &str) -> Result<DataKey, CryptoError> {
    let raw = B64
        .decode(wrapped)
        .map_err(|e| CryptoError::KeyStore(format!("Invalid wrapped key {}: {}", key_id, e)))?;
    if raw.len() <= NONCE_LEN {
        return Err(CryptoError::KeyStore(format!("Truncated wrapped key {}", key_id)));
    }

    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping_key));
    let plain = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| {
                CryptoError::KeyStore(
                    "Key store cannot be opened with the configured master key".to_string(),
                )
            })?,
    );

    if plain.len() != KEY_LEN {
        return Err(CryptoError::KeyStore(format!("Wrong key length for {}", key_id)));
    }

    let mut dek = Zeroizing::new([0u8; KEY_LEN]);
    dek.copy_from_slice(&plain);
    Ok(dek)
}

fn unwrap_ring(wrapping_key: &[u8; KEY_LEN], file: StoreFile) -> Result<KeyRing, CryptoError> {
    let mut keys = HashMap::with_capacity(file.keys.len());
    let mut current = None;

    for (key_id, stored) in file.keys {
        let dek = unwrap_dek(wrapping_key, &key_id, &stored.wrapped_key)?;
        if stored.is_current {
            if current.is_some() {
                return Err(CryptoError::KeyStore("More than one current key".to_string()));
            }
            current = Some(key_id.clone());
        }
        keys.insert(
            key_id,
            KeyRecord {
                dek,
                created_at: stored.created_at,
            },
        );
    }

    let current = current.ok_or_else(|| CryptoError::KeyStore("No current key".to_string()))?;

    Ok(KeyRing {
        revision: file.revision,
        current,
        keys,
    })
}

fn read_store(path: &Path, wrapping_key: &[u8; KEY_LEN]) -> Result<Option<StoreFile>, CryptoError> {
    let sealed = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let raw = B64
        .decode(sealed.trim())
        .map_err(|e| CryptoError::KeyStore(format!("Corrupt key store: {}", e)))?;
    if raw.len() <= NONCE_LEN {
        return Err(CryptoError::KeyStore("Truncated key store".to_string()));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping_key));
    let plain = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: STORE_AAD,
                },
            )
            .map_err(|_| {
                CryptoError::KeyStore(
                    "Key store cannot be opened with the configured master key".to_string(),
                )
            })?,
    );

    serde_json::from_slice(&plain)
        .map(Some)
        .map_err(|e| CryptoError::KeyStore(format!("Corrupt key store: {}", e)))
}

/// Seal the ring, write it to a sibling temp file and rename over the store.
fn write_store(path: &Path, wrapping_key: &[u8; KEY_LEN], ring: &KeyRing) -> Result<(), CryptoError> {
    let mut keys = BTreeMap::new();
    for (key_id, record) in &ring.keys {
        keys.insert(
            key_id.clone(),
            StoredKey {
                wrapped_key: wrap_dek(wrapping_key, key_id, &record.dek)?,
                created_at: record.created_at,
                is_current: *key_id == ring.current,
            },
        );
    }

    let file = StoreFile {
        revision: ring.revision,
        keys,
    };
    let json = Zeroizing::new(
        serde_json::to_vec(&file)
            .map_err(|e| CryptoError::KeyStore(format!("Failed to serialize key store: {}", e)))?,
    );

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping_key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: json.as_slice(),
                aad: STORE_AAD,
            },
        )
        .map_err(|e| CryptoError::KeyStore(format!("Failed to seal key store: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    let tmp = tmp_path(path);
    {
        let mut out = fs::File::create(&tmp)?;
        out.write_all(B64.encode(sealed).as_bytes())?;
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn initialize_store(path: &Path, wrapping_key: &[u8; KEY_LEN]) -> Result<KeyRing, CryptoError> {
    let _lock = LockGuard::acquire(&lock_path(path), OPEN_LOCK_WAIT)?;

    // Another process may have created it while we waited for the lock.
    if let Some(file) = read_store(path, wrapping_key)? {
        return unwrap_ring(wrapping_key, file);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let key_id = Uuid::new_v4().to_string();
    let ring = KeyRing {
        revision: 1,
        current: key_id.clone(),
        keys: HashMap::from([(
            key_id.clone(),
            KeyRecord {
                dek: generate_dek(),
                created_at: Utc::now(),
            },
        )]),
    };

    write_store(path, wrapping_key, &ring)?;
    tracing::info!(key_id = %key_id, path = %path.display(), "Created key store");
    Ok(ring)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Exclusive lock file holding a unique owner token, removed on drop.
struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    /// Take the lock, waiting up to `max_wait` for its holder. A lock older
    /// than `STALE_LOCK_SECONDS` is broken.
    fn acquire(path: &Path, max_wait: StdDuration) -> Result<Self, CryptoError> {
        let deadline = Instant::now() + max_wait;
        let mut backoff = StdDuration::from_millis(10);

        loop {
            if let Some(guard) = Self::try_create(path)? {
                return Ok(guard);
            }
            if Self::break_if_stale(path) {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(CryptoError::KeyStore(
                    "Key store is locked by another process".to_string(),
                ));
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_LOCK_BACKOFF);
        }
    }

    /// `None` when someone else holds the lock.
    fn try_create(path: &Path) -> Result<Option<Self>, CryptoError> {
        let token = format!("{} {}", std::process::id(), Uuid::new_v4());
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(token.as_bytes())?;
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    token,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an abandoned lock. The lock is first renamed aside and its
    /// token compared with the one judged stale, so a fresh lock taken by a
    /// peer in between is put back instead of deleted.
    fn break_if_stale(path: &Path) -> bool {
        let Some(stale_token) = Self::stale_token(path) else {
            return false;
        };

        let mut aside = path.as_os_str().to_owned();
        aside.push(format!(".stale-{}", Uuid::new_v4().simple()));
        let aside = PathBuf::from(aside);
        if fs::rename(path, &aside).is_err() {
            // Already broken by a peer.
            return false;
        }

        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved == stale_token {
            tracing::warn!(path = %path.display(), "Removed stale key store lock");
            let _ = fs::remove_file(&aside);
            return true;
        }

        if let Err(e) = fs::hard_link(&aside, path) {
            tracing::warn!(error = %e, path = %path.display(), "Could not restore a live key store lock");
        }
        let _ = fs::remove_file(&aside);
        false
    }

    fn stale_token(path: &Path) -> Option<String> {
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())?;
        if age.as_secs() <= STALE_LOCK_SECONDS {
            return None;
        }
        fs::read_to_string(path).ok()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the lock if it is still ours.
        if fs::read_to_string(&self.path).is_ok_and(|t| t == self.token) {
            let _ = fs::remove_file(&self.path);
        }
    }
}
