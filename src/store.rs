//! Persisted ratchet state, one passphrase-encrypted file per identity.
//!
//! File layout: salt (16) || nonce (24) || XChaCha20-Poly1305(JSON). The key is
//! PBKDF2-HMAC-SHA256 over the identity passphrase, so a wrong passphrase shows
//! up as an authentication failure and is reported as `IncorrectPassphrase`.
//!
//! Every read-modify-write of a file runs under an in-process lock keyed by the
//! fingerprint. Two decrypts racing on the same chain would otherwise both
//! advance from the same state and one of the advances would be lost.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{NymError, Result};
use crate::kdf::{derive_initial_state, Role, KEY_LENGTH};
use crate::ratchet::{RatchetState, NONCE_LENGTH};

/// SALT_LENGTH is 16 bytes
pub const SALT_LENGTH: usize = 16;
/// STORE_ROUNDS is the PBKDF2 iteration count for the file key
pub const STORE_ROUNDS: u32 = 100_000;
const STORE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u8,
    conversations: Vec<RatchetState>,
}

fn fingerprint_locks() -> &'static Mutex<HashMap<String, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock_for(fingerprint: &str) -> Arc<Mutex<()>> {
    let mut locks = fingerprint_locks().lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(fingerprint.to_string()).or_default().clone()
}

/// Handle on the ratchet store of one identity.
pub struct RatchetStateStore {
    path: PathBuf,
    fingerprint: String,
    salt: [u8; SALT_LENGTH],
    key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl std::fmt::Debug for RatchetStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetStateStore")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl RatchetStateStore {
    /// Location of the store for a fingerprint.
    pub fn path_for(db_dir: &Path, fingerprint: &str) -> PathBuf {
        db_dir.join(format!("{}.db", fingerprint))
    }

    /// open unlocks (or prepares) the store of `fingerprint`.
    ///
    /// Nothing is written until the first save.
    pub fn open(db_dir: &Path, fingerprint: &str, passphrase: &str) -> Result<Self> {
        if !db_dir.is_dir() {
            return Err(NymError::StoreUnavailable(db_dir.to_path_buf()));
        }
        let path = Self::path_for(db_dir, fingerprint);
        let salt = if path.exists() {
            let data = fs::read(&path).map_err(|_| NymError::StoreUnavailable(path.clone()))?;
            if data.len() < SALT_LENGTH + NONCE_LENGTH {
                return Err(NymError::StoreUnavailable(path));
            }
            let mut salt = [0u8; SALT_LENGTH];
            salt.copy_from_slice(&data[..SALT_LENGTH]);
            salt
        } else {
            let mut salt = [0u8; SALT_LENGTH];
            OsRng.fill_bytes(&mut salt);
            salt
        };
        let store = Self {
            key: Self::derive_key(passphrase, &salt),
            path,
            fingerprint: fingerprint.to_string(),
            salt,
        };
        // Proves the passphrase before anything else touches the file
        store.read_file()?;
        debug!(fingerprint, "ratchet store opened");
        Ok(store)
    }

    fn derive_key(passphrase: &str, salt: &[u8; SALT_LENGTH]) -> Zeroizing<[u8; KEY_LENGTH]> {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, STORE_ROUNDS, &mut *key);
        key
    }

    /// Fingerprint this store belongs to.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file exists yet.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn read_file(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile { version: STORE_VERSION, conversations: Vec::new() });
        }
        let data = fs::read(&self.path).map_err(|_| NymError::StoreUnavailable(self.path.clone()))?;
        if data.len() < SALT_LENGTH + NONCE_LENGTH || data[..SALT_LENGTH] != self.salt {
            return Err(NymError::StoreUnavailable(self.path.clone()));
        }
        let (nonce, ciphertext) = data[SALT_LENGTH..].split_at(NONCE_LENGTH);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|_| NymError::StoreUnavailable(self.path.clone()))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| NymError::IncorrectPassphrase)?,
        );
        serde_json::from_slice(&plaintext).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "ratchet store is corrupted");
            NymError::StoreUnavailable(self.path.clone())
        })
    }

    fn write_file(&self, contents: &StoreFile) -> Result<()> {
        let unavailable = |_: std::io::Error| NymError::StoreUnavailable(self.path.clone());
        let plaintext = Zeroizing::new(serde_json::to_vec(contents).map_err(|_| NymError::StoreUnavailable(self.path.clone()))?);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|_| NymError::StoreUnavailable(self.path.clone()))?;
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| NymError::StoreUnavailable(self.path.clone()))?;
        let data = [self.salt.as_slice(), nonce.as_slice(), ciphertext.as_slice()].concat();

        let tmp = self.path.with_extension("db.tmp");
        fs::write(&tmp, data).map_err(unavailable)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(unavailable)?;
        }
        fs::rename(&tmp, &self.path).map_err(unavailable)
    }

    fn position(contents: &StoreFile, name: &str, other_name: &str) -> Option<usize> {
        contents
            .conversations
            .iter()
            .position(|c| c.name == name && c.other_name == other_name)
    }

    /// load returns this identity's state for the conversation with `other_name`
    pub fn load(&self, other_name: &str) -> Result<Option<RatchetState>> {
        let lock = lock_for(&self.fingerprint);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = self.read_file()?;
        Ok(Self::position(&contents, &self.fingerprint, other_name).map(|i| contents.conversations[i].clone()))
    }

    /// save replaces the stored row with the same (name, other_name)
    pub fn save(&self, state: &RatchetState) -> Result<()> {
        let lock = lock_for(&self.fingerprint);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut contents = self.read_file()?;
        Self::upsert(&mut contents, state.clone());
        self.write_file(&contents)
    }

    fn upsert(contents: &mut StoreFile, state: RatchetState) {
        match Self::position(contents, &state.name, &state.other_name) {
            Some(i) => contents.conversations[i] = state,
            None => contents.conversations.push(state),
        }
    }

    /// reset discards the conversation with `other_name` and derives it again from `shared_secret`.
    ///
    /// Rows owned by the counterparty role's label are purged as well, so no
    /// state of the other side can linger next to the new derivation.
    pub fn reset(&self, shared_secret: &[u8], role: Role, other_name: &str) -> Result<RatchetState> {
        let lock = lock_for(&self.fingerprint);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut contents = self.read_file()?;
        let counterpart = role.counterpart().label();
        let before = contents.conversations.len();
        contents
            .conversations
            .retain(|c| c.name != counterpart && !(c.name == self.fingerprint && c.other_name == other_name));
        debug!(
            fingerprint = %self.fingerprint,
            purged = before - contents.conversations.len(),
            "ratchet state reset"
        );
        let keys = derive_initial_state(shared_secret, role);
        let state = RatchetState::new(&keys, &self.fingerprint, other_name, role);
        contents.conversations.push(state.clone());
        self.write_file(&contents)?;
        Ok(state)
    }

    /// role_of reads which side of the conversation this installation plays
    pub fn role_of(&self, other_name: &str) -> Result<Option<Role>> {
        Ok(self.load(other_name)?.map(|state| state.role))
    }

    /// with_state runs load -> f -> save as one critical section.
    ///
    /// The advanced state is saved only when `f` succeeds, and a failed save is
    /// returned to the caller.
    pub fn with_state<T>(&self, other_name: &str, f: impl FnOnce(&mut RatchetState) -> Result<T>) -> Result<T> {
        let lock = lock_for(&self.fingerprint);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut contents = self.read_file()?;
        let Some(i) = Self::position(&contents, &self.fingerprint, other_name) else {
            return Err(NymError::StateNotFound(format!("{} -> {}", self.fingerprint, other_name)));
        };
        let mut state = contents.conversations[i].clone();
        let output = f(&mut state)?;
        contents.conversations[i] = state;
        self.write_file(&contents)?;
        Ok(output)
    }

    /// destroy deletes the backing file (identity deletion)
    pub fn destroy(self) -> Result<()> {
        let lock = lock_for(&self.fingerprint);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|_| NymError::StoreUnavailable(self.path.clone()))?;
            debug!(fingerprint = %self.fingerprint, "ratchet store deleted");
        }
        Ok(())
    }
}

/* ------------------------------------------------------------------------- */

// TESTS
