//! hSub passphrase ledger.
//!
//! Maps each nym address to the hSub passphrase its messages are tagged with,
//! plus a reserved `time` entry holding the retrieval cursor. The ledger lives
//! either in a plaintext file or in a file encrypted to every known nym; load
//! reconciles the two and migrates to the encrypted form when it can.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::keyring::{retrieve_nyms, KeyProvider};

/// Reserved key holding the retrieval cursor.
pub const TIME_KEY: &str = "time";

/// address (or `time`) -> value
pub type Entries = BTreeMap<String, String>;

/// Who is reading or writing the ledger.
#[derive(Clone, Copy)]
pub struct LedgerContext<'a> {
    pub provider: &'a dyn KeyProvider,
    /// Signing identity; without one the ledger can only be stored in plaintext.
    pub fingerprint: Option<&'a str>,
    pub passphrase: &'a str,
}

/// parse reads `key value` lines; malformed lines are skipped
pub fn parse(text: &str) -> Entries {
    let mut entries = Entries::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(key), Some(value), None) => {
                entries.insert(key.to_string(), value.to_string());
            }
            (None, _, _) => {}
            _ => warn!("skipping malformed hsub ledger line"),
        }
    }
    entries
}

/// format writes one `key value` line per entry
pub fn format(entries: &Entries) -> String {
    entries.iter().map(|(key, value)| format!("{} {}\n", key, value)).collect()
}

/// merge reconciles the plaintext and decrypted ledgers.
///
/// On conflicting keys the side with the smaller `time` wins, so the older
/// retrieval cursor is carried forward. When either side lacks `time` the
/// decrypted entries win.
pub fn merge(plain: Entries, decrypted: Entries) -> Entries {
    let plain_is_older = match (plain.get(TIME_KEY), decrypted.get(TIME_KEY)) {
        (Some(p), Some(d)) => p < d,
        _ => false,
    };
    let (mut base, top) = if plain_is_older { (decrypted, plain) } else { (plain, decrypted) };
    base.extend(top);
    base
}

/// The ledger of this installation and its in-memory entries.
#[derive(Debug, Clone)]
pub struct HsubLedger {
    plain_path: PathBuf,
    encrypted_path: PathBuf,
    entries: Entries,
}

impl HsubLedger {
    pub fn new(config: &Config) -> Self {
        Self::with_paths(&config.hsub_file, &config.encrypted_hsub_file)
    }

    pub fn with_paths(plain_path: &Path, encrypted_path: &Path) -> Self {
        Self {
            plain_path: plain_path.to_path_buf(),
            encrypted_path: encrypted_path.to_path_buf(),
            entries: Entries::new(),
        }
    }

    /// Entries as of the last load or mutation.
    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    /// clear forgets the cached entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// hSub passphrase of `address`, if recorded.
    pub fn get(&self, address: &str) -> Option<&str> {
        self.entries.get(address).map(String::as_str)
    }

    fn decrypt_file(&self, ctx: &LedgerContext<'_>) -> Option<String> {
        let data = match fs::read_to_string(&self.encrypted_path) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "encrypted hsub ledger unreadable");
                return None;
            }
        };
        match ctx.provider.decrypt(&data, ctx.passphrase) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "encrypted hsub ledger could not be decrypted, treating as absent");
                None
            }
        }
    }

    /// load reads both backing files, merges them and caches the result.
    ///
    /// Unreadable or undecryptable files count as absent. Entries found only
    /// in plaintext are re-saved so they end up encrypted.
    pub fn load(&mut self, ctx: &LedgerContext<'_>) -> &Entries {
        let mut entries = match fs::read_to_string(&self.plain_path) {
            Ok(text) => parse(&text),
            Err(_) => Entries::new(),
        };
        let mut resave = false;
        if self.encrypted_path.exists() {
            if let Some(text) = self.decrypt_file(ctx) {
                let decrypted = parse(&text);
                if entries.is_empty() {
                    entries = decrypted;
                } else {
                    resave = true;
                    entries = merge(entries, decrypted);
                }
            }
        } else {
            resave = true;
        }
        if resave && !entries.is_empty() {
            if let Err(e) = self.save(ctx, &entries) {
                warn!(error = %e, "could not re-save hsub ledger");
            }
        }
        self.entries = entries;
        &self.entries
    }

    /// save writes `entries`, encrypted when the context may do so.
    ///
    /// Encryption needs a signing fingerprint and either no encrypted file yet
    /// or one this context can decrypt. After an encrypted save the plaintext
    /// file is removed.
    pub fn save(&self, ctx: &LedgerContext<'_>, entries: &Entries) -> Result<()> {
        let data = format(entries);
        if let Some(encrypted) = self.try_encrypt(ctx, &data) {
            write_private(&self.encrypted_path, &encrypted)?;
            if self.plain_path.exists() {
                fs::remove_file(&self.plain_path)?;
            }
            info!(path = %self.encrypted_path.display(), "hsub ledger encrypted and saved");
            return Ok(());
        }
        write_private(&self.plain_path, &data)?;
        debug!(path = %self.plain_path.display(), "hsub ledger saved in plaintext");
        Ok(())
    }

    fn try_encrypt(&self, ctx: &LedgerContext<'_>, data: &str) -> Option<String> {
        let fingerprint = ctx.fingerprint?;
        if self.encrypted_path.exists() && self.decrypt_file(ctx).is_none() {
            return None;
        }
        let recipients: Vec<String> = match retrieve_nyms(ctx.provider) {
            Ok(nyms) => nyms.into_iter().map(|(address, _)| address).collect(),
            Err(e) => {
                warn!(error = %e, "could not list nyms for the hsub ledger");
                return None;
            }
        };
        match ctx.provider.encrypt(data, &recipients, fingerprint, ctx.passphrase) {
            Ok(encrypted) => Some(encrypted),
            Err(e) => {
                warn!(error = %e, "hsub ledger encryption failed, falling back to plaintext");
                None
            }
        }
    }

    /// add records `hsub` for `address` and saves
    pub fn add(&mut self, ctx: &LedgerContext<'_>, address: &str, hsub: &str) -> Result<()> {
        self.entries.insert(address.to_string(), hsub.to_string());
        self.save(ctx, &self.entries)
    }

    /// delete drops `address`; a ledger left without real entries loses its file
    pub fn delete(&mut self, ctx: &LedgerContext<'_>, address: &str) -> Result<()> {
        self.entries.remove(address);
        let only_time = self.entries.keys().all(|key| key == TIME_KEY);
        if !only_time {
            return self.save(ctx, &self.entries);
        }
        let path = if self.encrypted_path.exists() && self.decrypt_file(ctx).is_some() {
            &self.encrypted_path
        } else {
            &self.plain_path
        };
        if path.exists() {
            fs::remove_file(path)?;
            info!(path = %path.display(), "hsub ledger emptied, file deleted");
        }
        Ok(())
    }
}

fn write_private(path: &Path, data: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/* ------------------------------------------------------------------------- */

// TESTS
