//! Public-key provider the client encrypts, signs and stores keys through.
//!
//! [`GpgKeyring`] drives a GnuPG home directory; [`MemoryKeyring`] keeps keys in
//! process and is what the tests run against.

mod gpg;
mod memory;

pub use gpg::GpgKeyring;
pub use memory::MemoryKeyring;

use std::collections::BTreeMap;

use thiserror::Error;

/// A key as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub uids: Vec<String>,
}

/// Parameters of a new nym key pair.
#[derive(Debug, Clone)]
pub struct KeyParams<'a> {
    pub name: &'a str,
    pub address: &'a str,
    pub passphrase: &'a str,
    /// GnuPG expire date syntax: "0", "1y", "6m", an ISO date...
    pub expire: &'a str,
}

/// Result of [`KeyProvider::generate_key`].
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub public_armor: String,
    pub fingerprint: String,
}

/// Why an encrypt or decrypt was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    #[error("bad passphrase or missing secret key")]
    BadPassphrase,

    #[error("no public key for recipient {0}")]
    NoRecipient(String),

    #[error("provider failure: {0}")]
    Failed(String),
}

/// The operations the client needs from a GnuPG-like provider.
pub trait KeyProvider: Send + Sync {
    fn generate_key(&self, params: &KeyParams<'_>) -> Result<GeneratedKey, anyhow::Error>;
    fn list_keys(&self) -> Result<Vec<KeyInfo>, anyhow::Error>;
    fn import_keys(&self, armor: &str) -> Result<(), anyhow::Error>;
    fn export_key(&self, fingerprint: &str) -> Result<String, anyhow::Error>;
    fn delete_keys(&self, fingerprint: &str, secret_also: bool) -> Result<(), anyhow::Error>;
    /// Encrypt `data` to `recipients` (addresses or fingerprints), signed by `sign_fingerprint`.
    fn encrypt(&self, data: &str, recipients: &[String], sign_fingerprint: &str, passphrase: &str) -> Result<String, ProviderFailure>;
    fn decrypt(&self, data: &str, passphrase: &str) -> Result<String, ProviderFailure>;
}

/// find_address returns the address token of `uid` that starts with `local@`
fn find_address<'a>(uid: &'a str, local: &str) -> Option<&'a str> {
    uid.split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')'))
        .find(|token| token.contains(local))
}

/// retrieve_servers maps each nym server domain to its key fingerprint.
///
/// A server key carries config@, send@ and url@ uids.
pub fn retrieve_servers(provider: &dyn KeyProvider) -> Result<BTreeMap<String, String>, anyhow::Error> {
    let mut servers = BTreeMap::new();
    for key in provider.list_keys()? {
        let pick = |local: &str| key.uids.iter().find_map(|uid| find_address(uid, local));
        if let (Some(config), Some(_), Some(_)) = (pick("config@"), pick("send@"), pick("url@")) {
            if let Some((_, domain)) = config.split_once('@') {
                servers.insert(domain.to_string(), key.fingerprint.clone());
            }
        }
    }
    Ok(servers)
}

/// retrieve_nyms lists (address, fingerprint) of keys that have a single uid
pub fn retrieve_nyms(provider: &dyn KeyProvider) -> Result<Vec<(String, String)>, anyhow::Error> {
    let mut nyms = Vec::new();
    for key in provider.list_keys()? {
        if key.uids.len() != 1 {
            continue;
        }
        let uid = &key.uids[0];
        let address = match (uid.find('<'), uid.rfind('>')) {
            (Some(start), Some(end)) if start < end => &uid[start + 1..end],
            _ => continue,
        };
        nyms.push((address.to_string(), key.fingerprint.clone()));
    }
    Ok(nyms)
}

/// retrieve_fingerprint finds the first key whose primary uid mentions `address`
pub fn retrieve_fingerprint(provider: &dyn KeyProvider, address: &str) -> Result<Option<String>, anyhow::Error> {
    Ok(provider
        .list_keys()?
        .into_iter()
        .find(|key| key.uids.first().is_some_and(|uid| uid.contains(address)))
        .map(|key| key.fingerprint))
}
