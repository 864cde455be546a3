//! In-process key provider.
//!
//! Enforces the same passphrase and recipient rules as GnuPG but provides no
//! confidentiality: "ciphertext" is an armored JSON envelope. Meant for tests
//! and dry runs.

use std::sync::{Mutex, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{GeneratedKey, KeyInfo, KeyParams, KeyProvider, ProviderFailure};
use crate::codec;

const PUBLIC_BEGIN: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const PUBLIC_END: &str = "-----END PGP PUBLIC KEY BLOCK-----";

struct MemoryKey {
    info: KeyInfo,
    secret: Option<Zeroizing<String>>,
}

#[derive(Serialize, Deserialize)]
struct PublicKeyBlock {
    fingerprint: String,
    uids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    recipients: Vec<String>,
    signer: String,
    data: String,
}

/// Key provider backed by a vector of keys.
#[derive(Default)]
pub struct MemoryKeyring {
    keys: Mutex<Vec<MemoryKey>>,
    generated: Mutex<u64>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_keys<T>(&self, f: impl FnOnce(&mut Vec<MemoryKey>) -> T) -> T {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut keys)
    }

    fn next_fingerprint(&self, seed: &str) -> String {
        let mut counter = self.generated.lock().unwrap_or_else(PoisonError::into_inner);
        *counter += 1;
        let digest = Sha256::digest(format!("{}:{}", seed, *counter).as_bytes());
        hex::encode_upper(&digest[..20])
    }

    /// add_key inserts a key with the given uids; a passphrase makes it a secret key.
    pub fn add_key(&self, uids: &[&str], passphrase: Option<&str>) -> String {
        let fingerprint = self.next_fingerprint(uids.first().copied().unwrap_or_default());
        self.with_keys(|keys| {
            keys.push(MemoryKey {
                info: KeyInfo {
                    fingerprint: fingerprint.clone(),
                    uids: uids.iter().map(|uid| uid.to_string()).collect(),
                },
                secret: passphrase.map(|p| Zeroizing::new(p.to_string())),
            })
        });
        fingerprint
    }

    /// add_server inserts a public nym server key for `domain`
    pub fn add_server(&self, domain: &str) -> String {
        self.add_key(
            &[
                format!("Nym Server Config <config@{}>", domain).as_str(),
                format!("Nym Server Send <send@{}>", domain).as_str(),
                format!("Nym Server Url <url@{}>", domain).as_str(),
            ],
            None,
        )
    }

    fn resolve(keys: &[MemoryKey], recipient: &str) -> Option<String> {
        keys.iter()
            .find(|key| key.info.fingerprint == recipient || key.info.uids.iter().any(|uid| uid.contains(recipient)))
            .map(|key| key.info.fingerprint.clone())
    }

    fn public_block(key: &KeyInfo) -> Result<String, anyhow::Error> {
        let json = serde_json::to_vec(&PublicKeyBlock { fingerprint: key.fingerprint.clone(), uids: key.uids.clone() })?;
        Ok(format!("{}\n\n{}\n{}\n", PUBLIC_BEGIN, BASE64.encode(json), PUBLIC_END))
    }
}

impl KeyProvider for MemoryKeyring {
    fn generate_key(&self, params: &KeyParams<'_>) -> Result<GeneratedKey, anyhow::Error> {
        let uid = format!("{} <{}>", params.name, params.address);
        let fingerprint = self.add_key(&[uid.as_str()], Some(params.passphrase));
        let public_armor = self.export_key(&fingerprint)?;
        Ok(GeneratedKey { public_armor, fingerprint })
    }

    fn list_keys(&self) -> Result<Vec<KeyInfo>, anyhow::Error> {
        Ok(self.with_keys(|keys| keys.iter().map(|key| key.info.clone()).collect()))
    }

    fn import_keys(&self, armor: &str) -> Result<(), anyhow::Error> {
        let (Some(start), Some(end)) = (armor.find(PUBLIC_BEGIN), armor.find(PUBLIC_END)) else {
            anyhow::bail!("no public key block found");
        };
        let encoded: String = armor[start + PUBLIC_BEGIN.len()..end].split_whitespace().collect();
        let block: PublicKeyBlock = serde_json::from_slice(&BASE64.decode(encoded)?)?;
        self.with_keys(|keys| match keys.iter_mut().find(|key| key.info.fingerprint == block.fingerprint) {
            Some(existing) => existing.info.uids = block.uids,
            None => keys.push(MemoryKey {
                info: KeyInfo { fingerprint: block.fingerprint, uids: block.uids },
                secret: None,
            }),
        });
        Ok(())
    }

    fn export_key(&self, fingerprint: &str) -> Result<String, anyhow::Error> {
        let info = self.with_keys(|keys| {
            keys.iter()
                .find(|key| key.info.fingerprint == fingerprint || key.info.uids.iter().any(|uid| uid.contains(fingerprint)))
                .map(|key| key.info.clone())
        });
        match info {
            Some(info) => Self::public_block(&info),
            None => anyhow::bail!("no key matches {}", fingerprint),
        }
    }

    fn delete_keys(&self, fingerprint: &str, secret_also: bool) -> Result<(), anyhow::Error> {
        self.with_keys(|keys| {
            let Some(position) = keys.iter().position(|key| key.info.fingerprint == fingerprint) else {
                anyhow::bail!("no key with fingerprint {}", fingerprint);
            };
            if secret_also {
                keys[position].secret = None;
            } else if keys[position].secret.is_some() {
                anyhow::bail!("delete the secret key of {} first", fingerprint);
            } else {
                keys.remove(position);
            }
            Ok(())
        })
    }

    fn encrypt(&self, data: &str, recipients: &[String], sign_fingerprint: &str, passphrase: &str) -> Result<String, ProviderFailure> {
        self.with_keys(|keys| {
            let keys: &[MemoryKey] = keys;
            let signer = keys
                .iter()
                .find(|key| key.info.fingerprint == sign_fingerprint)
                .ok_or(ProviderFailure::BadPassphrase)?;
            if signer.secret.as_ref().map(|secret| secret.as_str()) != Some(passphrase) {
                return Err(ProviderFailure::BadPassphrase);
            }
            let recipients = recipients
                .iter()
                .map(|r| Self::resolve(keys, r).ok_or_else(|| ProviderFailure::NoRecipient(r.clone())))
                .collect::<Result<Vec<_>, _>>()?;
            let envelope = Envelope { recipients, signer: sign_fingerprint.to_string(), data: data.to_string() };
            let json = serde_json::to_vec(&envelope).map_err(|e| ProviderFailure::Failed(e.to_string()))?;
            Ok(codec::wrap(&json))
        })
    }

    fn decrypt(&self, data: &str, passphrase: &str) -> Result<String, ProviderFailure> {
        let raw = codec::unwrap(data).map_err(|e| ProviderFailure::Failed(e.to_string()))?;
        let envelope: Envelope = serde_json::from_slice(&raw).map_err(|e| ProviderFailure::Failed(e.to_string()))?;
        self.with_keys(|keys| {
            let unlocked = keys.iter().any(|key| {
                envelope.recipients.contains(&key.info.fingerprint)
                    && key.secret.as_ref().map(|secret| secret.as_str()) == Some(passphrase)
            });
            if unlocked {
                Ok(envelope.data.clone())
            } else {
                Err(ProviderFailure::BadPassphrase)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_requires_signer_passphrase() {
        let keyring = MemoryKeyring::new();
        let alice = keyring.add_key(&["Alice <alice@nym.example>"], Some("pass"));
        let recipients = vec!["alice@nym.example".to_string()];
        assert!(keyring.encrypt("hi", &recipients, &alice, "pass").is_ok());
        assert_eq!(keyring.encrypt("hi", &recipients, &alice, "nope"), Err(ProviderFailure::BadPassphrase));
        assert_eq!(
            keyring.encrypt("hi", &["nobody@x.org".to_string()], &alice, "pass"),
            Err(ProviderFailure::NoRecipient("nobody@x.org".to_string()))
        );
    }

    #[test]
    fn decrypt_requires_recipient_secret() {
        let keyring = MemoryKeyring::new();
        let alice = keyring.add_key(&["Alice <alice@nym.example>"], Some("alice"));
        let server = keyring.add_server("nym.example");
        let to_server = keyring.encrypt("cfg", &["config@nym.example".to_string()], &alice, "alice").unwrap();
        assert_eq!(keyring.decrypt(&to_server, "alice"), Err(ProviderFailure::BadPassphrase));
        let to_self = keyring.encrypt("mine", &["alice@nym.example".to_string()], &alice, "alice").unwrap();
        assert_eq!(keyring.decrypt(&to_self, "alice").unwrap(), "mine");
        assert!(keyring.list_keys().unwrap().iter().any(|k| k.fingerprint == server));
    }

    #[test]
    fn export_import_and_delete() {
        let source = MemoryKeyring::new();
        let server = source.add_server("nym.example");
        let armor = source.export_key(&server).unwrap();

        let target = MemoryKeyring::new();
        target.import_keys(&armor).unwrap();
        assert_eq!(target.list_keys().unwrap()[0].fingerprint, server);

        target.delete_keys(&server, false).unwrap();
        assert!(target.list_keys().unwrap().is_empty());
    }

    #[test]
    fn secret_key_must_go_first() {
        let keyring = MemoryKeyring::new();
        let key = keyring
            .generate_key(&KeyParams { name: "Alice", address: "alice@nym.example", passphrase: "p", expire: "0" })
            .unwrap();
        assert!(key.public_armor.contains(PUBLIC_BEGIN));
        assert!(keyring.delete_keys(&key.fingerprint, false).is_err());
        keyring.delete_keys(&key.fingerprint, true).unwrap();
        keyring.delete_keys(&key.fingerprint, false).unwrap();
        assert!(keyring.list_keys().unwrap().is_empty());
    }
}
