//! On-disk message store.
//!
//! Articles fetched for a nym land in the unread directory as
//! `message_<address>_<suffix>.txt`; messages the user keeps live in the read
//! directory, encrypted to the nym itself.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand_core::{OsRng, RngCore};
use tracing::{debug, info, warn};

use crate::codec::{self, Detection};
use crate::config::Config;
use crate::error::{NymError, Result};
use crate::keyring::KeyProvider;
use crate::messages::Message;

const PREFIX: &str = "message_";
const EXTENSION: &str = ".txt";
const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// MessageKey identifies a stored message: whose it is and a disambiguating suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub address: String,
    pub suffix: String,
}

impl MessageKey {
    pub const SUFFIX_LENGTH: usize = 5;

    /// new checks that `suffix` has exactly [`Self::SUFFIX_LENGTH`] characters
    pub fn new(address: &str, suffix: &str) -> Option<Self> {
        (!address.is_empty() && suffix.chars().count() == Self::SUFFIX_LENGTH).then(|| Self {
            address: address.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// random picks a fresh suffix for `address`
    pub fn random(address: &str) -> Self {
        let mut bytes = [0u8; Self::SUFFIX_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        let suffix = bytes
            .iter()
            .map(|b| SUFFIX_CHARS[*b as usize % SUFFIX_CHARS.len()] as char)
            .collect();
        Self { address: address.to_string(), suffix }
    }

    /// File name of the message.
    pub fn encode(&self) -> String {
        format!("{}{}_{}{}", PREFIX, self.address, self.suffix, EXTENSION)
    }

    /// decode parses a file name produced by [`Self::encode`]
    pub fn decode(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_prefix(PREFIX)?.strip_suffix(EXTENSION)?;
        let (address, suffix) = stem.rsplit_once('_')?;
        Self::new(address, suffix)
    }
}

/// The identity messages are listed for.
#[derive(Clone, Copy)]
pub struct InboxContext<'a> {
    pub provider: &'a dyn KeyProvider,
    pub address: &'a str,
    pub fingerprint: &'a str,
    pub passphrase: &'a str,
}

impl InboxContext<'_> {
    fn encrypt_to_self(&self, data: &str) -> Result<String> {
        self.provider
            .encrypt(data, &[self.address.to_string()], self.fingerprint, self.passphrase)
            .map_err(|e| {
                warn!(error = %e, "could not encrypt message to self");
                NymError::IncorrectPassphrase
            })
    }
}

#[derive(Debug, Clone)]
pub struct Inbox {
    read_dir: PathBuf,
    unread_dir: PathBuf,
}

/// files lists the message files in `dir` by name; a missing directory is empty
fn files(dir: &Path) -> Result<Vec<(MessageKey, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(key) = name.to_str().and_then(MessageKey::decode) {
            files.push((key, entry.path()));
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

impl Inbox {
    pub fn new(config: &Config) -> Self {
        Self::with_dirs(&config.read_dir, &config.unread_dir)
    }

    pub fn with_dirs(read_dir: &Path, unread_dir: &Path) -> Self {
        Self { read_dir: read_dir.to_path_buf(), unread_dir: unread_dir.to_path_buf() }
    }

    pub fn read_dir(&self) -> &Path {
        &self.read_dir
    }

    pub fn unread_dir(&self) -> &Path {
        &self.unread_dir
    }

    /// list returns the messages of `ctx.address`, newest first and undated last.
    ///
    /// Read messages found in plaintext are encrypted to the nym in place.
    pub fn list(&self, ctx: &InboxContext<'_>) -> Result<Vec<Message>> {
        let mut dated = Vec::new();
        let mut undated = Vec::new();
        for (dir, read) in [(&self.unread_dir, false), (&self.read_dir, true)] {
            for (key, path) in files(dir)? {
                if key.address != ctx.address {
                    continue;
                }
                let mut data = match fs::read_to_string(&path) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable message");
                        continue;
                    }
                };
                if read {
                    data = self.open_read_message(ctx, &path, data);
                }
                let message = Message::parse(!read, &data, &path);
                if message.date.is_some() {
                    dated.push(message);
                } else {
                    undated.push(message);
                }
            }
        }
        dated.sort_by(|a, b| b.date.cmp(&a.date));
        dated.extend(undated);
        Ok(dated)
    }

    fn open_read_message(&self, ctx: &InboxContext<'_>, path: &Path, data: String) -> String {
        if codec::detect(&data) == Detection::FullMatch {
            return match ctx.provider.decrypt(&data, ctx.passphrase) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not decrypt saved message");
                    data
                }
            };
        }
        match ctx.encrypt_to_self(&data).and_then(|encrypted| fs::write(path, encrypted).map_err(NymError::from)) {
            Ok(()) => info!(path = %path.display(), "saved message is now encrypted"),
            Err(e) => warn!(path = %path.display(), error = %e, "saved message left in plaintext"),
        }
        data
    }

    /// count_unread maps each address to its number of unread messages
    pub fn count_unread(&self) -> Result<BTreeMap<String, usize>> {
        let mut counter = BTreeMap::new();
        for (key, _) in files(&self.unread_dir)? {
            *counter.entry(key.address).or_insert(0) += 1;
        }
        Ok(counter)
    }

    /// save encrypts `message` to the nym and stores it with the read messages
    pub fn save(&self, ctx: &InboxContext<'_>, message: &Message) -> Result<PathBuf> {
        let encrypted = ctx.encrypt_to_self(&message.raw)?;
        fs::create_dir_all(&self.read_dir)?;
        let path = self.read_dir.join(MessageKey::random(ctx.address).encode());
        fs::write(&path, encrypted)?;
        debug!(path = %path.display(), "message saved");
        Ok(path)
    }

    /// delete removes the file `message` was read from
    pub fn delete(&self, message: &Message) -> Result<()> {
        fs::remove_file(&message.identifier)?;
        debug!(path = %message.identifier.display(), "message deleted");
        Ok(())
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::MemoryKeyring;
    use tempfile::tempdir;

    const ADDRESS: &str = "alice@nym.example";

    #[test]
    fn key_round_trip() {
        let key = MessageKey::new("alice_b@nym.example", "ab1_9").unwrap();
        assert_eq!(key.encode(), "message_alice_b@nym.example_ab1_9.txt");
        assert_eq!(MessageKey::decode(&key.encode()), None);

        let key = MessageKey::new("alice_b@nym.example", "ab1z9").unwrap();
        assert_eq!(MessageKey::decode(&key.encode()), Some(key));

        let random = MessageKey::random(ADDRESS);
        assert_eq!(random.suffix.len(), MessageKey::SUFFIX_LENGTH);
        assert_eq!(MessageKey::decode(&random.encode()), Some(random));
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(MessageKey::decode("message_alice@nym.example_abcd.txt"), None);
        assert_eq!(MessageKey::decode("message_alice@nym.example_abcde.eml"), None);
        assert_eq!(MessageKey::decode("note_alice@nym.example_abcde.txt"), None);
        assert_eq!(MessageKey::decode("message__abcde.txt"), None);
        assert!(MessageKey::new(ADDRESS, "abcdef").is_none());
    }

    #[test]
    fn lists_counts_and_encrypts_read_messages() {
        let dir = tempdir().unwrap();
        let inbox = Inbox::with_dirs(&dir.path().join("read"), &dir.path().join("unread"));
        fs::create_dir_all(inbox.read_dir()).unwrap();
        fs::create_dir_all(inbox.unread_dir()).unwrap();
        let keyring = MemoryKeyring::new();
        let fingerprint = keyring.add_key(&["Alice <alice@nym.example>"], Some("pass"));
        let ctx = InboxContext { provider: &keyring, address: ADDRESS, fingerprint: &fingerprint, passphrase: "pass" };

        let write = |dir: &Path, suffix: &str, data: &str| {
            let path = dir.join(MessageKey::new(ADDRESS, suffix).unwrap().encode());
            fs::write(&path, data).unwrap();
            path
        };
        write(inbox.unread_dir(), "aaaaa", "Date: Tue, 1 Jul 2003 10:52:37 +0200\n\n-----BEGIN PGP MESSAGE-----\n");
        write(inbox.unread_dir(), "bbbbb", "-----BEGIN PGP MESSAGE-----\n");
        let plain = write(inbox.read_dir(), "ccccc", "From: bob@example.org\nDate: Wed, 2 Jul 2003 10:00:00 +0000\nSubject: s\n\nhi\n");
        fs::write(inbox.unread_dir().join("message_bob@nym.example_ddddd.txt"), "x").unwrap();

        let messages = inbox.list(&ctx).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].identifier, plain);
        assert!(!messages[0].is_unread);
        assert_eq!(messages[0].content, "hi\n");
        assert!(messages[1].is_unread && messages[1].date.is_some());
        assert!(messages[2].date.is_none());

        let on_disk = fs::read_to_string(&plain).unwrap();
        assert_eq!(codec::detect(&on_disk), Detection::FullMatch);
        let again = inbox.list(&ctx).unwrap();
        assert_eq!(again[0].content, "hi\n");

        let counts = inbox.count_unread().unwrap();
        assert_eq!(counts.get(ADDRESS), Some(&2));
        assert_eq!(counts.get("bob@nym.example"), Some(&1));
    }

    #[test]
    fn save_and_delete() {
        let dir = tempdir().unwrap();
        let inbox = Inbox::with_dirs(&dir.path().join("read"), &dir.path().join("unread"));
        let keyring = MemoryKeyring::new();
        let fingerprint = keyring.add_key(&["Alice <alice@nym.example>"], Some("pass"));
        let ctx = InboxContext { provider: &keyring, address: ADDRESS, fingerprint: &fingerprint, passphrase: "pass" };

        let message = Message::parse(false, "Subject: kept\n\nbody\n", Path::new("unsaved"));
        let path = inbox.save(&ctx, &message).unwrap();
        let listed = inbox.list(&ctx).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject.as_deref(), Some("kept"));

        inbox.delete(&listed[0]).unwrap();
        assert!(!path.exists());
        assert!(inbox.list(&ctx).unwrap().is_empty());
    }
}
