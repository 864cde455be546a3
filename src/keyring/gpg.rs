//! Key provider that drives the `gpg` binary in batch mode.
//!
//! Passphrases go through `--passphrase-fd 0`: the first line on stdin is the
//! passphrase and the rest is the data.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::transport::feed_and_wait;

use super::{GeneratedKey, KeyInfo, KeyParams, KeyProvider, ProviderFailure};

const BAD_PASSPHRASE_MARKERS: [&str; 3] = ["Bad passphrase", "bad passphrase", "No secret key"];

/// GnuPG backed provider.
#[derive(Debug, Clone)]
pub struct GpgKeyring {
    binary: PathBuf,
    homedir: PathBuf,
}

impl GpgKeyring {
    pub fn new(homedir: &Path) -> Self {
        Self::with_binary(Path::new("gpg"), homedir)
    }

    pub fn with_binary(binary: &Path, homedir: &Path) -> Self {
        Self { binary: binary.to_path_buf(), homedir: homedir.to_path_buf() }
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, anyhow::Error> {
        let child = Command::new(&self.binary)
            .arg("--homedir")
            .arg(&self.homedir)
            .args(["--batch", "--yes", "--no-tty", "--personal-digest-preferences=sha256", "--s2k-digest-algo=sha256"])
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let output = match stdin {
            Some(input) => feed_and_wait(child, input)?,
            None => child.wait_with_output()?,
        };
        debug!(args = ?args, status = %output.status, "gpg finished");
        Ok(output)
    }

    fn run_ok(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, anyhow::Error> {
        let output = self.run(args, stdin)?;
        if !output.status.success() {
            anyhow::bail!("gpg {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(output.stdout)
    }

    fn with_passphrase(passphrase: &str, data: &str) -> Vec<u8> {
        [passphrase.as_bytes(), b"\n", data.as_bytes()].concat()
    }

    fn failure(output: &Output) -> ProviderFailure {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if BAD_PASSPHRASE_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            ProviderFailure::BadPassphrase
        } else {
            ProviderFailure::Failed(stderr.trim().to_string())
        }
    }
}

/// created_fingerprint reads `[GNUPG:] KEY_CREATED <type> <fingerprint>` from status output
fn created_fingerprint(status: &str) -> Option<String> {
    status.lines().find_map(|line| {
        let mut fields = line.strip_prefix("[GNUPG:] KEY_CREATED ")?.split_whitespace();
        fields.next()?;
        fields.next().map(str::to_string)
    })
}

/// parse_colons reads `gpg --with-colons --list-keys` output
fn parse_colons(listing: &str) -> Vec<KeyInfo> {
    let mut keys: Vec<KeyInfo> = Vec::new();
    let mut awaiting_fingerprint = false;
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => {
                keys.push(KeyInfo { fingerprint: String::new(), uids: Vec::new() });
                awaiting_fingerprint = true;
            }
            Some("sub") => awaiting_fingerprint = false,
            Some("fpr") if awaiting_fingerprint => {
                if let (Some(key), Some(fingerprint)) = (keys.last_mut(), fields.get(9)) {
                    key.fingerprint = fingerprint.to_string();
                }
                awaiting_fingerprint = false;
            }
            Some("uid") => {
                if let (Some(key), Some(uid)) = (keys.last_mut(), fields.get(9)) {
                    key.uids.push(uid.replace("\\x3a", ":"));
                }
            }
            _ => {}
        }
    }
    keys
}

impl KeyProvider for GpgKeyring {
    fn generate_key(&self, params: &KeyParams<'_>) -> Result<GeneratedKey, anyhow::Error> {
        let script = format!(
            "Key-Type: RSA\nKey-Length: 4096\nKey-Usage: sign,auth\n\
             Subkey-Type: RSA\nSubkey-Length: 4096\nSubkey-Usage: encrypt\n\
             Name-Real: {}\nName-Email: {}\nExpire-Date: {}\nPassphrase: {}\n%commit\n",
            params.name, params.address, params.expire, params.passphrase
        );
        let output = self.run(
            &["--pinentry-mode", "loopback", "--status-fd", "1", "--gen-key"],
            Some(script.as_bytes()),
        )?;
        if !output.status.success() {
            anyhow::bail!("gpg --gen-key failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        let Some(fingerprint) = created_fingerprint(&String::from_utf8_lossy(&output.stdout)) else {
            anyhow::bail!("gpg reported no new key for {}", params.address);
        };
        let public_armor = self.export_key(&fingerprint)?;
        Ok(GeneratedKey { public_armor, fingerprint })
    }

    fn list_keys(&self) -> Result<Vec<KeyInfo>, anyhow::Error> {
        let stdout = self.run_ok(&["--with-colons", "--fixed-list-mode", "--with-fingerprint", "--list-keys"], None)?;
        Ok(parse_colons(&String::from_utf8_lossy(&stdout)))
    }

    fn import_keys(&self, armor: &str) -> Result<(), anyhow::Error> {
        self.run_ok(&["--import"], Some(armor.as_bytes()))?;
        Ok(())
    }

    fn export_key(&self, fingerprint: &str) -> Result<String, anyhow::Error> {
        let stdout = self.run_ok(&["--armor", "--export", fingerprint], None)?;
        if stdout.is_empty() {
            anyhow::bail!("no key matches {}", fingerprint);
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn delete_keys(&self, fingerprint: &str, secret_also: bool) -> Result<(), anyhow::Error> {
        let command = if secret_also { "--delete-secret-keys" } else { "--delete-keys" };
        self.run_ok(&[command, fingerprint], None)?;
        Ok(())
    }

    fn encrypt(&self, data: &str, recipients: &[String], sign_fingerprint: &str, passphrase: &str) -> Result<String, ProviderFailure> {
        let mut args = vec![
            "--pinentry-mode",
            "loopback",
            "--passphrase-fd",
            "0",
            "--trust-model",
            "always",
            "--armor",
            "--local-user",
            sign_fingerprint,
            "--sign",
            "--encrypt",
        ];
        for recipient in recipients {
            args.push("--recipient");
            args.push(recipient);
        }
        let output = self
            .run(&args, Some(&Self::with_passphrase(passphrase, data)))
            .map_err(|e| ProviderFailure::Failed(e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Self::failure(&output))
        }
    }

    fn decrypt(&self, data: &str, passphrase: &str) -> Result<String, ProviderFailure> {
        let args = ["--pinentry-mode", "loopback", "--passphrase-fd", "0", "--trust-model", "always", "--decrypt"];
        let output = self
            .run(&args, Some(&Self::with_passphrase(passphrase, data)))
            .map_err(|e| ProviderFailure::Failed(e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Self::failure(&output))
        }
    }
}

/* ------------------------------------------------------------------------- */

// TESTS
