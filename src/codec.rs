//! Armor framing for ratchet ciphertext.
//!
//! Ratchet messages travel in the same envelope as PGP messages, so one
//! detector recognises both kinds on the broadcast channel:
//!
//! ```text
//! -----BEGIN PGP MESSAGE-----
//!
//! <base64, 64 characters per line>
//! -----END PGP MESSAGE-----
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{NymError, Result};
use crate::store::RatchetStateStore;

/// BEGIN_MARKER opens an armored block
pub const BEGIN_MARKER: &str = "-----BEGIN PGP MESSAGE-----";
/// END_MARKER closes an armored block
pub const END_MARKER: &str = "-----END PGP MESSAGE-----";
/// LINE_LENGTH is the base64 line width
pub const LINE_LENGTH: usize = 64;

/// Outcome of [`detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// The whole text is one armored block.
    FullMatch,
    /// No block, or a block with something around it.
    PartialOrAbsent,
}

/// wrap base64 encodes the ciphertext and frames it
pub fn wrap(ciphertext: &[u8]) -> String {
    let encoded = BASE64.encode(ciphertext);
    let mut armored = String::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH + 64);
    armored.push_str(BEGIN_MARKER);
    armored.push_str("\n\n");
    // base64 output is ASCII, so byte chunks are valid UTF-8
    for line in encoded.as_bytes().chunks(LINE_LENGTH) {
        armored.push_str(&String::from_utf8_lossy(line));
        armored.push('\n');
    }
    armored.push_str(END_MARKER);
    armored.push('\n');
    armored
}

/// detect reports whether `text` starts with the begin marker and ends with the
/// end marker (one trailing newline allowed)
pub fn detect(text: &str) -> Detection {
    let body = text.strip_suffix('\n').unwrap_or(text);
    if text.starts_with(BEGIN_MARKER) && body.ends_with(END_MARKER) && body.len() >= BEGIN_MARKER.len() + END_MARKER.len() {
        Detection::FullMatch
    } else {
        Detection::PartialOrAbsent
    }
}

/// search returns the armored block inside `text`, from the first begin marker
/// to the last end marker
pub fn search(text: &str) -> Option<&str> {
    let start = text.find(BEGIN_MARKER)?;
    let end = text[start..].rfind(END_MARKER)? + start + END_MARKER.len();
    if end < start + BEGIN_MARKER.len() + END_MARKER.len() {
        return None;
    }
    Some(&text[start..end])
}

/// unwrap extracts the binary payload of the first armored block in `text`.
///
/// Armor headers (`Key: value` lines before the blank line) and a trailing
/// `=XXXX` checksum line are skipped.
pub fn unwrap(text: &str) -> Result<Vec<u8>, anyhow::Error> {
    let Some(block) = search(text) else {
        anyhow::bail!("no armored block found");
    };
    let inner = &block[BEGIN_MARKER.len()..block.len() - END_MARKER.len()];
    let mut in_headers = true;
    let mut encoded = String::new();
    for line in inner.lines().map(str::trim) {
        if line.is_empty() {
            in_headers = false;
            continue;
        }
        if in_headers && line.contains(": ") {
            continue;
        }
        in_headers = false;
        if line.starts_with('=') && line.len() == 5 {
            continue;
        }
        encoded.push_str(line);
    }
    if encoded.is_empty() {
        anyhow::bail!("armored block is empty");
    }
    Ok(BASE64.decode(encoded)?)
}

/// unwrap_and_decrypt decrypts an armored ratchet message with the stored state
/// of the conversation with `other_name`. The advanced state is saved before
/// the plaintext is returned; a failed save is an error.
pub fn unwrap_and_decrypt(armored: &str, store: &RatchetStateStore, other_name: &str) -> Result<Vec<u8>> {
    let ciphertext = unwrap(armored).map_err(|e| NymError::UndecipherableMessage(e.to_string()))?;
    store.with_state(other_name, |state| {
        state
            .decrypt(&ciphertext)
            .map_err(|e| NymError::UndecipherableMessage(e.to_string()))
    })
}

/// encrypt_and_wrap is the outbound counterpart of [`unwrap_and_decrypt`]
pub fn encrypt_and_wrap(plaintext: &[u8], store: &RatchetStateStore, other_name: &str) -> Result<String> {
    let ciphertext = store.with_state(other_name, |state| {
        state
            .encrypt(plaintext)
            .map_err(|e| NymError::UndecipherableMessage(e.to_string()))
    })?;
    Ok(wrap(&ciphertext))
}

/* ------------------------------------------------------------------------- */

// TESTS
