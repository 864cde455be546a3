//! Initial ratchet key derivation from a shared "ephemeral key".
//!
//! Both parties run [`derive_initial_state`] over the same secret with opposite
//! roles. The send and receive slots are swapped for the responder, so each
//! side's sending keys are the other side's receiving keys and no live
//! handshake is needed.

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// KEY_LENGTH is the SHA-256 digest length
pub const KEY_LENGTH: usize = 32;
/// PBKDF2_ROUNDS is fixed so both parties derive the same keys
pub const PBKDF2_ROUNDS: u32 = 10;

const SALT_RK: u8 = 0x00;
const SALT_HK_A: u8 = 0x01;
const SALT_HK_B: u8 = 0x02;
const SALT_NHK_A: u8 = 0x03;
const SALT_NHK_B: u8 = 0x04;
const SALT_CK_A: u8 = 0x05;
const SALT_CK_B: u8 = 0x06;
const SALT_CONV_ID: u8 = 0x07;

/// Which side of the conversation this installation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// "alice" mode: salts map directly to slots.
    Initiator,
    /// "bob" mode: send/receive salts are swapped.
    Responder,
}

impl Role {
    /// The opposite role.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// Conversation label of a party playing this role.
    pub fn label(self) -> &'static str {
        match self {
            Self::Initiator => "a",
            Self::Responder => "b",
        }
    }
}

/// The eight keys of a freshly bootstrapped ratchet.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct InitialKeys {
    pub rk: [u8; KEY_LENGTH],
    pub hks: [u8; KEY_LENGTH],
    pub hkr: [u8; KEY_LENGTH],
    pub nhks: [u8; KEY_LENGTH],
    pub nhkr: [u8; KEY_LENGTH],
    pub cks: [u8; KEY_LENGTH],
    pub ckr: [u8; KEY_LENGTH],
    pub conv_id: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for InitialKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitialKeys")
            .field("conv_id", &hex::encode(self.conv_id))
            .finish_non_exhaustive()
    }
}

/// mkey is the SHA-256 digest of the shared secret
pub fn mkey(shared_secret: &[u8]) -> [u8; KEY_LENGTH] {
    Sha256::digest(shared_secret).into()
}

fn stretch(mkey: &[u8; KEY_LENGTH], salt: u8) -> [u8; KEY_LENGTH] {
    let mut out = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(mkey, &[salt], PBKDF2_ROUNDS, &mut out);
    out
}

/// derive_initial_state turns a shared secret into the role-aware initial keys.
///
/// Pure function. The caller guarantees the secret is non-empty.
pub fn derive_initial_state(shared_secret: &[u8], role: Role) -> InitialKeys {
    let mut mkey = mkey(shared_secret);
    let (hks, hkr, nhks, nhkr, cks, ckr) = match role {
        Role::Initiator => (SALT_HK_A, SALT_HK_B, SALT_NHK_A, SALT_NHK_B, SALT_CK_A, SALT_CK_B),
        Role::Responder => (SALT_HK_B, SALT_HK_A, SALT_NHK_B, SALT_NHK_A, SALT_CK_B, SALT_CK_A),
    };
    let keys = InitialKeys {
        rk: stretch(&mkey, SALT_RK),
        hks: stretch(&mkey, hks),
        hkr: stretch(&mkey, hkr),
        nhks: stretch(&mkey, nhks),
        nhkr: stretch(&mkey, nhkr),
        cks: stretch(&mkey, cks),
        ckr: stretch(&mkey, ckr),
        conv_id: stretch(&mkey, SALT_CONV_ID),
    };
    mkey.zeroize();
    keys
}

/* ------------------------------------------------------------------------- */

// TESTS
