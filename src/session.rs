//! The identity a client is currently acting as.
//!
//! A session moves `Unauthenticated -> Authenticating -> Active -> Closed`.
//! Only an `Active` session holds the passphrase, the ratchet store handle and
//! the loaded hSub ledger; `end` drops all three.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{NymError, Result};
use crate::hsub::{HsubLedger, LedgerContext};
use crate::kdf::Role;
use crate::keyring::{retrieve_nyms, retrieve_servers, KeyProvider};
use crate::nym::Nym;
use crate::store::RatchetStateStore;

/// Name the nym server goes by in the ratchet store.
pub const PEER_NAME: &str = "a";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Active,
    Closed,
}

/// IdentitySession owns everything tied to one unlocked nym.
#[derive(Debug)]
pub struct IdentitySession {
    state: SessionState,
    nym: Nym,
    role: Role,
    db_dir: PathBuf,
    store: Option<RatchetStateStore>,
    ledger: HsubLedger,
}

impl IdentitySession {
    /// start authenticates `nym` and returns an active session.
    ///
    /// When `creating` is set the nym may not have a key yet; the store is then
    /// attached once the create request went out.
    pub fn start(config: &Config, provider: &dyn KeyProvider, nym: Nym, creating: bool) -> Result<Self> {
        let mut session = Self {
            state: SessionState::Unauthenticated,
            nym,
            role: config.ratchet_role,
            db_dir: config.db_dir.clone(),
            store: None,
            ledger: HsubLedger::new(config),
        };
        session.transition(SessionState::Authenticating);
        session.authenticate(provider, creating)?;
        session.transition(SessionState::Active);
        Ok(session)
    }

    fn authenticate(&mut self, provider: &dyn KeyProvider, creating: bool) -> Result<()> {
        let nym = &mut self.nym;
        if nym.passphrase().is_empty() {
            return Err(NymError::InvalidPassphrase);
        }
        let servers = retrieve_servers(provider).map_err(NymError::provider)?;
        if !servers.contains_key(&nym.server) {
            return Err(NymError::NymservNotFound(nym.server.clone()));
        }
        let known = retrieve_nyms(provider)
            .map_err(NymError::provider)?
            .into_iter()
            .find(|(address, _)| *address == nym.address);
        match known {
            None if !creating => return Err(NymError::NymNotFound(nym.address.clone())),
            None => debug!(address = %nym.address, "no key yet, creating a new nym"),
            Some((_, fingerprint)) => {
                if fingerprint.is_empty() {
                    return Err(NymError::FingerprintNotFound(nym.address.clone()));
                }
                fs::create_dir_all(&self.db_dir)?;
                let store = RatchetStateStore::open(&self.db_dir, &fingerprint, nym.passphrase()).map_err(|e| {
                    warn!(address = %nym.address, error = %e, "ratchet store did not open");
                    NymError::IncorrectPassphrase
                })?;
                nym.fingerprint = Some(fingerprint);
                self.store = Some(store);
            }
        }

        let ctx = LedgerContext {
            provider,
            fingerprint: nym.fingerprint.as_deref(),
            passphrase: nym.passphrase(),
        };
        let hsub = self.ledger.load(&ctx).get(&nym.address).cloned();
        if !creating {
            if hsub.is_none() {
                warn!(address = %nym.address, "no hsub passphrase recorded for this nym");
            }
            nym.hsub = hsub;
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        debug!(address = %self.nym.address, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// require_active fails with `InactiveSession` unless the session is active
    pub fn require_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(NymError::InactiveSession)
        }
    }

    pub fn nym(&self) -> &Nym {
        &self.nym
    }

    pub fn nym_mut(&mut self) -> &mut Nym {
        &mut self.nym
    }

    /// Side of the ratchet this installation plays.
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ledger(&self) -> &HsubLedger {
        &self.ledger
    }

    /// store returns the ratchet store of an active session
    pub fn store(&self) -> Result<&RatchetStateStore> {
        self.require_active()?;
        self.store
            .as_ref()
            .ok_or_else(|| NymError::StateNotFound(self.nym.address.clone()))
    }

    /// attach_store opens the store of `fingerprint` for a freshly created nym
    pub fn attach_store(&mut self, fingerprint: &str) -> Result<&RatchetStateStore> {
        self.require_active()?;
        fs::create_dir_all(&self.db_dir)?;
        let store = RatchetStateStore::open(&self.db_dir, fingerprint, self.nym.passphrase())
            .map_err(|_| NymError::IncorrectPassphrase)?;
        self.nym.fingerprint = Some(fingerprint.to_string());
        Ok(self.store.insert(store))
    }

    /// take_store hands the store over, e.g. to destroy it
    pub fn take_store(&mut self) -> Option<RatchetStateStore> {
        self.store.take()
    }

    /// add_hsub records the hSub passphrase of `address` in the ledger
    pub fn add_hsub(&mut self, provider: &dyn KeyProvider, address: &str, hsub: &str) -> Result<()> {
        self.require_active()?;
        let ctx = LedgerContext {
            provider,
            fingerprint: self.nym.fingerprint.as_deref(),
            passphrase: self.nym.passphrase(),
        };
        self.ledger.add(&ctx, address, hsub)
    }

    /// delete_hsub removes `address` from the ledger
    pub fn delete_hsub(&mut self, provider: &dyn KeyProvider, address: &str) -> Result<()> {
        self.require_active()?;
        let ctx = LedgerContext {
            provider,
            fingerprint: self.nym.fingerprint.as_deref(),
            passphrase: self.nym.passphrase(),
        };
        self.ledger.delete(&ctx, address)
    }

    /// end closes the session and forgets its secrets
    pub fn end(&mut self) {
        self.store = None;
        self.ledger.clear();
        self.nym.clear_passphrase();
        self.transition(SessionState::Closed);
        info!(address = %self.nym.address, "session ended");
    }
}

/* ------------------------------------------------------------------------- */

// TESTS
