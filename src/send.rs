//! Outbound requests to the nym server.
//!
//! Every request follows the same path: build the body, encrypt and sign it to
//! a server address, then hand it to the transport or back to the caller.
//! Ratchet store and ledger changes happen only after the send went through.

use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{NymError, Result};
use crate::keyring::{KeyParams, KeyProvider};
use crate::session::{IdentitySession, PEER_NAME};
use crate::transport::{OutputMethod, Transport};

/// Body of a delete request.
pub const DELETE_BODY: &str = "delete: yes";

/// What happened to an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// False only when the transport refused the message.
    pub sent: bool,
    /// Human readable status, ends with a blank line.
    pub info: String,
    /// The armored request, for manual dispatch or display.
    pub ciphertext: String,
}

/// create_body builds the body of a nym creation request
pub fn create_body(ephemeral: &str, hsub: &str, public_armor: &str) -> String {
    format!("ephemeral: {}\nhsub: {}\n{}", ephemeral, hsub, public_armor)
}

/// config_body builds a configuration request; `None` when nothing changes
pub fn config_body(ephemeral: &str, hsub: &str, name: &str) -> Option<String> {
    let mut body = String::new();
    for (key, value) in [("ephemeral", ephemeral), ("hsub", hsub), ("name", name)] {
        if !value.is_empty() {
            body.push_str(&format!("{}: {}\n", key, value));
        }
    }
    (!body.is_empty()).then_some(body)
}

/// message_body builds the mail the nym server relays
pub fn message_body(target: &str, subject: &str, content: &str) -> String {
    format!("To: {}\nSubject: {}\n\n{}", target, subject, content)
}

/// SendPipeline encrypts requests and dispatches them per the output method.
pub struct SendPipeline<'a> {
    provider: &'a dyn KeyProvider,
    output: OutputMethod,
    transport: Option<&'a dyn Transport>,
}

impl<'a> SendPipeline<'a> {
    pub fn new(provider: &'a dyn KeyProvider, output: OutputMethod, transport: Option<&'a dyn Transport>) -> Self {
        Self { provider, output, transport }
    }

    /// encrypt_and_send signs `data` as `fingerprint` and encrypts it to `recipient`.
    ///
    /// A provider refusal is `IncorrectPassphrase`. A transport failure is not
    /// an error: the outcome reports `sent: false`.
    pub fn encrypt_and_send(&self, data: &str, recipient: &str, fingerprint: &str, passphrase: &str) -> Result<SendOutcome> {
        let ciphertext = self
            .provider
            .encrypt(data, &[recipient.to_string()], fingerprint, passphrase)
            .map_err(|e| {
                warn!(recipient, error = %e, "request could not be encrypted");
                NymError::IncorrectPassphrase
            })?;

        if !self.output.is_automatic() {
            return Ok(SendOutcome {
                sent: true,
                info: format!("Send the following message to {}\n\n", recipient),
                ciphertext,
            });
        }
        let Some(transport) = self.transport else {
            return Err(NymError::SendFailed(recipient.to_string()));
        };
        let mail = format!("To: {}\nSubject: test\n\n{}", recipient, ciphertext);
        match transport.send(mail.as_bytes()) {
            Ok(()) => {
                info!(recipient, output = ?self.output, "request sent");
                Ok(SendOutcome {
                    sent: true,
                    info: format!("The following message was successfully sent to {}\n\n", recipient),
                    ciphertext,
                })
            }
            Err(e) => {
                warn!(recipient, error = %e, "transport failed");
                Ok(SendOutcome {
                    sent: false,
                    info: format!("ERROR! The following message could not be sent to {}\n\n", recipient),
                    ciphertext,
                })
            }
        }
    }

    /// create_identity generates the nym key and asks the server to create the nym.
    ///
    /// On success the ratchet state is derived from `ephemeral` and the hSub
    /// passphrase is recorded. On failure the generated key is removed again.
    pub fn create_identity(
        &self,
        session: &mut IdentitySession,
        ephemeral: &str,
        hsub: &str,
        name: &str,
        duration: &str,
    ) -> Result<SendOutcome> {
        session.require_active()?;
        if ephemeral.is_empty() {
            return Err(NymError::InvalidEphemeralKey);
        }
        if hsub.is_empty() {
            return Err(NymError::InvalidHsub);
        }
        let nym = session.nym();
        let recipient = nym.config_address();
        let key = self
            .provider
            .generate_key(&KeyParams { name, address: &nym.address, passphrase: nym.passphrase(), expire: duration })
            .map_err(NymError::provider)?;
        debug!(address = %nym.address, fingerprint = %key.fingerprint, "nym key generated");

        let body = create_body(ephemeral, hsub, &key.public_armor);
        let outcome = self.encrypt_and_send(&body, &recipient, &key.fingerprint, nym.passphrase());
        if !matches!(outcome, Ok(SendOutcome { sent: true, .. })) {
            self.discard_key(&key.fingerprint);
            return outcome;
        }

        let role = session.role();
        let store = session.attach_store(&key.fingerprint)?;
        store.reset(ephemeral.as_bytes(), role, PEER_NAME)?;
        let address = session.nym().address.clone();
        session.nym_mut().hsub = Some(hsub.to_string());
        session.add_hsub(self.provider, &address, hsub)?;
        info!(address = %address, "nym creation requested");
        outcome
    }

    fn discard_key(&self, fingerprint: &str) {
        for secret_also in [true, false] {
            if let Err(e) = self.provider.delete_keys(fingerprint, secret_also) {
                warn!(fingerprint, error = %e, "could not remove the unused nym key");
            }
        }
    }

    /// send_config asks the server to change the nym; `None` when nothing was given.
    ///
    /// A new `ephemeral` resets the ratchet state and a new `hsub` is recorded,
    /// both only once the request was sent.
    pub fn send_config(&self, session: &mut IdentitySession, ephemeral: &str, hsub: &str, name: &str) -> Result<Option<SendOutcome>> {
        session.require_active()?;
        let Some(body) = config_body(ephemeral, hsub, name) else {
            return Ok(None);
        };
        let nym = session.nym();
        let outcome = self.encrypt_and_send(&body, &nym.config_address(), nym.require_fingerprint()?, nym.passphrase())?;
        if !outcome.sent {
            return Ok(Some(outcome));
        }
        if !ephemeral.is_empty() {
            session.store()?.reset(ephemeral.as_bytes(), session.role(), PEER_NAME)?;
            info!(address = %session.nym().address, "ratchet state reset");
        }
        if !hsub.is_empty() {
            let address = session.nym().address.clone();
            session.nym_mut().hsub = Some(hsub.to_string());
            session.add_hsub(self.provider, &address, hsub)?;
        }
        Ok(Some(outcome))
    }

    /// send_delete asks the server to delete the nym, then removes every local trace of it
    pub fn send_delete(&self, session: &mut IdentitySession) -> Result<SendOutcome> {
        session.require_active()?;
        let nym = session.nym();
        let fingerprint = nym.require_fingerprint()?.to_string();
        let outcome = self.encrypt_and_send(DELETE_BODY, &nym.config_address(), &fingerprint, nym.passphrase())?;
        if !outcome.sent {
            return Ok(outcome);
        }
        if let Some(store) = session.take_store() {
            store.destroy()?;
        }
        let address = session.nym().address.clone();
        session.delete_hsub(self.provider, &address)?;
        self.provider.delete_keys(&fingerprint, true).map_err(NymError::provider)?;
        self.provider.delete_keys(&fingerprint, false).map_err(NymError::provider)?;
        info!(address = %address, "nym deleted");
        Ok(outcome)
    }

    /// send_message ratchet-encrypts a mail and sends it through the nym server.
    ///
    /// The ratchet advances as soon as the message is encrypted, whatever the
    /// transport does afterwards.
    pub fn send_message(&self, session: &IdentitySession, target: &str, subject: &str, content: &str) -> Result<SendOutcome> {
        let store = session.store()?;
        let nym = session.nym();
        let fingerprint = nym.require_fingerprint()?;
        let body = message_body(target, subject, content);
        let armored = codec::encrypt_and_wrap(body.as_bytes(), store, PEER_NAME)?;
        self.encrypt_and_send(&armored, &nym.send_address(), fingerprint, nym.passphrase())
    }
}

/* ------------------------------------------------------------------------- */

// TESTS
