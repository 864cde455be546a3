//! A pseudonymous identity on a nym server.

use zeroize::Zeroizing;

use crate::error::{NymError, Result};

/// Nym binds an address to the secrets needed to act as it.
///
/// `fingerprint` is only set once the key provider holds the nym's key, and
/// `hsub` once the ledger (or the creation flow) supplies it.
pub struct Nym {
    pub address: String,
    passphrase: Zeroizing<String>,
    pub fingerprint: Option<String>,
    pub hsub: Option<String>,
    pub server: String,
}

impl std::fmt::Debug for Nym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nym")
            .field("address", &self.address)
            .field("fingerprint", &self.fingerprint)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// is_valid_address accepts `local@domain.tld` without whitespace or brackets
pub fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    let forbidden = |c: char| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')' | ',' | ';' | '@');
    !local.is_empty()
        && !local.contains(forbidden)
        && !domain.contains(forbidden)
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

impl Nym {
    /// new validates the address and derives the server from its domain
    pub fn new(address: &str, passphrase: &str) -> Result<Self> {
        let address = address.trim();
        if !is_valid_address(address) {
            return Err(NymError::InvalidEmailAddress(address.to_string()));
        }
        let server = address
            .split_once('@')
            .map(|(_, domain)| domain.to_string())
            .ok_or_else(|| NymError::InvalidEmailAddress(address.to_string()))?;
        Ok(Self {
            address: address.to_string(),
            passphrase: Zeroizing::new(passphrase.to_string()),
            fingerprint: None,
            hsub: None,
            server,
        })
    }

    /// Passphrase of the nym's key and ratchet store.
    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// The fingerprint, or `FingerprintNotFound` when it has not been resolved.
    pub fn require_fingerprint(&self) -> Result<&str> {
        self.fingerprint
            .as_deref()
            .ok_or_else(|| NymError::FingerprintNotFound(self.address.clone()))
    }

    /// config@ address of the nym's server
    pub fn config_address(&self) -> String {
        format!("config@{}", self.server)
    }

    /// send@ address of the nym's server
    pub fn send_address(&self) -> String {
        format!("send@{}", self.server)
    }

    /// clear_passphrase overwrites the passphrase in memory
    pub fn clear_passphrase(&mut self) {
        self.passphrase = Zeroizing::new(String::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_comes_from_domain() {
        let nym = Nym::new("alice@example.org", "pass").unwrap();
        assert_eq!(nym.server, "example.org");
        assert_eq!(nym.config_address(), "config@example.org");
        assert_eq!(nym.send_address(), "send@example.org");
        assert!(nym.fingerprint.is_none());
    }

    #[test]
    fn rejects_invalid_addresses() {
        for address in ["alice", "@example.org", "alice@", "alice@example", "a b@example.org", "a@b@c.org", "alice@example..org"] {
            assert!(
                matches!(Nym::new(address, "pass"), Err(NymError::InvalidEmailAddress(_))),
                "{} should be rejected",
                address
            );
        }
    }

    #[test]
    fn missing_fingerprint_is_typed() {
        let nym = Nym::new("alice@example.org", "pass").unwrap();
        assert!(matches!(nym.require_fingerprint(), Err(NymError::FingerprintNotFound(_))));
    }

    #[test]
    fn clear_passphrase() {
        let mut nym = Nym::new("alice@example.org", "pass").unwrap();
        nym.clear_passphrase();
        assert_eq!(nym.passphrase(), "");
    }
}
