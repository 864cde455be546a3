//! The client facade a user interface drives.
//!
//! `Client` wires the configuration, key provider and transport together and
//! holds at most one identity session at a time.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::codec;
use crate::config::Config;
use crate::error::{NymError, Result};
use crate::inbox::{Inbox, InboxContext};
use crate::keyring::{self, KeyProvider};
use crate::messages::Message;
use crate::nym::Nym;
use crate::retrieval::{ArticleSource, RetrievalResult, RetrievalTask};
use crate::send::{SendOutcome, SendPipeline};
use crate::session::{IdentitySession, PEER_NAME};
use crate::transport::{MixmasterTransport, OutputMethod, SendmailTransport, Transport};

pub struct Client {
    config: Config,
    provider: Box<dyn KeyProvider>,
    transport: Option<Box<dyn Transport>>,
    inbox: Inbox,
    session: Option<IdentitySession>,
    retrieval: Option<RetrievalTask>,
}

impl Client {
    /// new prepares the directories and the transport picked by `config`
    pub fn new(config: Config, provider: Box<dyn KeyProvider>) -> Result<Self> {
        config.ensure_directories()?;
        let transport: Option<Box<dyn Transport>> = match config.output_method {
            OutputMethod::Mixmaster => Some(Box::new(MixmasterTransport::new(&config.mix_binary))),
            OutputMethod::Sendmail => Some(Box::<SendmailTransport>::default()),
            OutputMethod::Manual => None,
        };
        debug!(output = ?config.output_method, "client ready");
        Ok(Self {
            inbox: Inbox::new(&config),
            config,
            provider,
            transport,
            session: None,
            retrieval: None,
        })
    }

    /// with_transport replaces the transport picked from the configuration
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &dyn KeyProvider {
        self.provider.as_ref()
    }

    /// The current session, if one was started and not ended.
    pub fn session(&self) -> Option<&IdentitySession> {
        self.session.as_ref()
    }

    fn active(&self) -> Result<&IdentitySession> {
        let session = self.session.as_ref().ok_or(NymError::InactiveSession)?;
        session.require_active()?;
        Ok(session)
    }

    fn pipeline(&self) -> SendPipeline<'_> {
        SendPipeline::new(self.provider.as_ref(), self.config.output_method, self.transport.as_deref())
    }

    fn inbox_context(&self) -> Result<InboxContext<'_>> {
        let nym = self.active()?.nym();
        Ok(InboxContext {
            provider: self.provider.as_ref(),
            address: &nym.address,
            fingerprint: nym.require_fingerprint()?,
            passphrase: nym.passphrase(),
        })
    }

    /* --------------------------------------------------------------------- */
    // Keys

    /// retrieve_servers maps nym server domains to their key fingerprints
    pub fn retrieve_servers(&self) -> Result<BTreeMap<String, String>> {
        keyring::retrieve_servers(self.provider.as_ref()).map_err(NymError::provider)
    }

    /// retrieve_nyms lists the (address, fingerprint) of every local nym
    pub fn retrieve_nyms(&self) -> Result<Vec<(String, String)>> {
        keyring::retrieve_nyms(self.provider.as_ref()).map_err(NymError::provider)
    }

    /// save_key imports a server key, replacing the key of `server` when given
    pub fn save_key(&self, armor: &str, server: Option<&str>) -> Result<()> {
        if let Some(server) = server {
            self.delete_key(server)?;
        }
        self.provider.import_keys(armor).map_err(NymError::provider)
    }

    /// delete_key removes the key of nym server `server`
    pub fn delete_key(&self, server: &str) -> Result<()> {
        let servers = self.retrieve_servers()?;
        let fingerprint = servers
            .get(server)
            .ok_or_else(|| NymError::NymservNotFound(server.to_string()))?;
        self.provider.delete_keys(fingerprint, false).map_err(NymError::provider)
    }

    /* --------------------------------------------------------------------- */
    // Session

    /// start_session ends any current session and unlocks `address`
    pub fn start_session(&mut self, address: &str, passphrase: &str, creating: bool) -> Result<&IdentitySession> {
        self.end_session();
        let nym = Nym::new(address, passphrase)?;
        let session = IdentitySession::start(&self.config, self.provider.as_ref(), nym, creating)?;
        info!(address, creating, "session started");
        Ok(self.session.insert(session))
    }

    /// end_session stops retrieval and forgets the session's secrets
    pub fn end_session(&mut self) {
        self.stop_retrieval();
        if let Some(mut session) = self.session.take() {
            session.end();
        }
    }

    /* --------------------------------------------------------------------- */
    // Sending

    /// send_create generates the nym key and requests the nym's creation
    pub fn send_create(&mut self, ephemeral: &str, hsub: &str, name: &str, duration: &str) -> Result<SendOutcome> {
        let session = self.session.as_mut().ok_or(NymError::InactiveSession)?;
        SendPipeline::new(self.provider.as_ref(), self.config.output_method, self.transport.as_deref())
            .create_identity(session, ephemeral, hsub, name, duration)
    }

    /// send_config requests a configuration change; `None` when nothing was given
    pub fn send_config(&mut self, ephemeral: &str, hsub: &str, name: &str) -> Result<Option<SendOutcome>> {
        let session = self.session.as_mut().ok_or(NymError::InactiveSession)?;
        SendPipeline::new(self.provider.as_ref(), self.config.output_method, self.transport.as_deref())
            .send_config(session, ephemeral, hsub, name)
    }

    /// send_delete requests the nym's deletion; the session ends once it went out
    pub fn send_delete(&mut self) -> Result<SendOutcome> {
        let session = self.session.as_mut().ok_or(NymError::InactiveSession)?;
        let outcome = SendPipeline::new(self.provider.as_ref(), self.config.output_method, self.transport.as_deref())
            .send_delete(session)?;
        if outcome.sent {
            self.end_session();
        }
        Ok(outcome)
    }

    /// send_message sends a mail from the nym to `target`
    pub fn send_message(&self, target: &str, subject: &str, content: &str) -> Result<SendOutcome> {
        self.pipeline().send_message(self.active()?, target, subject, content)
    }

    /* --------------------------------------------------------------------- */
    // Inbox

    /// retrieve_messages lists the session nym's messages, newest first
    pub fn retrieve_messages(&self) -> Result<Vec<Message>> {
        self.inbox.list(&self.inbox_context()?)
    }

    /// count_unread_messages maps each nym to its number of unread messages
    pub fn count_unread_messages(&self) -> Result<BTreeMap<String, usize>> {
        self.inbox.count_unread()
    }

    /// decrypt_ephemeral_message opens an unread message with the ratchet.
    ///
    /// The ratchet advances, so the article can never be decrypted again: its
    /// unread file is removed and the returned message exists only in memory
    /// until saved. An inner block the provider cannot open is kept armored in
    /// the returned message.
    pub fn decrypt_ephemeral_message(&self, message: &Message) -> Result<Message> {
        let session = self.active()?;
        let nym = session.nym();
        let armored = codec::search(&message.raw)
            .ok_or_else(|| NymError::UndecipherableMessage("no armored message found".to_string()))?;
        let plaintext = codec::unwrap_and_decrypt(armored, session.store()?, PEER_NAME)?;
        let mut text = String::from_utf8_lossy(&plaintext).into_owned();

        if let Some(inner) = codec::search(&text) {
            match self.provider.decrypt(inner, nym.passphrase()) {
                Ok(decrypted) => text = decrypted,
                Err(e) => warn!(error = %e, "inner block left encrypted"),
            }
        }
        if message.identifier.exists() {
            fs::remove_file(&message.identifier)?;
            debug!(path = %message.identifier.display(), "unread message consumed");
        }
        Ok(Message::parse(false, &text, &message.identifier))
    }

    /// save_message_to_disk keeps a decrypted message, encrypted to the nym
    pub fn save_message_to_disk(&self, message: &Message) -> Result<PathBuf> {
        self.inbox.save(&self.inbox_context()?, message)
    }

    /// delete_message_from_disk removes a saved message
    pub fn delete_message_from_disk(&self, message: &Message) -> Result<()> {
        self.active()?;
        self.inbox.delete(message)
    }

    /* --------------------------------------------------------------------- */
    // Retrieval

    /// start_retrieval runs `source` in the background, replacing any running task
    pub fn start_retrieval(&mut self, source: impl ArticleSource) -> Result<()> {
        self.active()?;
        self.stop_retrieval();
        let task = RetrievalTask::start(source).map_err(|e| NymError::Io(std::io::Error::other(e.to_string())))?;
        self.retrieval = Some(task);
        Ok(())
    }

    pub fn stop_retrieval(&mut self) {
        if let Some(mut task) = self.retrieval.take() {
            task.stop();
        }
    }

    /// True when no retrieval runs or the running one finished.
    pub fn retrieval_done(&self) -> bool {
        self.retrieval.as_ref().map_or(true, RetrievalTask::is_done)
    }

    pub fn retrieval_result(&self) -> Option<RetrievalResult> {
        self.retrieval.as_ref().and_then(RetrievalTask::result)
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::MessageKey;
    use crate::kdf::Role;
    use crate::keyring::MemoryKeyring;
    use crate::store::RatchetStateStore;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    struct NoServer;

    impl ArticleSource for NoServer {
        fn fetch(&mut self, _cancel: &AtomicBool) -> Result<bool, anyhow::Error> {
            Ok(false)
        }
    }

    const ALICE: &str = "alice@nym.example";

    fn client(dir: &std::path::Path) -> Client {
        let keyring = MemoryKeyring::new();
        keyring.add_server("nym.example");
        Client::new(Config::with_base_dir(dir), Box::new(keyring)).unwrap()
    }

    #[test]
    fn operations_need_a_session() {
        let dir = tempdir().unwrap();
        let mut client = client(dir.path());
        assert!(matches!(client.send_message("a@b.org", "s", "c"), Err(NymError::InactiveSession)));
        assert!(matches!(client.send_create("e", "h", "n", "0"), Err(NymError::InactiveSession)));
        assert!(matches!(client.retrieve_messages(), Err(NymError::InactiveSession)));
        assert!(matches!(client.start_retrieval(NoServer), Err(NymError::InactiveSession)));
        assert!(client.retrieval_done());
    }

    #[test]
    fn server_keys() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());
        let servers = client.retrieve_servers().unwrap();
        assert!(servers.contains_key("nym.example"));

        let other = MemoryKeyring::new();
        let fingerprint = other.add_server("other.example");
        client.save_key(&other.export_key(&fingerprint).unwrap(), Some("nym.example")).unwrap();
        let servers = client.retrieve_servers().unwrap();
        assert_eq!(servers.keys().collect::<Vec<_>>(), vec!["other.example"]);

        assert!(matches!(client.delete_key("nym.example"), Err(NymError::NymservNotFound(_))));
        client.delete_key("other.example").unwrap();
        assert!(client.retrieve_servers().unwrap().is_empty());
    }

    #[test]
    fn delete_ends_session() {
        let dir = tempdir().unwrap();
        let mut client = client(dir.path());
        client.start_session("alice@nym.example", "pass", true).unwrap();
        client.send_create("secret", "hsub", "Alice", "0").unwrap();
        assert_eq!(client.retrieve_nyms().unwrap().len(), 1);
        client.send_delete().unwrap();
        assert!(client.session().is_none());
        assert!(client.retrieve_nyms().unwrap().is_empty());
    }

    #[test]
    fn retrieval_result_is_polled() {
        let dir = tempdir().unwrap();
        let mut client = client(dir.path());
        client.start_session("alice@nym.example", "pass", true).unwrap();
        client.send_create("secret", "hsub", "Alice", "0").unwrap();
        client.start_retrieval(NoServer).unwrap();
        let start = std::time::Instant::now();
        while !client.retrieval_done() {
            assert!(start.elapsed() < std::time::Duration::from_secs(5));
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(client.retrieval_result(), Some(RetrievalResult { server_found: false }));
        client.end_session();
        assert!(client.retrieval_result().is_none());
    }

    #[test]
    fn unreadable_inner_block_is_not_lost() {
        let dir = tempdir().unwrap();
        let mut client = client(dir.path());
        client.start_session(ALICE, "pass", true).unwrap();
        client.send_create("secret", "hsub", "Alice", "0").unwrap();

        let server_dir = dir.path().join("server");
        fs::create_dir_all(&server_dir).unwrap();
        let server = RatchetStateStore::open(&server_dir, "SERVERFP", "server-pass").unwrap();
        server.reset(b"secret", Role::Responder, ALICE).unwrap();
        let inner = codec::wrap(b"not for this keyring");
        let ratcheted = codec::encrypt_and_wrap(format!("Subject: Hi\n\n{}", inner).as_bytes(), &server, ALICE).unwrap();
        let article = client.config().unread_dir.join(MessageKey::new(ALICE, "abcde").unwrap().encode());
        fs::write(&article, ratcheted).unwrap();

        let messages = client.retrieve_messages().unwrap();
        let opened = client.decrypt_ephemeral_message(&messages[0]).unwrap();
        assert_eq!(opened.subject.as_deref(), Some("Hi"));
        assert!(opened.content.contains(&inner));
        assert!(!article.exists());
    }
}
