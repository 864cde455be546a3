//! A nym talking to a stand-in for its server, through the public API.

use std::fs;

use nymphemeral::keyring::{KeyProvider, MemoryKeyring};
use nymphemeral::{
    encrypt_and_wrap, unwrap_and_decrypt, Client, Config, MessageKey, NymError, RatchetStateStore, Role,
    SessionState, PEER_NAME,
};
use tempfile::{tempdir, TempDir};

const ALICE: &str = "alice@example.org";
const ALICE_PASS: &str = "alice-pass";
const SERVER_PASS: &str = "server-pass";
const SECRET: &[u8] = b"shared-secret-1";

struct World {
    _dir: TempDir,
    client: Client,
    server_fingerprint: String,
    bob: RatchetStateStore,
}

/// world sets up a client for alice and bob's side of the ratchet.
///
/// The server key carries a secret so the test can open what the client sends.
fn world() -> World {
    let dir = tempdir().unwrap();
    let keyring = MemoryKeyring::new();
    let server_fingerprint = keyring.add_key(
        &[
            "Nym Config <config@example.org>",
            "Nym Send <send@example.org>",
            "Nym Url <url@example.org>",
        ],
        Some(SERVER_PASS),
    );
    let client = Client::new(Config::with_base_dir(&dir.path().join("alice")), Box::new(keyring)).unwrap();

    let bob_db = dir.path().join("bob");
    fs::create_dir_all(&bob_db).unwrap();
    let bob = RatchetStateStore::open(&bob_db, "bob@example.org", "bob-pass").unwrap();
    bob.reset(SECRET, Role::Responder, ALICE).unwrap();

    World { _dir: dir, client, server_fingerprint, bob }
}

fn create_alice(world: &mut World) {
    world.client.start_session(ALICE, ALICE_PASS, true).unwrap();
    let outcome = world
        .client
        .send_create("shared-secret-1", "alice-hsub", "Alice", "0")
        .unwrap();
    assert!(outcome.sent);
    assert_eq!(outcome.info, "Send the following message to config@example.org\n\n");

    let request = world.client.provider().decrypt(&outcome.ciphertext, SERVER_PASS).unwrap();
    assert!(request.starts_with("ephemeral: shared-secret-1\nhsub: alice-hsub\n-----BEGIN PGP PUBLIC KEY BLOCK-----"));
}

#[test]
fn hello_reaches_the_responder() {
    let mut world = world();
    create_alice(&mut world);

    let store = world.client.session().unwrap().store().unwrap();
    let armored = encrypt_and_wrap(b"hello", store, PEER_NAME).unwrap();
    let plaintext = unwrap_and_decrypt(&armored, &world.bob, ALICE).unwrap();
    assert_eq!(plaintext, b"hello");
}

#[test]
fn mail_out_and_reply_in() {
    let mut world = world();
    create_alice(&mut world);

    // Outbound: the server opens the PGP layer, then the ratchet.
    let outcome = world.client.send_message("carol@example.net", "Lunch", "At noon?").unwrap();
    let armored = world.client.provider().decrypt(&outcome.ciphertext, SERVER_PASS).unwrap();
    let mail = unwrap_and_decrypt(&armored, &world.bob, ALICE).unwrap();
    assert_eq!(mail, b"To: carol@example.net\nSubject: Lunch\n\nAt noon?");

    // Inbound: the server encrypts the reply to the nym and ratchets it.
    let reply = world
        .client
        .provider()
        .encrypt(
            "From: Carol <carol@example.net>\nDate: Wed, 2 Jul 2003 10:00:00 +0000\nSubject: Re: Lunch\n\nSure.\n",
            &[ALICE.to_string()],
            &world.server_fingerprint,
            SERVER_PASS,
        )
        .unwrap();
    let ratcheted = encrypt_and_wrap(reply.as_bytes(), &world.bob, ALICE).unwrap();
    let unread_dir = world.client.config().unread_dir.clone();
    let article = unread_dir.join(MessageKey::new(ALICE, "x1y2z").unwrap().encode());
    fs::write(&article, format!("Subject: 0123abcd\nDate: Wed, 2 Jul 2003 10:05:00 +0000\n\n{}", ratcheted)).unwrap();
    assert_eq!(world.client.count_unread_messages().unwrap().get(ALICE), Some(&1));

    let messages = world.client.retrieve_messages().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_unread);

    let opened = world.client.decrypt_ephemeral_message(&messages[0]).unwrap();
    assert_eq!(opened.sender.as_deref(), Some("carol@example.net"));
    assert_eq!(opened.subject.as_deref(), Some("Re: Lunch"));
    assert_eq!(opened.content, "Sure.\n");
    assert!(!article.exists());

    // The ratchet moved on; the same article cannot be opened twice.
    let again = world.client.decrypt_ephemeral_message(&messages[0]).unwrap_err();
    assert!(matches!(again, NymError::UndecipherableMessage(_)));

    let saved = world.client.save_message_to_disk(&opened).unwrap();
    let listed = world.client.retrieve_messages().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_unread);
    assert_eq!(listed[0].content, "Sure.\n");
    assert_eq!(listed[0].identifier, saved);

    world.client.delete_message_from_disk(&listed[0]).unwrap();
    assert!(world.client.retrieve_messages().unwrap().is_empty());
}

#[test]
fn unknown_nym_only_when_not_creating() {
    let mut world = world();
    let err = world.client.start_session(ALICE, ALICE_PASS, false).unwrap_err();
    assert!(matches!(err, NymError::NymNotFound(address) if address == ALICE));

    let session = world.client.start_session(ALICE, ALICE_PASS, true).unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.nym().fingerprint.is_none());
}

#[test]
fn wrong_passphrase_never_opens_the_store() {
    let mut world = world();
    create_alice(&mut world);
    world.client.end_session();

    let err = world.client.start_session(ALICE, "not-alice", false).unwrap_err();
    assert!(matches!(err, NymError::IncorrectPassphrase));
    assert!(world.client.session().is_none());

    let session = world.client.start_session(ALICE, ALICE_PASS, false).unwrap();
    assert_eq!(session.nym().hsub.as_deref(), Some("alice-hsub"));
}
