//! # Nymphemeral Library (Client Side)
//!
//! The core of a client for pseudonymous mail accounts ("nyms") hosted on a
//! nym server. Messages to and from the server travel through a header-encrypted
//! ratchet, are framed as PGP-style armor, and are wrapped once more with the
//! nym's public-key identity. The GUI is an external caller of [`Client`].
//!
//! ### Warnings and Disclaimers
//!
//! - The ratchet and its on-disk store have NOT been audited.
//! - [`keyring::MemoryKeyring`] enforces passphrase and recipient rules but provides no confidentiality. Use [`keyring::GpgKeyring`] for anything real.
//! - Both parties of a conversation must not step the DH ratchet at the same time (see `ratchet`).
//!
//! ### Examples / API
//!
//! A client is built from a [`Config`] and a key provider. Starting a session unlocks one nym; `creating` allows a nym that has no key yet.
//!
//! ```rust
//! let mut client = Client::new(Config::load(&path)?, Box::new(GpgKeyring::new(&gpg_dir)))?;
//! client.start_session("alice@nym.example", "passphrase", true)?;
//! let outcome = client.send_create("shared ephemeral secret", "hsub passphrase", "Alice", "0")?;
//! ```
//!
//! With the manual output method the outcome carries the armored request and who to mail it to. Once the server confirmed the nym, mail goes out through the ratchet.
//!
//! ```rust
//! let outcome = client.send_message("bob@example.org", "Hi", "Did you know that cats are awesome?")?;
//! ```
//!
//! Articles fetched by a retrieval task show up as unread messages; decrypting one advances the ratchet.
//!
//! ```rust
//! for message in client.retrieve_messages()? {
//!     if message.is_unread {
//!         let opened = client.decrypt_ephemeral_message(&message)?;
//!         client.save_message_to_disk(&opened)?;
//!     }
//! }
//! ```
//!
//! ### Under the Hood
//!
//! Every nym shares an "ephemeral" secret with its server. Both sides derive the same initial ratchet keys from it (`kdf`), with the send and receive slots swapped between the two roles. The ratchet state lives in a store file per key fingerprint, encrypted under the nym's passphrase (`store`). Each load, advance and save of that state runs as one critical section, because two racing decrypts would corrupt the chain for good.
//!
//! The hSub ledger (`hsub`) records which passphrase tags each nym's messages on the newsgroup. It is kept encrypted to every local nym when possible.

mod client;
mod codec;
mod config;
mod error;
mod hsub;
mod inbox;
mod kdf;
pub mod keyring;
mod messages;
mod nym;
mod ratchet;
mod retrieval;
mod send;
mod session;
mod store;
mod transport;

pub use client::Client;
pub use codec::{detect, encrypt_and_wrap, search, unwrap, unwrap_and_decrypt, wrap, Detection};
pub use config::{Config, NewsgroupConfig, CONFIG_FILE_NAME};
pub use error::{NymError, Result};
pub use hsub::{Entries, HsubLedger, LedgerContext};
pub use inbox::{Inbox, InboxContext, MessageKey};
pub use kdf::{derive_initial_state, mkey, InitialKeys, Role};
pub use messages::Message;
pub use nym::{is_valid_address, Nym};
pub use ratchet::RatchetState;
pub use retrieval::{ArticleSource, RetrievalResult, RetrievalTask};
pub use send::{SendOutcome, SendPipeline};
pub use session::{IdentitySession, SessionState, PEER_NAME};
pub use store::RatchetStateStore;
pub use transport::{MixmasterTransport, OutputMethod, SendmailTransport, Transport};
