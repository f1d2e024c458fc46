//! Nostr transport for walletchat.
//!
//! Envelopes travel as signed events, NIP-44 encrypted between the two
//! identities. Wallet addresses are mapped to public keys through identity
//! announcements published when a connection is opened.

pub mod error;
pub mod network;
pub mod relay;

pub use error::{Error, Result};
pub use network::{NostrConnection, NostrNetwork};
pub use relay::LocalRelay;

/// Replaceable event announcing which public key speaks for a wallet address.
pub const ANNOUNCEMENT_KIND: u32 = 10078;

/// Encrypted direct message between two identities.
pub const MESSAGE_KIND: u32 = 1078;
