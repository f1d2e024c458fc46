use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of hex digits in a wallet address, excluding the `0x` prefix.
pub const ADDRESS_HEX_LEN: usize = 40;

/// Domain separation tag mixed into identity key derivation.
pub const IDENTITY_DERIVATION_SALT: &[u8] = b"walletchat/identity/v1";

/// Accepted wallet signature lengths: compact (r || s) and recoverable (r || s || v).
pub const SIGNATURE_LENGTHS: [usize; 2] = [64, 65];

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A wallet / network address: `0x` followed by 40 hex digits, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(input: &str) -> Result<Self> {
        input.parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| Error::InvalidAddress(format!("{:?} is missing the 0x prefix", s)))?;

        if digits.len() != ADDRESS_HEX_LEN {
            return Err(Error::InvalidAddress(format!(
                "{:?} must have {} hex digits, got {}",
                s,
                ADDRESS_HEX_LEN,
                digits.len()
            )));
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidAddress(format!(
                "{:?} contains non-hex characters",
                s
            )));
        }

        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the conversation between two addresses, independent of who opened it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn for_pair(a: &Address, b: &Address) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(first.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(second.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) mod serde_pubkey {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pk: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(pk.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
