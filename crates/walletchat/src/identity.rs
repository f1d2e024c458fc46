use crate::types::{IDENTITY_DERIVATION_SALT, SIGNATURE_LENGTHS};
use crate::{Address, Error, Result};
use futures::future::BoxFuture;
use hkdf::Hkdf;
use nostr::{Keys, PublicKey};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// The wallet / signing provider.
///
/// Implementations show the challenge to the user and return the raw signature
/// bytes, or [`Error::SignatureRejected`] if the user declines.
pub trait WalletSigner: Send + Sync {
    fn request_signature<'a>(&'a self, challenge: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Text the wallet is asked to sign for `address`. Stable across calls.
pub fn challenge_for(address: &Address) -> String {
    format!(
        "walletchat: enable end-to-end encrypted messaging\n\nAddress: {}\nVersion: 1",
        address
    )
}

/// Messaging identity bound to a wallet address.
///
/// The key pair is derived from the wallet's signature over [`challenge_for`],
/// so the same wallet always yields the same identity.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    keys: Keys,
    proof: Vec<u8>,
}

impl Identity {
    pub fn derive(address: Address, signature: &[u8]) -> Result<Self> {
        if !SIGNATURE_LENGTHS.contains(&signature.len()) {
            return Err(Error::SignatureRejected(format!(
                "malformed signature: expected {:?} bytes, got {}",
                SIGNATURE_LENGTHS,
                signature.len()
            )));
        }
        if signature.iter().all(|b| *b == 0) {
            return Err(Error::SignatureRejected(
                "malformed signature: all bytes are zero".to_string(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(Some(IDENTITY_DERIVATION_SALT), signature);
        let mut okm = [0u8; 32];
        hk.expand(address.as_str().as_bytes(), &mut okm)
            .map_err(|e| Error::SignatureRejected(e.to_string()))?;
        let secret_key = nostr::SecretKey::from_slice(&okm)
            .map_err(|e| Error::SignatureRejected(format!("unusable derived key: {}", e)))?;

        Ok(Self {
            address,
            keys: Keys::new(secret_key),
            proof: signature.to_vec(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// The wallet signature the keys were derived from.
    pub fn proof(&self) -> &[u8] {
        &self.proof
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.public_key() == other.public_key()
            && self.proof == other.proof
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Turns wallet signatures into identities, keeping one identity per address.
#[derive(Default)]
pub struct IdentityBinder {
    bound: Mutex<HashMap<Address, Arc<Identity>>>,
}

impl IdentityBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, address: &str, signer: &dyn WalletSigner) -> Result<Arc<Identity>> {
        let address = Address::parse(address)?;
        let challenge = challenge_for(&address);
        let signature = signer.request_signature(&challenge).await?;
        let identity = Identity::derive(address.clone(), &signature)?;

        let mut bound = self.bound.lock().unwrap();
        if let Some(existing) = bound.get(&address) {
            if **existing != identity {
                warn!(%address, "wallet produced a different signature; keeping the bound identity");
            }
            return Ok(existing.clone());
        }

        debug!(%address, public_key = %identity.public_key().to_hex(), "identity bound");
        let identity = Arc::new(identity);
        bound.insert(address, identity.clone());
        Ok(identity)
    }

    pub fn identity(&self, address: &Address) -> Option<Arc<Identity>> {
        self.bound.lock().unwrap().get(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestWallet;

    const ADDRESS: &str = "0x00000000000000000000000000000000000000a1";

    #[test]
    fn derive_is_deterministic() {
        let address = Address::parse(ADDRESS).unwrap();
        let signature = [7u8; 65];
        let first = Identity::derive(address.clone(), &signature).unwrap();
        let second = Identity::derive(address, &signature).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn derive_depends_on_address_and_signature() {
        let a = Address::parse(ADDRESS).unwrap();
        let b = Address::parse("0x00000000000000000000000000000000000000b2").unwrap();
        let base = Identity::derive(a.clone(), &[7u8; 65]).unwrap();
        assert_ne!(base.public_key(), Identity::derive(b, &[7u8; 65]).unwrap().public_key());
        assert_ne!(base.public_key(), Identity::derive(a, &[8u8; 65]).unwrap().public_key());
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let address = Address::parse(ADDRESS).unwrap();
        for signature in [vec![], vec![1u8; 10], vec![1u8; 66], vec![0u8; 65]] {
            let err = Identity::derive(address.clone(), &signature).unwrap_err();
            assert!(matches!(err, Error::SignatureRejected(_)));
        }
    }

    #[tokio::test]
    async fn bind_signs_the_address_challenge() {
        let wallet = TestWallet::new(ADDRESS);
        let binder = IdentityBinder::new();
        let identity = binder.bind(ADDRESS, &wallet).await.unwrap();

        assert_eq!(identity.address().as_str(), ADDRESS);
        assert_eq!(
            wallet.challenges(),
            vec![challenge_for(&Address::parse(ADDRESS).unwrap())]
        );
    }

    #[tokio::test]
    async fn rebinding_returns_the_same_identity() {
        let wallet = TestWallet::new(ADDRESS);
        let binder = IdentityBinder::new();
        let first = binder.bind(ADDRESS, &wallet).await.unwrap();
        let second = binder.bind(&ADDRESS.to_uppercase().replace("0X", "0x"), &wallet).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn declined_signature_is_reported() {
        let wallet = TestWallet::rejecting(ADDRESS);
        let binder = IdentityBinder::new();
        let err = binder.bind(ADDRESS, &wallet).await.unwrap_err();
        assert!(matches!(err, Error::SignatureRejected(_)));
        assert!(binder.identity(&Address::parse(ADDRESS).unwrap()).is_none());
    }

    #[tokio::test]
    async fn invalid_wallet_address_fails_before_signing() {
        let wallet = TestWallet::new(ADDRESS);
        let binder = IdentityBinder::new();
        let err = binder.bind("not-an-address", &wallet).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        assert!(wallet.challenges().is_empty());
    }
}
