//! Test doubles for the wallet side of sign-in.

use crate::{Error, Result, WalletSigner};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// A wallet that signs deterministically with a secret derived from its address.
///
/// Signatures are 65 bytes shaped like a recoverable ECDSA signature; they are
/// not verifiable, which is all the identity derivation needs.
#[derive(Clone)]
pub struct TestWallet {
    address: String,
    reject: bool,
    challenges: Arc<Mutex<Vec<String>>>,
}

impl TestWallet {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            reject: false,
            challenges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A wallet whose user declines every signature request.
    pub fn rejecting(address: &str) -> Self {
        Self {
            reject: true,
            ..Self::new(address)
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Challenges presented to this wallet so far.
    pub fn challenges(&self) -> Vec<String> {
        self.challenges.lock().unwrap().clone()
    }

    fn sign(&self, challenge: &str) -> Vec<u8> {
        let secret = Sha256::digest(self.address.to_ascii_lowercase().as_bytes());
        let r = Sha256::new()
            .chain_update(secret)
            .chain_update(challenge.as_bytes())
            .finalize();
        let s = Sha256::new().chain_update(r).chain_update(secret).finalize();

        let mut signature = Vec::with_capacity(65);
        signature.extend_from_slice(&r);
        signature.extend_from_slice(&s);
        signature.push(27);
        signature
    }
}

impl WalletSigner for TestWallet {
    fn request_signature<'a>(&'a self, challenge: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.challenges.lock().unwrap().push(challenge.to_string());
            if self.reject {
                return Err(Error::SignatureRejected(
                    "user rejected the request".to_string(),
                ));
            }
            Ok(self.sign(challenge))
        })
    }
}
