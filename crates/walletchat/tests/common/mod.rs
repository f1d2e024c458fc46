//! Test utilities

use std::sync::Arc;
use std::time::Duration;
use walletchat::test_utils::TestWallet;
use walletchat::{
    ClientConfig, Conversation, DeliveryStatus, InMemoryNetwork, Messenger, RetryPolicy, Result,
};
use uuid::Uuid;

pub const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
pub const BOB: &str = "0x0000000000000000000000000000000000000b0b";

/// Retries with millisecond backoff so failure paths finish quickly.
#[allow(dead_code)]
pub fn fast_config(max_attempts: u32) -> ClientConfig {
    ClientConfig {
        retry: RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            backoff_multiplier: 2,
            max_backoff_ms: 5,
        },
        confirmation_timeout_ms: 200,
        history_page_size: 50,
        outbox_idle_ms: 1_000,
    }
}

pub async fn signed_in(
    network: &InMemoryNetwork,
    address: &str,
    config: ClientConfig,
) -> Result<Messenger> {
    let messenger = Messenger::new(Arc::new(network.clone()), config)?;
    messenger.sign_in(address, &TestWallet::new(address)).await?;
    Ok(messenger)
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub async fn wait_for_status(conversation: &Conversation, id: &Uuid, status: DeliveryStatus) {
    eventually(&format!("message {} to become {:?}", id, status), || {
        conversation.message(id).map(|m| m.status) == Some(status)
    })
    .await;
}
