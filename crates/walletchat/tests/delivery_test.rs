mod common;

use common::{eventually, fast_config, signed_in, wait_for_status, ALICE, BOB};
use walletchat::test_utils::TestWallet;
use walletchat::{ClientConfig, DeliveryStatus, Error, FailureReason, InMemoryNetwork, Result};

const CAROL: &str = "0x00000000000000000000000000000000000ca401";

#[tokio::test]
async fn test_transient_publish_failures_are_retried() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(3)).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.fail_next_publishes(2);
    let sent = alice.send_message(&conversation, "eventually")?;
    wait_for_status(&conversation, &sent.id, DeliveryStatus::Confirmed).await;

    assert_eq!(network.publish_attempts(), 3);
    assert_eq!(network.history(&sent.sender, conversation.peer()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_fail_after_max_attempts() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(4)).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.fail_all_publishes(true);
    let sent = alice.send_message(&conversation, "doomed")?;
    wait_for_status(&conversation, &sent.id, DeliveryStatus::Failed).await;

    assert_eq!(network.publish_attempts(), 4);
    let failed = conversation.message(&sent.id).unwrap();
    assert!(matches!(
        failed.failure,
        Some(FailureReason::TransportFailure { attempts: 4, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_sends_are_published_in_submission_order() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(3)).await?;
    let conversation = alice.open_conversation(BOB)?;

    // The first send needs retries; later ones must still queue behind it.
    network.fail_next_publishes(2);
    let ids: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|text| alice.send_message(&conversation, text).map(|m| m.id))
        .collect::<Result<_>>()?;
    for id in &ids {
        wait_for_status(&conversation, id, DeliveryStatus::Confirmed).await;
    }

    let published: Vec<String> = network
        .history(conversation.owner(), conversation.peer())
        .into_iter()
        .map(|e| e.content)
        .collect();
    assert_eq!(published, ["one", "two", "three"]);
    Ok(())
}

#[tokio::test]
async fn test_unconfirmed_message_times_out() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(1)).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.withhold_confirmations(true);
    let sent = alice.send_message(&conversation, "into the void")?;
    wait_for_status(&conversation, &sent.id, DeliveryStatus::Failed).await;

    assert_eq!(
        conversation.message(&sent.id).unwrap().failure,
        Some(FailureReason::ConfirmationTimeout)
    );
    Ok(())
}

#[tokio::test]
async fn test_rejected_confirmation_fails_the_message() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(1)).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.reject_confirmations(true);
    let sent = alice.send_message(&conversation, "dropped by the relay")?;
    wait_for_status(&conversation, &sent.id, DeliveryStatus::Failed).await;

    let failed = conversation.message(&sent.id).unwrap();
    match failed.failure {
        Some(FailureReason::ConfirmationFailed { error }) => assert!(error.contains("dropped")),
        other => panic!("unexpected failure: {:?}", other),
    }
    assert_eq!(network.publish_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stalled_conversation_does_not_hold_up_others() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(1)).await?;
    let to_carol = alice.open_conversation(CAROL)?;
    let to_bob = alice.open_conversation(BOB)?;

    network.stall_publishes_to(to_carol.peer(), true);
    let stuck = alice.send_message(&to_carol, "are you there?")?;
    eventually("the stalled publish", || network.publish_attempts() == 1).await;

    let sent = alice.send_message(&to_bob, "hello bob")?;
    wait_for_status(&to_bob, &sent.id, DeliveryStatus::Confirmed).await;
    assert_eq!(
        to_carol.message(&stuck.id).unwrap().status,
        DeliveryStatus::Pending
    );
    Ok(())
}

#[tokio::test]
async fn test_replacing_the_session_fails_in_flight_sends() -> Result<()> {
    let network = InMemoryNetwork::new();
    let mut config = ClientConfig::default();
    config.confirmation_timeout_ms = 60_000;
    let alice = signed_in(&network, ALICE, config).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.withhold_confirmations(true);
    let sent = alice.send_message(&conversation, "in flight")?;
    wait_for_status(&conversation, &sent.id, DeliveryStatus::Sent).await;

    let old = alice.session().unwrap();
    let new = alice.sign_in(ALICE, &TestWallet::new(ALICE)).await?;
    assert_ne!(old.id(), new.id());
    assert!(!old.is_active());

    wait_for_status(&conversation, &sent.id, DeliveryStatus::Failed).await;
    assert_eq!(
        conversation.message(&sent.id).unwrap().failure,
        Some(FailureReason::SessionExpired)
    );
    Ok(())
}

#[tokio::test]
async fn test_sign_out_fails_pending_sends() -> Result<()> {
    let network = InMemoryNetwork::new();
    let mut config = fast_config(5);
    config.retry.initial_backoff_ms = 60_000;
    config.retry.max_backoff_ms = 60_000;
    let alice = signed_in(&network, ALICE, config).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.fail_all_publishes(true);
    let sent = alice.send_message(&conversation, "stuck")?;
    eventually("the first attempt", || network.publish_attempts() == 1).await;
    assert_eq!(
        conversation.message(&sent.id).unwrap().status,
        DeliveryStatus::Pending
    );

    alice.sign_out();
    wait_for_status(&conversation, &sent.id, DeliveryStatus::Failed).await;
    assert_eq!(
        conversation.message(&sent.id).unwrap().failure,
        Some(FailureReason::SessionExpired)
    );
    assert_eq!(network.publish_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn test_resend_creates_a_new_message() -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = signed_in(&network, ALICE, fast_config(2)).await?;
    let conversation = alice.open_conversation(BOB)?;

    network.fail_all_publishes(true);
    let failed = alice.send_message(&conversation, "try again")?;
    wait_for_status(&conversation, &failed.id, DeliveryStatus::Failed).await;

    network.fail_all_publishes(false);
    let retried = alice.resend(&conversation, &failed.id)?;
    assert_ne!(retried.id, failed.id);
    assert_eq!(retried.content, failed.content);
    assert!(retried.sent_at > failed.sent_at);
    wait_for_status(&conversation, &retried.id, DeliveryStatus::Confirmed).await;

    assert_eq!(conversation.len(), 2);
    assert_eq!(
        conversation.message(&failed.id).unwrap().status,
        DeliveryStatus::Failed
    );

    assert!(matches!(
        alice.resend(&conversation, &retried.id),
        Err(Error::NotRetryable(_))
    ));
    assert!(matches!(
        alice.resend(&conversation, &uuid::Uuid::new_v4()),
        Err(Error::MessageNotFound(_))
    ));
    Ok(())
}
