//! Relay validation, execution and replay protection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::harness::{ExecMode, HarnessConfig, HarnessError, TestHarness, CHAIN, OTHER_CHAIN};
use servicer_node::relay::RelayProof;
use servicer_node::{EntitlementToken, Error, ProofError, RelayPayload, SessionError};
use std::time::Duration;

fn node_error(result: Result<impl std::fmt::Debug, HarnessError>) -> Error {
    match result {
        Err(HarnessError::Node(e)) => e,
        other => panic!("expected a node error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_is_served_signed_and_recorded() {
    let harness = TestHarness::setup().unwrap();
    let relay = harness.relay(0, 1).unwrap();
    let header = relay.proof.header.clone();

    let response = harness.send(0, relay.clone()).await.unwrap();

    assert_eq!(response.payload, "0x64");
    assert_eq!(response.proof, relay.proof);
    assert!(response.verify_signature());
    assert_eq!(response.servicer_address(), harness.nodes[0].address());

    let node = &harness.nodes[0];
    assert_eq!(harness.ledger.record_count(&node.address(), &header), 1);
    assert_eq!(node.servicer.metrics().chain(CHAIN).relays, 1);
    assert_eq!(harness.executor.calls(), 1);
}

#[tokio::test]
async fn test_request_index_ceiling() {
    let harness = TestHarness::setup().unwrap();

    for index in 1..=harness.config.max_relays {
        let relay = harness.relay(0, index).unwrap();
        harness.send(0, relay).await.unwrap();
    }

    let over = harness.relay(0, harness.config.max_relays + 1).unwrap();
    let err = node_error(harness.send(0, over).await);
    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::IndexOutOfRange { index: 4, max: 3 })
    ));

    let zero = harness.relay(0, 0).unwrap();
    let err = node_error(harness.send(0, zero).await);
    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::IndexOutOfRange { index: 0, .. })
    ));
}

#[tokio::test]
async fn test_replayed_index_is_rejected() {
    let harness = TestHarness::setup().unwrap();
    let relay = harness.relay(0, 2).unwrap();

    harness.send(0, relay.clone()).await.unwrap();
    let err = node_error(harness.send(0, relay).await);

    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::DuplicateIndex(2))
    ));
    assert_eq!(harness.executor.calls(), 1);
}

#[tokio::test]
async fn test_same_index_is_independent_per_servicer() {
    let harness = TestHarness::setup().unwrap();

    for node in 0..harness.config.members {
        let relay = harness.relay(node, 1).unwrap();
        harness.send(node, relay).await.unwrap();
    }
    assert_eq!(harness.executor.calls(), harness.config.members);
}

#[tokio::test]
async fn test_downstream_failure_still_consumes_index() {
    let harness = TestHarness::setup().unwrap();
    harness.executor.set_mode(ExecMode::Fail);

    let relay = harness.relay(0, 1).unwrap();
    let err = node_error(harness.send(0, relay.clone()).await);
    assert!(matches!(err, Error::DownstreamExecution(_)));
    assert!(err.is_retryable());

    harness
        .executor
        .set_mode(ExecMode::Reply("0x64".to_string()));
    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::DuplicateIndex(1))
    ));

    let node = &harness.nodes[0];
    assert_eq!(node.servicer.metrics().chain(CHAIN).errors, 1);
    assert_eq!(
        harness
            .ledger
            .record_count(&node.address(), &harness.header(CHAIN)),
        1
    );
}

#[tokio::test]
async fn test_execution_timeout_is_downstream_failure() {
    let harness = TestHarness::setup_with_config(HarnessConfig {
        relay_timeout: Duration::from_millis(50),
        ..HarnessConfig::default()
    })
    .unwrap();
    harness
        .executor
        .set_mode(ExecMode::Delay(Duration::from_secs(2)));

    let relay = harness.relay(0, 1).unwrap();
    let err = node_error(harness.send(0, relay).await);

    assert!(matches!(err, Error::DownstreamExecution(_)));
    assert_eq!(err.code(), 5);
}

#[tokio::test]
async fn test_non_member_rejects_relay() {
    let harness = TestHarness::setup().unwrap();
    let outsider = harness.config.members;

    let relay = harness.relay(outsider, 1).unwrap();
    let err = node_error(harness.send(outsider, relay).await);

    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::NodeNotInSession(_))
    ));
    assert_eq!(harness.executor.calls(), 0);
}

#[tokio::test]
async fn test_outsider_serves_its_own_chain() {
    let harness = TestHarness::setup().unwrap();
    let outsider = harness.config.members;

    let header = harness.header(OTHER_CHAIN);
    let relay = harness.relay_for(outsider, &header, 1).unwrap();
    harness.send(outsider, relay).await.unwrap();

    let relay = harness.relay_for(0, &header, 1).unwrap();
    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::NodeNotInSession(_))
    ));
}

#[tokio::test]
async fn test_stale_session_height_is_rejected() {
    let harness = TestHarness::setup().unwrap();
    let relay = harness.relay(0, 1).unwrap();

    harness.close_session();
    let err = node_error(harness.send(0, relay).await);

    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::StaleHeight {
            requested: 1,
            current: 5
        })
    ));
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let harness = TestHarness::setup().unwrap();
    let header = harness.header(CHAIN);
    let token = EntitlementToken::issue(
        &harness.app,
        harness.client.public_key().clone(),
        CHAIN,
        header.session_block_height,
        2,
    )
    .unwrap();
    let payload = RelayPayload::new(r#"{"id":1}"#);
    let proof = RelayProof::sign(
        &harness.client,
        harness.nodes[0].keypair.public_key().clone(),
        header,
        1,
        &payload,
        token,
    )
    .unwrap();

    harness.chain.advance_to(3);
    let err = node_error(
        harness
            .send(0, servicer_node::Relay { payload, proof })
            .await,
    );

    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::TokenExpired {
            expiration: 2,
            current: 3
        })
    ));
}

#[tokio::test]
async fn test_tampered_relays_are_rejected() {
    let harness = TestHarness::setup().unwrap();

    let mut relay = harness.relay(0, 1).unwrap();
    relay.payload.data = r#"{"method":"eth_sendRawTransaction"}"#.to_string();
    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::RequestHashMismatch)
    ));

    let mut relay = harness.relay(0, 1).unwrap();
    relay.proof.request_index = 2;
    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::BadSignature("client"))
    ));

    let relay = harness.relay(1, 1).unwrap();
    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(err, Error::InvalidProof(ProofError::WrongServicer)));

    let mut relay = harness.relay(0, 1).unwrap();
    relay.proof.token.expiration_height += 100;
    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(err, Error::InvalidProof(ProofError::BadSignature(_))));

    assert_eq!(harness.executor.calls(), 0);
}

#[tokio::test]
async fn test_unhosted_chain_is_rejected() {
    let harness = TestHarness::setup().unwrap();
    let header = servicer_node::SessionHeader::new(
        harness.app.public_key().clone(),
        "00FF",
        harness.current_session(),
    );
    let relay = harness.relay_for(0, &header, 1).unwrap();

    let err = node_error(harness.send(0, relay).await);
    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::ChainNotHosted(_))
    ));
}

#[tokio::test]
async fn test_concurrent_relays_consume_index_once() {
    let harness = TestHarness::setup().unwrap();
    let relay = harness.relay(0, 1).unwrap();
    let servicer = harness.nodes[0].servicer.clone();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let servicer = servicer.clone();
            let relay = relay.clone();
            tokio::spawn(async move { servicer.handle_relay(relay).await })
        })
        .collect();

    let mut served = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => served += 1,
            Err(e) => assert!(matches!(
                e,
                Error::InvalidProof(ProofError::DuplicateIndex(1))
            )),
        }
    }
    assert_eq!(served, 1);
    assert_eq!(harness.executor.calls(), 1);
}

#[tokio::test]
async fn test_session_is_cached_after_first_relay() {
    let harness = TestHarness::setup().unwrap();
    let servicer = &harness.nodes[0].servicer;

    for index in 1..=3 {
        let relay = harness.relay(0, index).unwrap();
        harness.send(0, relay).await.unwrap();
    }

    let stats = servicer.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.additions, 1);
    assert_eq!(stats.hits, 2);

    harness.chain.advance_to(harness.current_session() + 8);
    assert_eq!(servicer.evict_stale_sessions(), 1);
    assert!(servicer.cache().is_empty());
}
