//! Minority/majority challenge adjudication across session nodes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{HarnessConfig, TestHarness, CHAIN};
use servicer_node::{
    Challenge, EntitlementToken, Error, Keypair, RelayPayload, RelayProof, RelayResponse,
    Session, SessionError, SessionHeader,
};

/// Response of node `node` to request `index` with the given body.
fn response(harness: &TestHarness, header: &SessionHeader, node: usize, body: &str) -> RelayResponse {
    let relay = harness.relay_for(node, header, 1).unwrap();
    RelayResponse::sign(&harness.nodes[node].keypair, body.to_string(), relay.proof).unwrap()
}

/// Challenge naming `minority` as the dissenting node against `majority`.
fn challenge(harness: &TestHarness, minority: usize, majority: &[usize]) -> Challenge {
    let header = harness.header(CHAIN);
    Challenge {
        token: harness.token(&header).unwrap(),
        minority_response: response(harness, &header, minority, "0x0"),
        majority_responses: majority
            .iter()
            .map(|&node| response(harness, &header, node, "0x64"))
            .collect(),
        header,
    }
}

#[test]
fn test_identical_challenge_changes_standing_once() {
    let harness = TestHarness::setup().unwrap();
    let accused = harness.nodes[0].address();
    let accuser = &harness.nodes[1];
    let challenge = challenge(&harness, 0, &[1, 2]);

    let reply = accuser.servicer.handle_challenge(&challenge).unwrap();
    assert!(reply.response.contains(&accused.to_string()));
    let again = accuser.servicer.handle_challenge(&challenge).unwrap();
    assert_eq!(again, reply);

    assert_eq!(harness.standing.penalties(&accused), 1);
    assert_eq!(accuser.servicer.metrics().chain(CHAIN).challenges, 1);

    let outcome = accuser
        .servicer
        .challenges()
        .outcome(&challenge.header, &accused)
        .unwrap();
    assert_eq!(outcome.minority_payload, "0x0");
    assert_eq!(outcome.majority_payload, "0x64");
    assert!(outcome.accusers.contains(&accuser.address()));
}

#[test]
fn test_each_session_node_may_accuse() {
    let harness = TestHarness::setup().unwrap();
    let accused = harness.nodes[0].address();
    let challenge = challenge(&harness, 0, &[1, 2]);

    harness.nodes[1].servicer.handle_challenge(&challenge).unwrap();
    harness.nodes[2].servicer.handle_challenge(&challenge).unwrap();

    assert_eq!(harness.standing.penalties(&accused), 2);
}

#[test]
fn test_invalid_evidence_changes_nothing() {
    let harness = TestHarness::setup().unwrap();
    let accused = harness.nodes[0].address();

    let mut agreeing = challenge(&harness, 0, &[1, 2]);
    agreeing.minority_response = response(&harness, &agreeing.header, 0, "0x64");
    let err = harness.nodes[1]
        .servicer
        .handle_challenge(&agreeing)
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeValidation(_)));
    assert_eq!(err.code(), 8);

    let lonely = challenge(&harness, 0, &[1]);
    let err = harness.nodes[1]
        .servicer
        .handle_challenge(&lonely)
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeValidation(_)));

    let mut forged = challenge(&harness, 0, &[1, 2]);
    forged.majority_responses[1].payload = "0x0".to_string();
    let err = harness.nodes[1]
        .servicer
        .handle_challenge(&forged)
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeValidation(_)));

    assert_eq!(harness.standing.penalties(&accused), 0);
    assert!(harness.nodes[1]
        .servicer
        .challenges()
        .outcome(&agreeing.header, &accused)
        .is_none());
}

/// Response of node `node` to a request signed by `client` under `token`.
fn response_under(
    harness: &TestHarness,
    header: &SessionHeader,
    token: EntitlementToken,
    client: &Keypair,
    node: usize,
    body: &str,
) -> RelayResponse {
    let keypair = &harness.nodes[node].keypair;
    let proof = RelayProof::sign(
        client,
        keypair.public_key().clone(),
        header.clone(),
        1,
        &RelayPayload::new(r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#),
        token,
    )
    .unwrap();
    RelayResponse::sign(keypair, body.to_string(), proof).unwrap()
}

#[test]
fn test_responses_must_share_the_client_entitlement() {
    let harness = TestHarness::setup().unwrap();
    let accused = harness.nodes[0].address();
    let header = harness.header(CHAIN);

    // A relay signed by another client of the same application.
    let intruder = Keypair::generate().unwrap();
    let intruder_token = EntitlementToken::issue(
        &harness.app,
        intruder.public_key().clone(),
        CHAIN,
        header.session_block_height,
        header.session_block_height + 8,
    )
    .unwrap();
    let mut foreign = challenge(&harness, 0, &[1, 2]);
    foreign.majority_responses[1] =
        response_under(&harness, &header, intruder_token, &intruder, 2, "0x64");
    let err = harness.nodes[1]
        .servicer
        .handle_challenge(&foreign)
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeValidation(_)));

    // Same token, but the proof was altered after the client signed it.
    let mut unsigned = challenge(&harness, 0, &[1, 2]);
    let mut proof = unsigned.minority_response.proof.clone();
    proof.request_index = 3;
    unsigned.minority_response =
        RelayResponse::sign(&harness.nodes[0].keypair, "0x0".to_string(), proof).unwrap();
    let err = harness.nodes[1]
        .servicer
        .handle_challenge(&unsigned)
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeValidation(_)));
    assert_eq!(err.code(), 8);

    assert_eq!(harness.standing.penalties(&accused), 0);
}

#[test]
fn test_unknown_application_is_refused_even_when_cached() {
    let harness = TestHarness::setup().unwrap();
    let servicer = &harness.nodes[1].servicer;
    let members = servicer.session(&harness.header(CHAIN)).unwrap();

    let stranger = Keypair::generate().unwrap();
    let header = SessionHeader::new(
        stranger.public_key().clone(),
        CHAIN,
        harness.current_session(),
    );
    servicer
        .cache()
        .get_or_form(&header, || {
            Ok(Session {
                header: header.clone(),
                nodes: members.nodes.clone(),
                block_hash: members.block_hash,
            })
        })
        .unwrap();

    let token = EntitlementToken::issue(
        &stranger,
        harness.client.public_key().clone(),
        CHAIN,
        header.session_block_height,
        header.session_block_height + 8,
    )
    .unwrap();
    let respond = |node, body| {
        response_under(&harness, &header, token.clone(), &harness.client, node, body)
    };
    let challenge = Challenge {
        header: header.clone(),
        token: token.clone(),
        minority_response: respond(0, "0x0"),
        majority_responses: vec![respond(1, "0x64"), respond(2, "0x64")],
    };

    let err = servicer.handle_challenge(&challenge).unwrap_err();
    assert!(matches!(err, Error::ApplicationNotFound(_)));
    assert_eq!(err.code(), 2);
    assert_eq!(harness.standing.penalties(&harness.nodes[0].address()), 0);
}

#[test]
fn test_expired_challenge_is_refused_and_pruned() {
    let harness = TestHarness::setup_with_config(HarnessConfig {
        claim_window: 1,
        ..HarnessConfig::default()
    })
    .unwrap();
    let accused = harness.nodes[0].address();
    let challenge = challenge(&harness, 0, &[1, 2]);

    // One session after closing is still inside the window.
    harness.chain.advance_to(5);
    harness.nodes[1].servicer.handle_challenge(&challenge).unwrap();

    harness.chain.advance_to(9);
    let err = harness.nodes[2]
        .servicer
        .handle_challenge(&challenge)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::StaleHeight {
            requested: 1,
            current: 9
        })
    ));
    assert_eq!(harness.standing.penalties(&accused), 1);

    let servicer = &harness.nodes[1].servicer;
    assert!(servicer.prune_expired_claims() >= 2);
    assert!(servicer.challenges().is_empty());
    assert!(servicer.handle_challenge(&challenge).is_err());
    assert_eq!(harness.standing.penalties(&accused), 1);
}

#[test]
fn test_non_member_cannot_adjudicate() {
    let harness = TestHarness::setup().unwrap();
    let challenge = challenge(&harness, 0, &[1, 2]);

    let err = harness.nodes[3]
        .servicer
        .handle_challenge(&challenge)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SessionVerification(SessionError::NodeNotInSession(_))
    ));
}

#[test]
fn test_historical_challenge_does_not_populate_cache() {
    let harness = TestHarness::setup().unwrap();
    let challenge = challenge(&harness, 0, &[1, 2]);
    harness.chain.advance_to(harness.current_session() + 8);

    let servicer = &harness.nodes[1].servicer;
    servicer.handle_challenge(&challenge).unwrap();

    assert!(servicer.cache().is_empty());
    assert_eq!(
        harness.standing.penalties(&harness.nodes[0].address()),
        1
    );
}

#[test]
fn test_accuser_rate_limit() {
    let harness = TestHarness::setup_with_config(HarnessConfig {
        max_challenges: 1,
        ..HarnessConfig::default()
    })
    .unwrap();
    let servicer = &harness.nodes[1].servicer;

    servicer
        .handle_challenge(&challenge(&harness, 0, &[1, 2]))
        .unwrap();
    let err = servicer
        .handle_challenge(&challenge(&harness, 2, &[0, 1]))
        .unwrap_err();

    assert!(matches!(err, Error::ChallengeValidation(_)));
    assert_eq!(harness.standing.penalties(&harness.nodes[2].address()), 0);
}
