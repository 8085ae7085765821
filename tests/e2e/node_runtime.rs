//! The assembled node: construction, maintenance, persistence and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::harness::{MockExecutor, CHAIN};
use servicer_node::chain::{Application, Genesis, StateCommitmentView, Validator};
use servicer_node::ledger::LEDGER_FILE;
use servicer_node::{
    EntitlementToken, Error, Keypair, NodeBuilder, NodeConfig, NodeEvent, ProofError, Relay,
    RelayPayload, RelayProof, RunningNode, SessionHeader,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Identities {
    servicer: Keypair,
    app: Keypair,
    client: Keypair,
}

impl Identities {
    fn new() -> Self {
        Self {
            servicer: Keypair::generate().unwrap(),
            app: Keypair::generate().unwrap(),
            client: Keypair::generate().unwrap(),
        }
    }

    fn write_genesis(&self, path: &Path) {
        let chains = BTreeSet::from([CHAIN.to_string()]);
        let genesis = Genesis {
            validators: vec![Validator {
                public_key: self.servicer.public_key().clone(),
                chains: chains.clone(),
                service_url: "http://localhost:8081".to_string(),
                staked_tokens: 100,
                staked: true,
            }],
            applications: vec![Application::with_stake(
                self.app.public_key().clone(),
                chains,
                10,
                1,
            )],
        };
        std::fs::write(path, toml::to_string(&genesis).unwrap()).unwrap();
    }

    fn relay(&self, height: u64, index: u64) -> Relay {
        let header = SessionHeader::new(self.app.public_key().clone(), CHAIN, height);
        let token = EntitlementToken::issue(
            &self.app,
            self.client.public_key().clone(),
            CHAIN,
            height,
            height + 100,
        )
        .unwrap();
        let payload = RelayPayload::new(format!(r#"{{"id":{index}}}"#));
        let proof = RelayProof::sign(
            &self.client,
            self.servicer.public_key().clone(),
            header,
            index,
            &payload,
            token,
        )
        .unwrap();
        Relay { payload, proof }
    }
}

fn config(root: &TempDir) -> NodeConfig {
    let genesis = root.path().join("genesis.toml");
    let mut config = NodeConfig {
        root_dir: root.path().join("node"),
        ..NodeConfig::default()
    };
    config.chain.genesis = Some(genesis);
    config.chain.block_interval_secs = 0;
    config
}

fn build(ids: &Identities, config: NodeConfig) -> RunningNode {
    NodeBuilder::new(config)
        .with_keypair(ids.servicer.clone())
        .with_executor(Arc::new(MockExecutor::new(&[CHAIN])))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_node_runs_until_shutdown() {
    let root = TempDir::new().unwrap();
    let ids = Identities::new();
    ids.write_genesis(&root.path().join("genesis.toml"));

    // Keys come from the key directory when none are supplied.
    let key_dir = root.path().join("keys");
    ids.servicer.save(&key_dir).unwrap();
    let mut config = config(&root);
    config.key_dir = Some(key_dir);

    let mut node = NodeBuilder::new(config)
        .with_executor(Arc::new(MockExecutor::new(&[CHAIN])))
        .build()
        .unwrap();
    assert_eq!(node.servicer().address(), ids.servicer.address());

    let mut events = node.events().unwrap();
    assert!(node.events().is_none());

    node.shutdown();
    node.run().await.unwrap();

    assert!(matches!(events.recv().await.unwrap(), NodeEvent::Started));
    assert!(matches!(
        events.recv().await.unwrap(),
        NodeEvent::ShuttingDown
    ));
    assert!(node.root_dir().join(LEDGER_FILE).exists());
}

#[tokio::test]
async fn test_maintenance_claims_closed_sessions() {
    let root = TempDir::new().unwrap();
    let ids = Identities::new();
    ids.write_genesis(&root.path().join("genesis.toml"));
    let node = build(&ids, config(&root));
    let mut events = node.subscribe_events();

    for index in 1..=2 {
        node.servicer()
            .handle_relay(ids.relay(1, index))
            .await
            .unwrap();
    }
    assert!(matches!(
        events.try_recv().unwrap(),
        NodeEvent::RelayServed { .. }
    ));

    // Nothing to claim while the session is open.
    node.maintain();
    let chain = node.dev_chain().unwrap();
    assert_eq!(chain.balance(&ids.servicer.address()), 0);

    chain.advance_to(5);
    node.maintain();

    assert_eq!(chain.balance(&ids.servicer.address()), 2_000);
    let settled = loop {
        match events.try_recv().unwrap() {
            NodeEvent::BatchSettled { relays, .. } => break relays,
            _ => continue,
        }
    };
    assert_eq!(settled, 2);

    // Settlement markers leave with the claim window.
    let header = ids.relay(1, 1).proof.header;
    let ledger = node.servicer().ledger();
    assert!(ledger.is_settled(&ids.servicer.address(), &header));
    chain.advance_to(25);
    node.maintain();
    assert!(!ledger.is_settled(&ids.servicer.address(), &header));
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let root = TempDir::new().unwrap();
    let ids = Identities::new();
    ids.write_genesis(&root.path().join("genesis.toml"));

    let node = build(&ids, config(&root));
    node.servicer()
        .handle_relay(ids.relay(1, 1))
        .await
        .unwrap();
    node.maintain();
    drop(node);

    let node = build(&ids, config(&root));
    assert_eq!(node.dev_chain().unwrap().latest_height(), 1);

    let err = node
        .servicer()
        .handle_relay(ids.relay(1, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidProof(ProofError::DuplicateIndex(1))
    ));
    node.servicer()
        .handle_relay(ids.relay(1, 2))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dev_chain_produces_blocks() {
    let root = TempDir::new().unwrap();
    let ids = Identities::new();
    ids.write_genesis(&root.path().join("genesis.toml"));
    let mut config = config(&root);
    config.chain.block_interval_secs = 1;
    let mut node = build(&ids, config);
    let chain = Arc::clone(node.dev_chain().unwrap());

    let shutdown = tokio::spawn({
        let chain = Arc::clone(&chain);
        async move {
            while chain.latest_height() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    });
    tokio::select! {
        result = node.run() => panic!("node stopped early: {result:?}"),
        _ = shutdown => {}
    }
    assert!(chain.latest_height() >= 2);
}

#[test]
fn test_build_rejects_bad_setup() {
    let root = TempDir::new().unwrap();

    let mut invalid = config(&root);
    invalid.session.node_count = 0;
    assert!(matches!(
        NodeBuilder::new(invalid).build(),
        Err(Error::Config(_))
    ));

    // No genesis file on disk and no keys in the key directory.
    let missing = config(&root);
    assert!(NodeBuilder::new(missing).build().is_err());
}
