//! Block production across nodes: delegation, announcements and tracking.

mod common;

use common::{genesis, spawn_node};
use relaychain::consensus::{
    lcpoa, pos, thrusted, CommitOutcome, LcpoaConfig, LcpoaValidator, PosConfig, PosValidator,
    ThrustedConfig, ThrustedValidator, Validator, WhitelistContract,
};
use relaychain::crypto::{NodeIdentity, Secp256k1Scheme};
use relaychain::network::LocalMesh;
use relaychain::transactor::{BlockGenerator, Transactor, TransactorConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pos_config() -> PosConfig {
    PosConfig {
        add_message_timeout: Duration::from_millis(500),
        ..PosConfig::default()
    }
}

fn whitelist(keys: Vec<String>) -> Arc<WhitelistContract> {
    Arc::new(WhitelistContract::new("1", keys, Arc::new(Secp256k1Scheme)))
}

async fn wait_for_height(node: &common::TestNode, height: i64) {
    while node.height() < height {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pos_delegation_to_whitelisted_peer() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mesh = LocalMesh::new();
        let start = genesis(10_000);
        let producer_id = Arc::new(NodeIdentity::generate());
        let contract = whitelist(vec![producer_id.public_key_hex()]);

        let requester = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &[], pos::CONSENSUS_NAME);
        let producer = spawn_node(&mesh, producer_id, &start, &[], pos::CONSENSUS_NAME);
        mesh.connect(&requester.address(), &producer.address());

        let requester_pos = PosValidator::new(requester.engine.context(), pos_config(), contract.clone());
        requester.engine.register_validator(requester_pos.clone());
        producer
            .engine
            .register_validator(PosValidator::new(producer.engine.context(), pos_config(), contract));

        let block = requester
            .engine
            .submit(r#"{"type":"Transfer","data":"x"}"#)
            .await
            .unwrap()
            .expect("delegated block");

        assert_eq!(block.index, 1);
        assert!(producer.identity.verify(&block.hash, &block.sign, &producer.address()));
        assert_eq!(requester.height(), 1);
        assert_eq!(producer.height(), 1);
        assert_eq!(requester_pos.delegation().pending_len(), 0);
    })
    .await
    .expect("test_pos_delegation_to_whitelisted_peer timed out");
}

#[tokio::test]
async fn test_pos_delegation_times_out_without_eligible_peer() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mesh = LocalMesh::new();
        let start = genesis(10_000);
        // somebody is whitelisted, but not the peer that answers
        let contract = whitelist(vec![NodeIdentity::generate().public_key_hex()]);

        let requester = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &[], pos::CONSENSUS_NAME);
        let bystander = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &[], pos::CONSENSUS_NAME);
        mesh.connect(&requester.address(), &bystander.address());

        let validator = PosValidator::new(requester.engine.context(), pos_config(), contract.clone());
        requester.engine.register_validator(validator.clone());
        bystander
            .engine
            .register_validator(PosValidator::new(bystander.engine.context(), pos_config(), contract));

        let outcome = requester.engine.submit(r#"{"type":"Transfer"}"#).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(validator.delegation().pending_len(), 0);
        assert_eq!(requester.height(), 0);
        assert_eq!(bystander.height(), 0);
    })
    .await
    .expect("test_pos_delegation_times_out_without_eligible_peer timed out");
}

#[tokio::test]
async fn test_thrusted_holder_serves_non_holder() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mesh = LocalMesh::new();
        let start = genesis(10_000);
        let holder_id = Arc::new(NodeIdentity::generate());
        let keyring = vec![holder_id.public_key_hex()];

        let member = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &keyring, thrusted::CONSENSUS_NAME);
        let holder = spawn_node(&mesh, holder_id, &start, &keyring, thrusted::CONSENSUS_NAME);
        mesh.connect(&member.address(), &holder.address());

        let config = ThrustedConfig {
            add_message_timeout: Duration::from_secs(2),
            ..ThrustedConfig::default()
        };
        let member_validator = ThrustedValidator::new(member.engine.context(), config.clone());
        member.engine.register_validator(member_validator.clone());
        holder
            .engine
            .register_validator(ThrustedValidator::new(holder.engine.context(), config));

        assert!(member_validator.is_ready());
        let block = member
            .engine
            .submit(r#"{"type":"Transfer","data":"y"}"#)
            .await
            .unwrap()
            .expect("block from keyring holder");

        assert!(holder.identity.verify(&block.hash, &block.sign, &holder.address()));
        wait_for_height(&holder, 1).await;
        assert_eq!(member.height(), 1);
        assert_eq!(member_validator.delegation().pending_len(), 0);

        // the same block arriving again is recognised
        assert_eq!(
            member.engine.commit_block(block, false).await.unwrap(),
            CommitOutcome::AlreadyKnown
        );
    })
    .await
    .expect("test_thrusted_holder_serves_non_holder timed out");
}

#[tokio::test]
async fn test_announced_lcpoa_block_reaches_listener() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let mesh = LocalMesh::new();
        let start = genesis(120_000);
        let miner = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &[], lcpoa::CONSENSUS_NAME);
        let listener = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &[], lcpoa::CONSENSUS_NAME);
        mesh.connect(&miner.address(), &listener.address());

        // every suffix ending in "0", so one hash in sixteen qualifies
        let config = LcpoaConfig {
            block_endls: (0..4096).map(|n| format!("{:03x}0", n)).collect(),
            variant_time: Duration::from_millis(0),
            ..LcpoaConfig::default()
        };
        miner
            .engine
            .register_validator(LcpoaValidator::new(miner.engine.context(), config.clone()));
        listener
            .engine
            .register_validator(LcpoaValidator::new(listener.engine.context(), config));

        let block = miner.engine.submit("mined payload").await.unwrap().expect("mined block");
        assert!(block.hash.ends_with('0'));
        wait_for_height(&listener, 1).await;
        assert_eq!(listener.engine.chain().latest_block().unwrap().hash, block.hash);
    })
    .await
    .expect("test_announced_lcpoa_block_reaches_listener timed out");
}

/// Counts generations and hands them to the engine.
struct CountingGenerator {
    engine: Arc<relaychain::consensus::ConsensusEngine>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl BlockGenerator for CountingGenerator {
    async fn generate(&self, payload: &str) -> Option<relaychain::blockchain::Block> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.engine.generate(payload).await
    }
}

#[tokio::test]
async fn test_transactor_confirms_delegated_block() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mesh = LocalMesh::new();
        let start = genesis(10_000);
        let producer_id = Arc::new(NodeIdentity::generate());
        let contract = whitelist(vec![producer_id.public_key_hex()]);

        let requester = spawn_node(&mesh, Arc::new(NodeIdentity::generate()), &start, &[], pos::CONSENSUS_NAME);
        let producer = spawn_node(&mesh, producer_id, &start, &[], pos::CONSENSUS_NAME);
        mesh.connect(&requester.address(), &producer.address());
        requester
            .engine
            .register_validator(PosValidator::new(requester.engine.context(), pos_config(), contract.clone()));
        producer
            .engine
            .register_validator(PosValidator::new(producer.engine.context(), pos_config(), contract));

        let transactor = Transactor::new(
            Arc::clone(requester.engine.chain()),
            TransactorConfig {
                accept_count: 2,
                max_attempts: 3,
                watch_interval: Duration::from_millis(10),
                regenerate_delay: Duration::from_millis(10),
            },
        );
        let generator = Arc::new(CountingGenerator {
            engine: Arc::clone(&requester.engine),
            calls: AtomicUsize::new(0),
        });

        let first = transactor
            .submit(r#"{"type":"Transfer","n":1}"#, generator.clone(), None)
            .await
            .unwrap();
        assert!(transactor.watch().await.confirmed.is_empty());

        // two more blocks bury the first one
        for n in 2..=3 {
            // request timestamps double as block times and must grow
            tokio::time::sleep(Duration::from_millis(5)).await;
            let payload = format!(r#"{{"type":"Transfer","n":{}}}"#, n);
            requester.engine.submit(&payload).await.unwrap().expect("delegated block");
        }
        assert_eq!(requester.height(), 3);
        assert_eq!(transactor.watch().await.confirmed, vec![first]);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    })
    .await
    .expect("test_transactor_confirms_delegated_block timed out");
}
