//! Node-level flows: bootstrap, dumb transaction rounds, the read-only
//! contract query path and the pagination contract.

use std::sync::Arc;

use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use tempfile::TempDir;

use conclave_chain::config::{GenesisAccount, GenesisConfig, NodeConfig};
use conclave_chain::interfaces::{
    ChannelTransport, ExecuteResult, ExecutorStatus, MockExecutor, Transport,
};
use conclave_chain::node::{derive_contract_address, Node, NodeHandle, TransactionState};
use conclave_chain::types::{
    Address, Amount, ByteCodeObject, Commission, SmartContractInvocation, Transaction, Variant,
};

fn keypair(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

fn test_config(dir: &TempDir, funded: &[&Keypair]) -> NodeConfig {
    NodeConfig {
        data_dir: dir.path().join("data"),
        key_path: dir.path().join("keys/node.toml"),
        genesis: GenesisConfig {
            chain_id: "test".into(),
            accounts: funded
                .iter()
                .map(|keypair| GenesisAccount {
                    public_key: hex::encode(keypair.public.to_bytes()),
                    balance: "100000".into(),
                })
                .collect(),
        },
        ..NodeConfig::default()
    }
}

fn start_node(dir: &TempDir, funded: &[&Keypair], executor: Arc<MockExecutor>) -> NodeHandle {
    let config = test_config(dir, funded);
    let transport = Arc::new(ChannelTransport::default());
    let (node, sender) = Node::new(config, transport.clone() as Arc<dyn Transport>, executor)
        .expect("node boots");
    transport.register(*node.handle().public_key(), sender);
    let handle = node.handle();
    // The driver loop is not started: tests trigger rounds explicitly
    // through the handle.
    drop(node);
    handle
}

fn signed_transfer(sender: &Keypair, target: &Keypair, inner_id: u64, amount: i32) -> Transaction {
    let mut trx = Transaction::new(
        inner_id,
        Address::PublicKey(sender.public.to_bytes()),
        Address::PublicKey(target.public.to_bytes()),
        Amount::from_integral(amount),
        Commission::from_f64(0.1),
    );
    trx.sign(sender);
    trx
}

#[test]
fn dumb_flow_seals_a_block_and_moves_balances() {
    let dir = TempDir::new().unwrap();
    let sender = keypair(10);
    let receiver = keypair(11);
    let handle = start_node(&dir, &[&sender], Arc::new(MockExecutor::default()));

    let genesis_sequence = handle.store().last_sequence().unwrap();
    let response = handle
        .transaction_flow(signed_transfer(&sender, &receiver, 1, 25), None)
        .unwrap();
    assert_eq!(response.code, 0, "{}", response.message);

    handle.run_round().unwrap();

    assert_eq!(
        handle.store().last_sequence().unwrap(),
        genesis_sequence + 1,
    );
    let sealed = handle
        .store()
        .load(genesis_sequence + 1)
        .unwrap()
        .expect("block sealed");
    assert_eq!(sealed.transaction_count(), 1);

    let receiver_balance = handle
        .wallets()
        .balance(&Address::PublicKey(receiver.public.to_bytes()))
        .unwrap();
    assert_eq!(receiver_balance, Amount::from_integral(25));

    // The sealed transaction reports Valid through the state query.
    let states = handle
        .transactions_state(&Address::PublicKey(sender.public.to_bytes()), &[1])
        .unwrap();
    assert_eq!(states, vec![(1, TransactionState::Valid)]);
}

#[test]
fn rejected_flow_reports_failure_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let sender = keypair(10);
    let receiver = keypair(11);
    let pauper = keypair(12);
    let handle = start_node(&dir, &[&sender], Arc::new(MockExecutor::default()));

    // Unknown wallet: rejected before entering the pipeline.
    let response = handle
        .transaction_flow(signed_transfer(&pauper, &receiver, 1, 5), None)
        .unwrap();
    assert_eq!(response.code, 1);

    // Funded wallet, tampered signature.
    let mut tampered = signed_transfer(&sender, &receiver, 2, 5);
    let mut signature = *tampered.signature();
    signature[0] ^= 0xff;
    tampered.set_signature(signature);
    let response = handle.transaction_flow(tampered, None).unwrap();
    assert_eq!(response.code, 1);
    assert!(response.message.contains("signature"));

    handle.run_round().unwrap();
    // Only the genesis pool exists.
    assert_eq!(handle.store().last_sequence().unwrap(), 0);
}

#[test]
fn queued_transaction_reports_in_progress() {
    let dir = TempDir::new().unwrap();
    let sender = keypair(10);
    let receiver = keypair(11);
    let handle = start_node(&dir, &[&sender], Arc::new(MockExecutor::default()));

    handle
        .transaction_flow(signed_transfer(&sender, &receiver, 7, 1), None)
        .unwrap();
    let states = handle
        .transactions_state(&Address::PublicKey(sender.public.to_bytes()), &[7])
        .unwrap();
    assert_eq!(states, vec![(7, TransactionState::InProgress)]);
}

#[test]
fn forget_new_state_executes_without_touching_the_chain() {
    let dir = TempDir::new().unwrap();
    let sender = keypair(10);
    let executor = Arc::new(MockExecutor::default());
    executor.script_execution(
        "",
        ExecuteResult {
            status: ExecutorStatus::ok(),
            new_state: b"ignored".to_vec(),
            results: vec![Variant::Integer(42)],
        },
    );
    let handle = start_node(&dir, &[&sender], executor);

    let invocation = SmartContractInvocation {
        bytecode_objects: vec![ByteCodeObject {
            name: "Main".into(),
            bytecode: vec![1, 2, 3],
        }],
        forget_new_state: true,
        ..SmartContractInvocation::default()
    };
    let contract = derive_contract_address(&sender.public.to_bytes(), 3, &invocation);
    let mut trx = Transaction::new(
        3,
        Address::PublicKey(sender.public.to_bytes()),
        Address::PublicKey(contract),
        Amount::zero(),
        Commission::from_f64(0.5),
    );
    trx.sign(&sender);

    let response = handle.transaction_flow(trx, Some(invocation)).unwrap();
    assert_eq!(response.code, 0, "{}", response.message);
    assert_eq!(response.smart_result, Some(Variant::Integer(42)));

    // Nothing was broadcast or appended and no index was touched.
    handle.run_round().unwrap();
    assert_eq!(handle.store().last_sequence().unwrap(), 0);
    assert!(handle.tracker().origin(&contract).is_none());
}

#[test]
fn deploy_to_a_mismatched_address_is_rejected() {
    let dir = TempDir::new().unwrap();
    let sender = keypair(10);
    let handle = start_node(&dir, &[&sender], Arc::new(MockExecutor::default()));

    let invocation = SmartContractInvocation {
        bytecode_objects: vec![ByteCodeObject {
            name: "Main".into(),
            bytecode: vec![1, 2, 3],
        }],
        forget_new_state: true,
        ..SmartContractInvocation::default()
    };
    let mut trx = Transaction::new(
        3,
        Address::PublicKey(sender.public.to_bytes()),
        Address::PublicKey([9u8; 32]),
        Amount::zero(),
        Commission::from_f64(0.5),
    );
    trx.sign(&sender);

    let response = handle.transaction_flow(trx, Some(invocation)).unwrap();
    assert_eq!(response.code, 1);
    assert!(response.message.contains("bad smart contract address"));
}

#[test]
fn pagination_contract_and_pool_listing() {
    let dir = TempDir::new().unwrap();
    let sender = keypair(10);
    let handle = start_node(&dir, &[&sender], Arc::new(MockExecutor::default()));

    assert!(!NodeHandle::validate_pagination(-1, 10));
    assert!(!NodeHandle::validate_pagination(0, 0));
    assert!(!NodeHandle::validate_pagination(0, 101));
    assert!(NodeHandle::validate_pagination(0, 100));

    // Genesis-only chain: one pool, count 1.
    let (count, pools) = handle.pool_list(0, 1).unwrap();
    assert_eq!(count, 1);
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].sequence(), 0);

    // Offset past the head yields an empty page with the same count.
    let (count, pools) = handle.pool_list(5, 1).unwrap();
    assert_eq!(count, 1);
    assert!(pools.is_empty());
}
