//! Contract lifecycle scenarios driven through the tracker against a real
//! store: deploy/invoke/new-state pairing, invocation timeout, waiter
//! behaviour and fork recovery.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use tempfile::tempdir;

use conclave_chain::crypto::sign_message;
use conclave_chain::interfaces::{Executor, MockExecutor};
use conclave_chain::storage::BlockStore;
use conclave_chain::tracker::{ContractTracker, OperationState};
use conclave_chain::types::{
    pool_fields, trx_fields, Address, Amount, ByteCodeObject, Commission, Pool, PoolHash,
    SmartContractInvocation, SmartContractRef, Transaction, UserField, Variant,
};
use conclave_chain::wallets::WalletsCache;

fn keypair(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

fn seal(mut pool: Pool, writer: &Keypair) -> Pool {
    pool.set_confidants(vec![writer.public.to_bytes()]);
    pool.set_real_trusted_mask(0b1);
    let digest = pool.signing_digest();
    pool.add_signature(0, sign_message(writer, &digest).to_bytes());
    pool.sign_by_writer(writer);
    pool.compose();
    pool
}

fn empty_pool(store: &BlockStore, writer: &Keypair, timestamp: i64) -> Pool {
    let sequence = store.last_sequence().map(|s| s + 1).unwrap_or(0);
    let mut pool = Pool::new(store.last_hash(), sequence);
    pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(timestamp));
    seal(pool, writer)
}

fn deploy_transaction(deployer: &Keypair, contract: [u8; 32]) -> Transaction {
    let invocation = SmartContractInvocation {
        source_code: "contract Counter {}".into(),
        bytecode_objects: vec![ByteCodeObject {
            name: "Counter".into(),
            bytecode: vec![0xca, 0xfe],
        }],
        ..SmartContractInvocation::default()
    };
    let mut trx = Transaction::new(
        1,
        Address::PublicKey(deployer.public.to_bytes()),
        Address::PublicKey(contract),
        Amount::zero(),
        Commission::from_f64(0.5),
    );
    trx.add_user_field(
        trx_fields::SMART_INVOKE,
        UserField::Bytes(invocation.encode()),
    );
    trx.sign(deployer);
    trx
}

fn invoke_transaction(caller: &Keypair, contract: [u8; 32], inner_id: u64) -> Transaction {
    let invocation = SmartContractInvocation {
        method: "m".into(),
        params: vec![Variant::Integer(1)],
        ..SmartContractInvocation::default()
    };
    let mut trx = Transaction::new(
        inner_id,
        Address::PublicKey(caller.public.to_bytes()),
        Address::PublicKey(contract),
        Amount::zero(),
        Commission::from_f64(0.5),
    );
    trx.add_user_field(
        trx_fields::SMART_INVOKE,
        UserField::Bytes(invocation.encode()),
    );
    trx.sign(caller);
    trx
}

fn new_state_transaction(
    contract: &Keypair,
    initiating: &SmartContractRef,
    state: &[u8],
    inner_id: u64,
) -> Transaction {
    let mut trx = Transaction::new(
        inner_id,
        Address::PublicKey(contract.public.to_bytes()),
        Address::PublicKey(contract.public.to_bytes()),
        Amount::zero(),
        Commission::from_f64(0.1),
    );
    trx.add_user_field(trx_fields::NEW_STATE_VALUE, UserField::Bytes(state.to_vec()));
    trx.add_user_field(trx_fields::NEW_STATE_REF, initiating.to_user_field());
    trx.add_user_field(
        trx_fields::NEW_STATE_RET_VAL,
        UserField::Bytes(bincode::serialize(&Variant::Boolean(true)).unwrap()),
    );
    trx.sign(contract);
    trx
}

fn pool_with(store: &BlockStore, writer: &Keypair, timestamp: i64, trx: Transaction) -> Pool {
    let sequence = store.last_sequence().map(|s| s + 1).unwrap_or(0);
    let mut pool = Pool::new(store.last_hash(), sequence);
    pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(timestamp));
    pool.add_transaction(trx);
    seal(pool, writer)
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<BlockStore>,
    tracker: Arc<ContractTracker>,
    writer: Keypair,
}

fn fixture(max_rounds_cancel: u64) -> Fixture {
    let dir = tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path()).unwrap());
    let wallets = Arc::new(WalletsCache::new());
    let executor: Arc<dyn Executor> = Arc::new(MockExecutor::with_methods(&["m"]));
    let tracker = Arc::new(ContractTracker::new(
        Arc::clone(&store),
        wallets,
        executor,
        max_rounds_cancel,
    ));
    let writer = keypair(1);
    let genesis = empty_pool(&store, &writer, 1_000);
    store.append(&genesis).unwrap();
    Fixture {
        _dir: dir,
        store,
        tracker,
        writer,
    }
}

#[test]
fn deploy_invoke_new_state_lifecycle() {
    let fx = fixture(100);
    let deployer = keypair(2);
    let contract = keypair(3);
    let contract_key = contract.public.to_bytes();

    let deploy_pool = pool_with(
        &fx.store,
        &fx.writer,
        2_000,
        deploy_transaction(&deployer, contract_key),
    );
    fx.store.append(&deploy_pool).unwrap();

    let invoke_pool = pool_with(
        &fx.store,
        &fx.writer,
        3_000,
        invoke_transaction(&deployer, contract_key, 2),
    );
    fx.store.append(&invoke_pool).unwrap();

    let reference = SmartContractRef::new(invoke_pool.hash().clone(), invoke_pool.sequence(), 0);
    let state_pool = pool_with(
        &fx.store,
        &fx.writer,
        4_000,
        new_state_transaction(&contract, &reference, b"s1", 3),
    );
    fx.store.append(&state_pool).unwrap();

    fx.tracker.scan_new_blocks(false).unwrap();

    // Deploy index points at the deploy transaction.
    let origin = fx.tracker.origin(&contract_key).unwrap();
    assert_eq!(origin, deploy_pool.transaction_id(0));

    // The invoke transitioned to Success with its new-state recorded.
    let invoke_id = invoke_pool.transaction_id(0);
    let operation = fx.tracker.operation(&invoke_id).unwrap();
    assert_eq!(operation.state, OperationState::Success);
    assert_eq!(operation.state_transaction, Some(state_pool.transaction_id(0)));
    assert!(operation.has_ret_val);
    assert_eq!(operation.return_value, Some(Variant::Boolean(true)));

    // The stored contract state is the new one.
    let state = fx.tracker.contract_state(&contract_key).unwrap();
    assert_eq!(state.state, b"s1".to_vec());
    assert!(!state.last_empty);
    assert_eq!(state.initiating_transaction, Some(invoke_id));

    // Method execution counter follows the paired invoke.
    assert_eq!(fx.tracker.execute_count("m"), Some(1));

    // Deploys index by creator.
    let deployed = fx.tracker.deployed_by(&deployer.public.to_bytes());
    assert_eq!(deployed, vec![deploy_pool.transaction_id(0)]);
}

#[test]
fn empty_new_state_fails_the_operation_and_keeps_old_state() {
    let fx = fixture(100);
    let deployer = keypair(2);
    let contract = keypair(3);
    let contract_key = contract.public.to_bytes();

    let deploy_pool = pool_with(
        &fx.store,
        &fx.writer,
        2_000,
        deploy_transaction(&deployer, contract_key),
    );
    fx.store.append(&deploy_pool).unwrap();
    let deploy_ref = SmartContractRef::new(deploy_pool.hash().clone(), deploy_pool.sequence(), 0);
    let first_state = pool_with(
        &fx.store,
        &fx.writer,
        3_000,
        new_state_transaction(&contract, &deploy_ref, b"genesis-state", 2),
    );
    fx.store.append(&first_state).unwrap();

    let invoke_pool = pool_with(
        &fx.store,
        &fx.writer,
        4_000,
        invoke_transaction(&deployer, contract_key, 3),
    );
    fx.store.append(&invoke_pool).unwrap();
    let invoke_ref = SmartContractRef::new(invoke_pool.hash().clone(), invoke_pool.sequence(), 0);
    let failed_state = pool_with(
        &fx.store,
        &fx.writer,
        5_000,
        new_state_transaction(&contract, &invoke_ref, b"", 4),
    );
    fx.store.append(&failed_state).unwrap();

    fx.tracker.scan_new_blocks(false).unwrap();

    let operation = fx.tracker.operation(&invoke_pool.transaction_id(0)).unwrap();
    assert_eq!(operation.state, OperationState::Failed);

    // The previous state survives an empty new-state.
    let state = fx.tracker.contract_state(&contract_key).unwrap();
    assert_eq!(state.state, b"genesis-state".to_vec());
    assert!(state.last_empty);
}

#[test]
fn invocation_without_new_state_times_out_once() {
    let max_rounds = 3u64;
    let fx = fixture(max_rounds);
    let deployer = keypair(2);
    let contract = keypair(3);
    let contract_key = contract.public.to_bytes();

    let deploy_pool = pool_with(
        &fx.store,
        &fx.writer,
        2_000,
        deploy_transaction(&deployer, contract_key),
    );
    fx.store.append(&deploy_pool).unwrap();
    let invoke_pool = pool_with(
        &fx.store,
        &fx.writer,
        3_000,
        invoke_transaction(&deployer, contract_key, 2),
    );
    fx.store.append(&invoke_pool).unwrap();
    fx.tracker.scan_new_blocks(false).unwrap();

    let invoke_id = invoke_pool.transaction_id(0);
    assert_eq!(
        fx.tracker.operation(&invoke_id).unwrap().state,
        OperationState::Pending,
    );

    // Advance the chain just past the cancellation window.
    let invoke_sequence = invoke_pool.sequence();
    while fx.store.last_sequence().unwrap() < invoke_sequence + max_rounds {
        let pool = empty_pool(&fx.store, &fx.writer, 10_000);
        fx.store.append(&pool).unwrap();
    }
    fx.tracker.scan_new_blocks(false).unwrap();

    let operation = fx.tracker.operation(&invoke_id).unwrap();
    assert_eq!(operation.state, OperationState::Failed);
    assert!(operation.state_transaction.is_none());
}

#[test]
fn wait_for_smart_transaction_observes_the_queue() {
    let fx = fixture(100);
    let deployer = keypair(2);
    let contract = keypair(3);
    let contract_key = contract.public.to_bytes();

    // Empty queue with zero timeout: immediate timeout.
    assert_eq!(
        fx.tracker
            .wait_for_smart_transaction(contract_key, Duration::ZERO),
        None,
    );

    let deploy_pool = pool_with(
        &fx.store,
        &fx.writer,
        2_000,
        deploy_transaction(&deployer, contract_key),
    );
    fx.store.append(&deploy_pool).unwrap();
    fx.tracker.scan_new_blocks(false).unwrap();

    assert_eq!(
        fx.tracker
            .wait_for_smart_transaction(contract_key, Duration::ZERO),
        Some(deploy_pool.transaction_id(0)),
    );
}

#[test]
fn wait_till_front_times_out_without_consuming() {
    let fx = fixture(100);
    let contract = keypair(3);
    let woke = fx.tracker.wait_till_front(
        contract.public.to_bytes(),
        |state| !state.state.is_empty(),
        Duration::from_millis(20),
    );
    assert!(!woke);
}

#[test]
fn fork_recovery_replays_the_new_branch() {
    let fx = fixture(100);
    let deployer = keypair(2);
    let old_contract = keypair(3);
    let new_contract = keypair(4);

    // Old branch: deploy at sequence 1, invoke at sequence 2.
    let old_deploy = pool_with(
        &fx.store,
        &fx.writer,
        2_000,
        deploy_transaction(&deployer, old_contract.public.to_bytes()),
    );
    fx.store.append(&old_deploy).unwrap();
    let old_invoke = pool_with(
        &fx.store,
        &fx.writer,
        3_000,
        invoke_transaction(&deployer, old_contract.public.to_bytes(), 2),
    );
    fx.store.append(&old_invoke).unwrap();
    fx.tracker.scan_new_blocks(false).unwrap();
    assert!(fx.tracker.origin(&old_contract.public.to_bytes()).is_some());

    // The sync layer adopts a different branch from the genesis.
    fx.store.rewind_to(0).unwrap();
    let new_deploy = pool_with(
        &fx.store,
        &fx.writer,
        2_500,
        deploy_transaction(&deployer, new_contract.public.to_bytes()),
    );
    fx.store.append(&new_deploy).unwrap();
    let filler = empty_pool(&fx.store, &fx.writer, 3_500);
    fx.store.append(&filler).unwrap();

    fx.tracker.scan_new_blocks(false).unwrap();

    // Indices now match a from-scratch scan of the new chain.
    assert!(fx.tracker.origin(&old_contract.public.to_bytes()).is_none());
    assert_eq!(
        fx.tracker.origin(&new_contract.public.to_bytes()),
        Some(new_deploy.transaction_id(0)),
    );
    assert!(fx
        .tracker
        .operation(&old_invoke.transaction_id(0))
        .is_none());

    let fresh = ContractTracker::new(
        Arc::clone(&fx.store),
        Arc::new(WalletsCache::new()),
        Arc::new(MockExecutor::default()) as Arc<dyn Executor>,
        100,
    );
    fresh.scan_new_blocks(true).unwrap();
    assert_eq!(
        fresh.origin(&new_contract.public.to_bytes()),
        fx.tracker.origin(&new_contract.public.to_bytes()),
    );
    assert_eq!(
        fresh.deployed_by(&deployer.public.to_bytes()),
        fx.tracker.deployed_by(&deployer.public.to_bytes()),
    );
}
