use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::consensus::{ConsensusConfig, ConsensusEngine, NodeLevel, StageOne, StageOutcome,
    StageThree, StageTwo};
use crate::conveyer::{Conveyer, RoundTable};
use crate::crypto::{
    blake2b_256, load_or_generate_keypair, public_key_bytes_from_hex, PUBLIC_KEY_SIZE,
};
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::{Executor, IncomingMessage, MethodHeader, MsgType, Transport};
use crate::storage::BlockStore;
use crate::tracker::{ContractTracker, SmartState};
use crate::types::{
    pool_fields, trx_fields, Address, Amount, Commission, NewWalletInfo, Pool, PoolHash,
    SmartContractInvocation, SmartContractRef, Transaction, TransactionId, UserField, Variant,
    WalletAddressKind,
};
use crate::validation::BlockValidator;
use crate::wallets::WalletsCache;

/// Upper bound passed to the executor for one invocation.
const MAX_EXECUTION_TIME_MS: u64 = 1_000;
/// Floor fee a transaction must at least offer.
const MIN_FEE: f64 = 0.000_1;

/// Per-inner-id standing reported by the transactions-state query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Valid,
    Invalid,
    InProgress,
}

/// Result of the transaction-flow entry point, marshalled by the API layer.
#[derive(Clone, Debug)]
pub struct FlowResponse {
    pub code: u8,
    pub message: String,
    pub round: u64,
    pub smart_result: Option<Variant>,
}

impl FlowResponse {
    fn success(round: u64, message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            round,
            smart_result: None,
        }
    }

    fn failure(round: u64, message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
            round,
            smart_result: None,
        }
    }

    fn in_progress(round: u64) -> Self {
        Self {
            code: 4,
            message: "transaction in progress".into(),
            round,
            smart_result: None,
        }
    }
}

pub struct Node {
    inner: Arc<NodeInner>,
    incoming: UnboundedReceiver<IncomingMessage>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

pub struct NodeInner {
    config: NodeConfig,
    public_key: [u8; PUBLIC_KEY_SIZE],
    store: Arc<BlockStore>,
    wallets: Arc<WalletsCache>,
    conveyer: Arc<Conveyer>,
    tracker: Arc<ContractTracker>,
    validator: BlockValidator,
    engine: Mutex<ConsensusEngine>,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    stop: Arc<AtomicBool>,
    tracker_handle: Mutex<Option<JoinHandle<()>>>,
}

fn duplicate_keypair(keypair: &Keypair) -> ChainResult<Keypair> {
    let secret = SecretKey::from_bytes(&keypair.secret.to_bytes())
        .map_err(|err| ChainError::Crypto(format!("keypair duplication failed: {err}")))?;
    let public = PublicKey::from(&secret);
    Ok(Keypair { secret, public })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Node {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
    ) -> ChainResult<(Self, UnboundedSender<IncomingMessage>)> {
        config.ensure_directories()?;
        let keypair = load_or_generate_keypair(&config.key_path)?;
        let public_key = keypair.public.to_bytes();
        let db_path = config.data_dir.join("db");
        let store = Arc::new(BlockStore::open(&db_path)?);

        let wallets = Arc::new(WalletsCache::new());
        wallets.bootstrap(&store)?;
        for account in &config.genesis.accounts {
            let key = public_key_bytes_from_hex(&account.public_key)?;
            wallets.grant(key, account.balance_value()?);
        }
        wallets.grant(public_key, Amount::from_integral(1_000_000));

        if store.is_empty() {
            let genesis = build_genesis(&keypair)?;
            store.append(&genesis)?;
            wallets.apply_pool(&genesis);
            info!(hash = %genesis.hash(), "wrote genesis pool");
        }

        let engine = ConsensusEngine::new(
            duplicate_keypair(&keypair)?,
            ConsensusConfig {
                min_stake: config.min_stake_value()?,
                starting_dpos_round: config.starting_dpos_round,
                gray_list_penalty: config.gray_list_penalty,
            },
        );

        let tracker = Arc::new(ContractTracker::new(
            Arc::clone(&store),
            Arc::clone(&wallets),
            Arc::clone(&executor),
            config.max_rounds_cancel_contract,
        ));

        let (sender, incoming) = unbounded_channel();
        let inner = Arc::new(NodeInner {
            config,
            public_key,
            store,
            wallets,
            conveyer: Arc::new(Conveyer::new()),
            tracker,
            validator: BlockValidator::new(),
            engine: Mutex::new(engine),
            transport,
            executor,
            stop: Arc::new(AtomicBool::new(false)),
            tracker_handle: Mutex::new(None),
        });
        Ok((Self { inner, incoming }, sender))
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Runs the consensus driver until stopped: the tracker worker is
    /// spawned, then rounds tick on the configured interval while incoming
    /// consensus messages are pumped into the engine.
    pub async fn start(mut self) -> ChainResult<()> {
        info!(key = %hex::encode(self.inner.public_key), "starting node");
        let tracker_handle = self
            .inner
            .tracker
            .spawn(Arc::clone(&self.inner.stop));
        *self.inner.tracker_handle.lock() = Some(tracker_handle);

        let mut ticker = time::interval(Duration::from_millis(self.inner.config.round_interval_ms));
        let mut stage_ticker =
            time::interval(Duration::from_millis(self.inner.config.stage_timeout_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = self.inner.produce_round() {
                        match err {
                            ChainError::Fatal(_) => return Err(err),
                            err => warn!(?err, "round failed"),
                        }
                    }
                }
                _ = stage_ticker.tick() => {
                    self.inner.request_missing_stages();
                }
                message = self.incoming.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(err) = self.inner.handle_message(message) {
                                warn!(?err, "dropping malformed message");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.inner.shutdown();
        Ok(())
    }
}

fn build_genesis(keypair: &Keypair) -> ChainResult<Pool> {
    let mut pool = Pool::new(PoolHash::empty(), 0);
    pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(now_millis()));
    pool.set_confidants(vec![keypair.public.to_bytes()]);
    pool.set_real_trusted_mask(0b1);
    let digest = pool.signing_digest();
    pool.add_signature(0, crate::crypto::sign_message(keypair, &digest).to_bytes());
    pool.sign_by_writer(keypair);
    pool.compose();
    Ok(pool)
}

impl NodeInner {
    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.store.notify_waiters();
        if let Some(handle) = self.tracker_handle.lock().take() {
            let _ = handle.join();
        }
        if let Err(err) = self.store.flush() {
            warn!(?err, "flush on shutdown failed");
        }
        info!("node stopped");
    }

    /// Drives one full round with this node in the writer seat. With a
    /// single local confidant the three stages collapse to their own
    /// messages; with peers the stage exchange continues via
    /// `handle_message`.
    fn produce_round(&self) -> ChainResult<()> {
        if self.conveyer.round_table().confidants.len() > 1 {
            // A multi-validator table is governed by the round scheduler
            // feeding RoundTable messages; the ticker only drives solo
            // operation.
            return Ok(());
        }
        let round = self.store.last_sequence().map(|s| s + 1).unwrap_or(0);
        let table = RoundTable {
            round,
            confidants: vec![self.public_key],
            hashes: Vec::new(),
        };
        self.conveyer.set_round_table(table.clone());
        self.transport
            .broadcast(MsgType::RoundTable, round, &table.to_bytes());
        let packet_hash = self.conveyer.flush_packet();
        let transactions = self
            .conveyer
            .take_transactions(self.config.max_block_transactions);
        if transactions.is_empty() {
            if let Some(hash) = packet_hash {
                self.conveyer.discard_packet(&hash);
            }
            return Ok(());
        }

        let mut engine = self.engine.lock();
        engine.next_round(table);
        engine.build_stage_one(now_millis() as u64, packet_hash.into_iter().collect())?;
        engine.build_stage_two()?;

        let mut candidate = self.build_candidate(round, &transactions)?;
        let digest = engine.prepare_candidate(&mut candidate)?;
        engine.build_stage_three(digest)?;
        match engine.outcome() {
            StageOutcome::Finish => {
                let sealed = engine.seal_pool(candidate)?;
                drop(engine);
                self.store.defer_pool(sealed.clone());
                self.commit_deferred()?;
                if let Some(hash) = packet_hash {
                    self.conveyer.discard_packet(&hash);
                }
            }
            outcome => {
                drop(engine);
                debug!(?outcome, "round did not converge locally");
            }
        }
        Ok(())
    }

    /// Assembles the writer's candidate pool: accepted transactions plus
    /// new-wallet assignments for addresses seen for the first time.
    fn build_candidate(&self, sequence: u64, transactions: &[Transaction]) -> ChainResult<Pool> {
        let mut pool = Pool::new(self.store.last_hash(), sequence);
        pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(now_millis()));
        let mut next_id = self.wallets.next_wallet_id();
        let mut assigned: std::collections::HashSet<[u8; PUBLIC_KEY_SIZE]> =
            std::collections::HashSet::new();
        for (index, transaction) in transactions.iter().enumerate() {
            for (kind, address) in [
                (WalletAddressKind::Source, &transaction.source),
                (WalletAddressKind::Target, &transaction.target),
            ] {
                if let Address::PublicKey(key) = address {
                    if self.wallets.data(address).is_none() && assigned.insert(*key) {
                        pool.add_new_wallet(NewWalletInfo {
                            transaction_index: index as u64,
                            kind,
                            wallet_id: next_id,
                        });
                        next_id += 1;
                    }
                }
            }
            pool.add_transaction(transaction.clone());
        }
        Ok(pool)
    }

    /// Validates and appends the deferred pool; on rejection the slot is
    /// dropped.
    fn commit_deferred(&self) -> ChainResult<()> {
        let Some(pool) = self.store.deferred_pool() else {
            return Ok(());
        };
        match self.validator.validate_block(&self.store, &self.wallets, &pool) {
            Ok(()) => {
                self.store.append(&pool)?;
                self.wallets.apply_pool(&pool);
                self.store.discard_deferred();
                let (compressed, uncompressed) = pool.to_lz4_bytes();
                let mut payload = uncompressed.to_le_bytes().to_vec();
                payload.extend_from_slice(&compressed);
                self.transport
                    .broadcast(MsgType::BlockReply, pool.sequence(), &payload);
                Ok(())
            }
            Err(err) => {
                self.store.discard_deferred();
                Err(err)
            }
        }
    }

    /// Dispatches one transport message into the consensus machinery.
    fn handle_message(&self, message: IncomingMessage) -> ChainResult<()> {
        match message.msg_type {
            MsgType::RoundTable => {
                let table = RoundTable::from_bytes(&message.payload)?;
                self.conveyer.set_round_table(table.clone());
                self.engine.lock().next_round(table);
            }
            MsgType::Hash => {
                let hash = PoolHash::from_bytes(message.payload)?;
                let mut engine = self.engine.lock();
                engine.on_hash(hash, message.sender, &self.wallets, self.store.last_sequence());
            }
            MsgType::Stage1 => {
                let stage = StageOne::from_bytes(&message.payload)?;
                let mut engine = self.engine.lock();
                if engine.on_stage_one(stage) && engine.confidant_index().is_some() {
                    let stage_two = engine.build_stage_two()?;
                    drop(engine);
                    self.transport
                        .broadcast(MsgType::Stage2, message.round, &stage_two.to_bytes());
                }
            }
            MsgType::Stage2 => {
                let stage = StageTwo::from_bytes(&message.payload)?;
                let mut engine = self.engine.lock();
                if engine.on_stage_two(stage) && engine.confidant_index().is_some() {
                    let transactions = self
                        .conveyer
                        .take_transactions(self.config.max_block_transactions);
                    let mut candidate = self.build_candidate(
                        self.store.last_sequence().map(|s| s + 1).unwrap_or(0),
                        &transactions,
                    )?;
                    let digest = engine.prepare_candidate(&mut candidate)?;
                    let stage_three = engine.build_stage_three(digest)?;
                    self.store.defer_pool(candidate);
                    drop(engine);
                    self.transport
                        .broadcast(MsgType::Stage3, message.round, &stage_three.to_bytes());
                }
            }
            MsgType::Stage3 => {
                let stage = StageThree::from_bytes(&message.payload)?;
                let mut engine = self.engine.lock();
                match engine.on_stage_three(stage) {
                    StageOutcome::Finish => {
                        let is_writer = engine.level() == NodeLevel::Writer
                            || engine.writer_index() == engine.confidant_index();
                        if is_writer {
                            if let Some(candidate) = self.store.take_deferred() {
                                let sealed = engine.seal_pool(candidate)?;
                                drop(engine);
                                self.store.defer_pool(sealed);
                                self.commit_deferred()?;
                            }
                        }
                    }
                    StageOutcome::Retry => {
                        if engine.retry_stage_three() {
                            if let Some(mut candidate) = self.store.take_deferred() {
                                let digest = engine.prepare_candidate(&mut candidate)?;
                                let stage_three = engine.build_stage_three(digest)?;
                                self.store.defer_pool(candidate);
                                drop(engine);
                                self.transport.broadcast(
                                    MsgType::Stage3,
                                    message.round,
                                    &stage_three.to_bytes(),
                                );
                            }
                        } else {
                            drop(engine);
                            // Degenerate mask: the round fails with no block
                            // at this sequence.
                            self.store.discard_deferred();
                        }
                    }
                    StageOutcome::Failure => {
                        drop(engine);
                        self.store.discard_deferred();
                    }
                    StageOutcome::Pending => {}
                }
            }
            MsgType::Stage1Request | MsgType::Stage2Request | MsgType::Stage3Request => {
                self.answer_stage_request(&message)?;
            }
            MsgType::BlockReply => {
                if message.payload.len() < 4 {
                    return Err(ChainError::MalformedBinary("short block reply".into()));
                }
                let uncompressed =
                    u32::from_le_bytes(message.payload[..4].try_into().expect("4 bytes"));
                let pool = Pool::from_lz4_bytes(&message.payload[4..], uncompressed)?;
                if Some(pool.sequence()) == self.store.last_sequence().map(|s| s + 1) {
                    pool.verify_writer_signature()?;
                    self.validator
                        .validate_block(&self.store, &self.wallets, &pool)?;
                    self.store.append(&pool)?;
                    self.wallets.apply_pool(&pool);
                    let mut engine = self.engine.lock();
                    engine.on_store_synced(&self.wallets, self.store.last_sequence());
                }
            }
            MsgType::TransactionsPacket | MsgType::PacketHashesReply => {
                let mut reader = crate::codec::ByteReader::new(&message.payload);
                let count = reader.get_varint()?;
                for _ in 0..count {
                    let transaction = Transaction::read_from(&mut reader)?;
                    self.conveyer.add_transaction(transaction);
                }
            }
            MsgType::PacketHashesRequest => {
                let mut reader = crate::codec::ByteReader::new(&message.payload);
                let hash: [u8; 32] = reader.get_fixed()?;
                if let Some(packet) = self.conveyer.packet_by_hash(&hash) {
                    let mut writer = crate::codec::ByteWriter::new();
                    writer.put_varint(packet.transactions().len() as u64);
                    for transaction in packet.transactions() {
                        transaction.write_to(&mut writer);
                    }
                    self.transport.unicast(
                        &message.sender,
                        MsgType::PacketHashesReply,
                        message.round,
                        &writer.into_bytes(),
                    );
                }
            }
            other => {
                debug!(?other, "message type handled by an outer layer");
            }
        }
        Ok(())
    }

    /// On a stage window expiring, ask each silent confidant for its
    /// missing message instead of giving the round up.
    fn request_missing_stages(&self) {
        let engine = self.engine.lock();
        if engine.confidant_index().is_none() {
            return;
        }
        let round = engine.round();
        let table = self.conveyer.round_table();
        if table.confidants.len() < 2 {
            return;
        }
        let (msg_type, missing) = if !engine.stage_one_complete() {
            (MsgType::Stage1Request, engine.missing_stage_one())
        } else if !engine.stage_two_complete() {
            (MsgType::Stage2Request, engine.missing_stage_two())
        } else {
            return;
        };
        drop(engine);
        for index in missing {
            if let Some(target) = table.confidant_by_index(index) {
                debug!(index, ?msg_type, "requesting missing stage");
                self.transport.unicast(target, msg_type, round, &[index]);
            }
        }
    }

    fn answer_stage_request(&self, message: &IncomingMessage) -> ChainResult<()> {
        if message.payload.is_empty() {
            return Err(ChainError::MalformedBinary("empty stage request".into()));
        }
        let required = message.payload[0];
        let engine = self.engine.lock();
        let (reply_type, payload) = match message.msg_type {
            MsgType::Stage1Request => (
                MsgType::Stage1,
                engine.find_stage_one(required).map(StageOne::to_bytes),
            ),
            MsgType::Stage2Request => (
                MsgType::Stage2,
                engine.find_stage_two(required).map(StageTwo::to_bytes),
            ),
            _ => (
                MsgType::Stage3,
                engine.find_stage_three(required).map(StageThree::to_bytes),
            ),
        };
        drop(engine);
        if let Some(payload) = payload {
            self.transport
                .unicast(&message.sender, reply_type, message.round, &payload);
        }
        Ok(())
    }
}

impl NodeHandle {
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.inner.public_key
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.inner.store
    }

    pub fn wallets(&self) -> &Arc<WalletsCache> {
        &self.inner.wallets
    }

    pub fn tracker(&self) -> &Arc<ContractTracker> {
        &self.inner.tracker
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    pub fn current_round(&self) -> u64 {
        self.inner.conveyer.current_round()
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.store.notify_waiters();
    }

    /// Drives one consensus round immediately instead of waiting for the
    /// interval tick.
    pub fn run_round(&self) -> ChainResult<()> {
        self.inner.produce_round()
    }

    /// Accepts a signed transaction into the packet pipeline.
    pub fn submit_transaction(&self, transaction: Transaction) -> ChainResult<String> {
        if self.inner.conveyer.queued_transactions() >= self.inner.config.mempool_limit {
            return Err(ChainError::Transaction("mempool full".into()));
        }
        let digest = hex::encode(blake2b_256(&transaction.signable_bytes()));
        self.inner.conveyer.add_transaction(transaction);
        Ok(digest)
    }

    /// Standing of each inner id: sealed in a block, still travelling, or
    /// known invalid.
    pub fn transactions_state(
        &self,
        address: &Address,
        inner_ids: &[u64],
    ) -> ChainResult<Vec<(u64, TransactionState)>> {
        let mut result = Vec::with_capacity(inner_ids.len());
        for raw in inner_ids {
            let inner_id = raw & crate::types::INNER_ID_MASK;
            let state = if self
                .inner
                .store
                .find_transaction(address, inner_id)?
                .is_some()
            {
                TransactionState::Valid
            } else if self.inner.conveyer.contains_inner_id(inner_id) {
                TransactionState::InProgress
            } else if self.inner.conveyer.is_recently_invalid(inner_id) {
                TransactionState::Invalid
            } else {
                TransactionState::Valid
            };
            result.push((inner_id, state));
        }
        Ok(result)
    }

    /// Routes a client transaction to the dumb or smart flow.
    pub fn transaction_flow(
        &self,
        mut transaction: Transaction,
        invocation: Option<SmartContractInvocation>,
    ) -> ChainResult<FlowResponse> {
        let round = self.current_round();
        match invocation {
            None => self.dumb_flow(transaction, round),
            Some(invocation) => {
                // Invokes travel without bytecode or source; the deploy
                // transaction remains the single owner of both.
                let invocation = invocation.strip_for_invoke();
                transaction.add_user_field(
                    trx_fields::SMART_INVOKE,
                    UserField::Bytes(invocation.encode()),
                );
                self.smart_flow(transaction, invocation, round)
            }
        }
    }

    fn check_funds_and_signature(&self, transaction: &Transaction) -> Result<(), FlowResponse> {
        let round = self.current_round();
        let Some(source_key) = self.inner.wallets.resolve(&transaction.source) else {
            return Err(FlowResponse::failure(round, "wallet not found"));
        };
        let balance = self
            .inner
            .wallets
            .balance(&transaction.source)
            .unwrap_or_else(Amount::zero);
        let needed = transaction
            .amount
            .checked_add(&Amount::from_f64(MIN_FEE))
            .unwrap_or(transaction.amount);
        if needed > balance {
            return Err(FlowResponse::failure(
                round,
                format!("not enough money: needed {needed}, balance {balance}"),
            ));
        }
        let counted = Commission::from_f64(MIN_FEE);
        if !transaction.max_fee.covers(&counted) {
            return Err(FlowResponse::failure(
                round,
                format!("max fee is not enough, counted fee will be {}", counted.to_f64()),
            ));
        }
        if transaction.verify_signature(&source_key).is_err() {
            return Err(FlowResponse::failure(round, "wrong signature"));
        }
        Ok(())
    }

    fn dumb_flow(&self, transaction: Transaction, round: u64) -> ChainResult<FlowResponse> {
        if let Err(response) = self.check_funds_and_signature(&transaction) {
            return Ok(response);
        }
        let digest = self.submit_transaction(transaction)?;
        Ok(FlowResponse::success(round, digest))
    }

    fn smart_flow(
        &self,
        transaction: Transaction,
        invocation: SmartContractInvocation,
        round: u64,
    ) -> ChainResult<FlowResponse> {
        let deploy = invocation.is_deploy();
        if !invocation.forget_new_state {
            if let Err(response) = self.check_funds_and_signature(&transaction) {
                return Ok(response);
            }
        }

        let contract_key = match transaction.target {
            Address::PublicKey(key) => key,
            Address::WalletId(_) => match self.inner.wallets.resolve(&transaction.target) {
                Some(key) => key,
                None => return Ok(FlowResponse::failure(round, "unknown contract address")),
            },
        };

        // Resolve the bytecode: a deploy carries it, an invoke reads the
        // deploy transaction recorded for the contract.
        let bytecode = if deploy {
            let expected = derive_contract_address(
                &self.caller_key(&transaction)?,
                transaction.inner_id(),
                &invocation,
            );
            if expected != contract_key {
                return Ok(FlowResponse::failure(
                    round,
                    format!("bad smart contract address, expected {}", hex::encode(expected)),
                ));
            }
            invocation.bytecode_objects.clone()
        } else {
            let Some(origin_id) = self.inner.tracker.origin(&contract_key) else {
                return Ok(FlowResponse::failure(round, "contract is not deployed"));
            };
            let origin = self
                .inner
                .store
                .load_transaction(&origin_id)?
                .and_then(|trx| trx.invocation());
            match origin {
                Some(origin) => origin.bytecode_objects,
                None => return Ok(FlowResponse::failure(round, "deploy transaction missing")),
            }
        };

        let timeout = Duration::from_millis(self.inner.config.smart_wait_ms);

        if invocation.forget_new_state {
            // Read-only contract query: executed against the stored state,
            // never broadcast, no index touched.
            let mut state = Vec::new();
            if !deploy {
                let ready = self.inner.tracker.wait_till_front(
                    contract_key,
                    |snapshot: &SmartState| {
                        if snapshot.state.is_empty() {
                            return false;
                        }
                        state = snapshot.state.clone();
                        true
                    },
                    timeout,
                );
                if !ready {
                    return Ok(FlowResponse::in_progress(round));
                }
            }
            let caller = self.caller_key(&transaction)?;
            let headers = [MethodHeader {
                method: invocation.method.clone(),
                params: invocation.params.clone(),
            }];
            let result = self.inner.executor.execute_bytecode(
                &caller,
                &contract_key,
                &bytecode,
                &state,
                &headers,
                MAX_EXECUTION_TIME_MS,
            )?;
            if !result.status.is_ok() {
                return Ok(FlowResponse {
                    code: result.status.code,
                    message: result.status.message,
                    round,
                    smart_result: None,
                });
            }
            let mut response = FlowResponse::success(round, "executed");
            response.smart_result = result.results.into_iter().next();
            return Ok(response);
        }

        let signature = *transaction.signature();
        self.submit_transaction(transaction)?;

        if deploy {
            let ready = self.inner.tracker.wait_till_front(
                contract_key,
                |snapshot: &SmartState| !snapshot.state.is_empty(),
                timeout,
            );
            if !ready {
                return Ok(FlowResponse::in_progress(round));
            }
            return Ok(FlowResponse::success(round, "contract deployed"));
        }

        // An invoke waits for the new-state whose initiating transaction
        // carries our signature, then surfaces its return value.
        let store = Arc::clone(&self.inner.store);
        let mut new_state_empty = true;
        let mut state_trx_id: Option<TransactionId> = None;
        let ready = self.inner.tracker.wait_till_front(
            contract_key,
            |snapshot: &SmartState| {
                let Some(initiating_id) = snapshot.initiating_transaction.clone() else {
                    return false;
                };
                let Ok(Some(initiating)) = store.load_transaction(&initiating_id) else {
                    return false;
                };
                if *initiating.signature() != signature {
                    return false;
                }
                new_state_empty = snapshot.last_empty;
                state_trx_id = snapshot.state_transaction.clone();
                true
            },
            timeout,
        );
        if !ready {
            return Ok(FlowResponse::in_progress(round));
        }
        if new_state_empty {
            return Ok(FlowResponse::failure(
                round,
                "state is not updated, execution failed",
            ));
        }
        let mut response = FlowResponse::success(round, "executed");
        if let Some(id) = state_trx_id {
            if let Some(state_trx) = self.inner.store.load_transaction(&id)? {
                response.smart_result = state_trx
                    .user_field(trx_fields::NEW_STATE_RET_VAL)
                    .and_then(UserField::as_bytes)
                    .and_then(|bytes| bincode::deserialize(bytes).ok());
            }
        }
        Ok(response)
    }

    fn caller_key(&self, transaction: &Transaction) -> ChainResult<[u8; PUBLIC_KEY_SIZE]> {
        self.inner
            .wallets
            .resolve(&transaction.source)
            .or_else(|| transaction.source.public_key().copied())
            .ok_or_else(|| ChainError::NotFound("source wallet unknown".into()))
    }

    /// Validates the pagination contract shared by every listing query.
    pub fn validate_pagination(offset: i64, limit: i64) -> bool {
        offset >= 0 && limit > 0 && limit <= 100
    }

    /// Token operations of `token`, newest first: invokes are reported once
    /// their matching new-state appeared, mirroring the pairing the tracker
    /// maintains.
    pub fn token_transactions(
        &self,
        token: &[u8; PUBLIC_KEY_SIZE],
        transfers_only: bool,
        offset: usize,
        limit: usize,
    ) -> ChainResult<Vec<(TransactionId, Transaction, SmartContractInvocation)>> {
        // Bounded walk; anything past this depth is out of listing reach.
        const SCAN_CAP: usize = 10_000;
        let address = Address::PublicKey(*token);
        let history = self.inner.store.transactions_of(&address, 0, SCAN_CAP)?;
        let mut initiated: Vec<TransactionId> = Vec::new();
        let mut result = Vec::new();
        let mut skipped = 0usize;
        for (id, transaction) in history {
            if transaction.is_smart_state() {
                if let Some(field) = transaction.user_field(trx_fields::NEW_STATE_REF) {
                    if let Ok(reference) = SmartContractRef::from_user_field(field) {
                        initiated.push(reference.transaction_id());
                    }
                }
                continue;
            }
            if !transaction.is_smart() {
                continue;
            }
            let Some(position) = initiated.iter().position(|initiating| *initiating == id) else {
                continue;
            };
            initiated.remove(position);
            let Some(invocation) = transaction.invocation() else {
                continue;
            };
            if transfers_only
                && !crate::tokens::is_transfer(&invocation.method, &invocation.params)
            {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            result.push((id, transaction, invocation));
            if result.len() >= limit {
                break;
            }
        }
        Ok(result)
    }

    /// Pools newest-first starting `offset` back from the head.
    pub fn pool_list(&self, offset: u64, limit: u64) -> ChainResult<(u64, Vec<Pool>)> {
        let Some(last) = self.inner.store.last_sequence() else {
            return Ok((0, Vec::new()));
        };
        let total = last + 1;
        if offset > last {
            return Ok((total, Vec::new()));
        }
        let mut pools = Vec::new();
        let mut sequence = last - offset;
        for _ in 0..limit {
            match self.inner.store.load(sequence)? {
                Some(pool) => pools.push(pool),
                None => break,
            }
            if sequence == 0 {
                break;
            }
            sequence -= 1;
        }
        Ok((total, pools))
    }
}

/// Deterministic contract address derived from the deployer, the deploy
/// transaction's inner id and the bytecode.
pub fn derive_contract_address(
    deployer: &[u8; PUBLIC_KEY_SIZE],
    inner_id: u64,
    invocation: &SmartContractInvocation,
) -> [u8; PUBLIC_KEY_SIZE] {
    let mut data = Vec::new();
    data.extend_from_slice(deployer);
    data.extend_from_slice(&inner_id.to_le_bytes());
    for object in &invocation.bytecode_objects {
        data.extend_from_slice(&blake2b_256(&object.bytecode));
    }
    blake2b_256(&data)
}

impl SmartContractInvocation {
    fn strip_for_invoke(mut self) -> Self {
        if !self.is_deploy() {
            for object in &mut self.bytecode_objects {
                object.bytecode.clear();
            }
            self.source_code.clear();
        }
        self
    }
}
