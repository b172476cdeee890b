//! Smart-contract operation tracker.
//!
//! A dedicated worker woken by the chain store's block-appended event. It
//! drains newly appended pools in sequence order, maintains the contract
//! indices, wakes callers suspended on a contract's state and fails
//! invocations whose new-state never arrived.
//!
//! Index locks are acquired one at a time, never nested, in the order
//! `smart_origin`, `smart_state`, `deployed_by_creator`, `smart_operations`,
//! `smarts_pending`, `pending_queue`, `smart_last_trxn`. No tracker lock is
//! held across an executor or transport call.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::Executor;
use crate::storage::BlockStore;
use crate::tokens::TokenRegistry;
use crate::types::{
    trx_fields, Pool, PoolHash, SmartContractRef, Transaction, TransactionId, UserField, Variant,
};
use crate::wallets::WalletsCache;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Success,
    Failed,
}

/// Lifecycle record of one deploy or invoke, keyed by its initiating
/// transaction. Transitions out of `Pending` exactly once.
#[derive(Clone, Debug)]
pub struct SmartOperation {
    pub state: OperationState,
    pub state_transaction: Option<TransactionId>,
    pub has_ret_val: bool,
    pub return_value: Option<Variant>,
}

impl Default for SmartOperation {
    fn default() -> Self {
        Self {
            state: OperationState::Pending,
            state_transaction: None,
            has_ret_val: false,
            return_value: None,
        }
    }
}

/// Latest stored state of one contract address.
#[derive(Clone, Debug, Default)]
pub struct SmartState {
    pub state: Vec<u8>,
    pub last_empty: bool,
    pub state_transaction: Option<TransactionId>,
    pub initiating_transaction: Option<TransactionId>,
}

struct StateSlot {
    state: SmartState,
    version: u64,
}

/// Versioned state holder with a wait/notify contract. All writes come from
/// the tracker worker; waiters poll the snapshot under their predicate.
pub struct ContractStateEntry {
    slot: Mutex<StateSlot>,
    signal: Condvar,
}

impl ContractStateEntry {
    fn new() -> Self {
        Self {
            slot: Mutex::new(StateSlot {
                state: SmartState::default(),
                version: 0,
            }),
            signal: Condvar::new(),
        }
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&SmartState) -> SmartState,
    {
        let mut slot = self.slot.lock();
        slot.state = f(&slot.state);
        slot.version += 1;
        self.signal.notify_all();
    }

    pub fn snapshot(&self) -> SmartState {
        self.slot.lock().state.clone()
    }

    /// Blocks until the predicate accepts the current state or the timeout
    /// elapses. A timeout returns `false` without consuming anything; the
    /// update stays visible to other waiters.
    pub fn wait_till_front<F>(&self, mut predicate: F, timeout: Duration) -> bool
    where
        F: FnMut(&SmartState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if predicate(&slot.state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.signal.wait_for(&mut slot, deadline - now);
        }
    }
}

struct TrxnWaiterSlot {
    queue: VecDeque<TransactionId>,
    awaiters: usize,
}

/// Per-address record backing `wait_for_smart_transaction`: every waiter
/// observes the queue front; the last one to leave consumes it.
pub struct SmartTrxnEntry {
    slot: Mutex<TrxnWaiterSlot>,
    signal: Condvar,
}

impl SmartTrxnEntry {
    fn new() -> Self {
        Self {
            slot: Mutex::new(TrxnWaiterSlot {
                queue: VecDeque::new(),
                awaiters: 0,
            }),
            signal: Condvar::new(),
        }
    }

    fn push(&self, id: TransactionId) {
        let mut slot = self.slot.lock();
        slot.queue.push_back(id);
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<TransactionId> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        slot.awaiters += 1;
        loop {
            if let Some(front) = slot.queue.front().cloned() {
                slot.awaiters -= 1;
                if slot.awaiters == 0 {
                    slot.queue.pop_front();
                }
                return Some(front);
            }
            let now = Instant::now();
            if now >= deadline {
                slot.awaiters -= 1;
                return None;
            }
            self.signal.wait_for(&mut slot, deadline - now);
        }
    }
}

#[derive(Clone, Default)]
struct LastPull {
    hash: PoolHash,
    sequence: u64,
}

pub struct ContractTracker {
    store: Arc<BlockStore>,
    wallets: Arc<WalletsCache>,
    executor: Arc<dyn Executor>,
    tokens: TokenRegistry,
    max_rounds_cancel: u64,
    smart_origin: Mutex<HashMap<[u8; PUBLIC_KEY_SIZE], TransactionId>>,
    smart_state: Mutex<HashMap<[u8; PUBLIC_KEY_SIZE], Arc<ContractStateEntry>>>,
    deployed_by_creator: Mutex<HashMap<[u8; PUBLIC_KEY_SIZE], Vec<TransactionId>>>,
    smart_operations: Mutex<HashMap<TransactionId, SmartOperation>>,
    smarts_pending: Mutex<BTreeMap<u64, Vec<TransactionId>>>,
    pending_queue: Mutex<VecDeque<(u64, TransactionId, Transaction)>>,
    smart_last_trxn: Mutex<HashMap<[u8; PUBLIC_KEY_SIZE], Arc<SmartTrxnEntry>>>,
    execute_counts: Mutex<HashMap<String, u64>>,
    last_pull: Mutex<LastPull>,
}

impl ContractTracker {
    pub fn new(
        store: Arc<BlockStore>,
        wallets: Arc<WalletsCache>,
        executor: Arc<dyn Executor>,
        max_rounds_cancel: u64,
    ) -> Self {
        Self {
            store,
            wallets,
            executor,
            tokens: TokenRegistry::new(),
            max_rounds_cancel,
            smart_origin: Mutex::new(HashMap::new()),
            smart_state: Mutex::new(HashMap::new()),
            deployed_by_creator: Mutex::new(HashMap::new()),
            smart_operations: Mutex::new(HashMap::new()),
            smarts_pending: Mutex::new(BTreeMap::new()),
            pending_queue: Mutex::new(VecDeque::new()),
            smart_last_trxn: Mutex::new(HashMap::new()),
            execute_counts: Mutex::new(HashMap::new()),
            last_pull: Mutex::new(LastPull::default()),
        }
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    pub fn last_processed_sequence(&self) -> u64 {
        self.last_pull.lock().sequence
    }

    /// Spawns the scan worker. It performs the initial catch-up walk, then
    /// sleeps on the store's block-appended event until stopped.
    pub fn spawn(self: &Arc<Self>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let tracker = Arc::clone(self);
        thread::Builder::new()
            .name("contract-tracker".into())
            .spawn(move || tracker.run(&stop))
            .expect("spawn contract tracker")
    }

    fn run(&self, stop: &AtomicBool) {
        info!("contract tracker catching up");
        if let Err(err) = self.scan_new_blocks(true) {
            warn!(?err, "initial contract scan failed");
        }
        while !stop.load(Ordering::Acquire) {
            match self.scan_new_blocks(false) {
                Ok(true) => continue,
                Ok(false) => {
                    let processed = Some(self.last_processed_sequence());
                    self.store
                        .wait_for_block(processed, Duration::from_millis(500));
                }
                Err(err) => {
                    warn!(?err, "contract scan failed");
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
        info!("contract tracker stopped");
    }

    /// One scan pass: walks back from the head to the last processed hash
    /// (recovering from forks), replays the new pools oldest-first, drains
    /// the pending queue and expires abandoned invocations. Returns whether
    /// any new pool was seen.
    pub fn scan_new_blocks(&self, init: bool) -> ChainResult<bool> {
        let head = self.store.last_hash();
        let last = self.last_pull.lock().clone();
        if head.is_empty() || head == last.hash {
            self.expire_abandoned();
            return Ok(false);
        }

        let mut new_blocks: Vec<PoolHash> = Vec::new();
        let mut cursor = head.clone();
        let mut head_sequence = last.sequence;
        while !cursor.is_empty() && cursor != last.hash {
            let Some(meta) = self.store.load_meta(&cursor)? else {
                return Err(ChainError::Fatal(format!(
                    "chain walk hit unknown pool {cursor}"
                )));
            };
            head_sequence = head_sequence.max(meta.sequence);
            new_blocks.push(cursor);
            cursor = meta.previous_hash;
        }

        if cursor.is_empty() && !last.hash.is_empty() {
            // The old head is not an ancestor of the new one: a fork.
            // Walk the old branch back until it meets the new chain and
            // drop everything derived beyond the common ancestor.
            warn!(old_head = %last.hash, new_head = %head, "fork detected, rewinding");
            let mut old_cursor = last.hash.clone();
            let mut ancestor_sequence = 0u64;
            while !old_cursor.is_empty() {
                if let Some(position) = new_blocks.iter().position(|hash| *hash == old_cursor) {
                    ancestor_sequence = self
                        .store
                        .load_meta(&old_cursor)?
                        .map(|meta| meta.sequence)
                        .unwrap_or(0);
                    new_blocks.truncate(position);
                    break;
                }
                old_cursor = match self.store.load_meta(&old_cursor)? {
                    Some(meta) => meta.previous_hash,
                    None => PoolHash::empty(),
                };
            }
            self.truncate_after(ancestor_sequence);
        }

        {
            let mut last = self.last_pull.lock();
            last.hash = head;
            last.sequence = last.sequence.max(head_sequence);
        }

        let progressed = !new_blocks.is_empty();
        for hash in new_blocks.iter().rev() {
            let Some(pool) = self.store.load_by_hash(hash)? else {
                return Err(ChainError::Fatal(format!("pool {hash} vanished mid-scan")));
            };
            self.enqueue_pool(&pool);
        }
        self.drain_queue(init);
        self.expire_abandoned();
        Ok(progressed)
    }

    /// Drops everything derived from pools that fell off the chain; the
    /// replay of the surviving branch rebuilds the rest.
    fn truncate_after(&self, ancestor_sequence: u64) {
        let still_stored = |id: &TransactionId| {
            self.store
                .sequence_of(&id.pool_hash)
                .ok()
                .flatten()
                .is_some()
        };
        self.smart_origin.lock().retain(|_, id| still_stored(id));
        self.smart_state.lock().retain(|_, entry| {
            entry
                .snapshot()
                .state_transaction
                .as_ref()
                .map(|id| still_stored(id))
                .unwrap_or(false)
        });
        self.deployed_by_creator.lock().retain(|_, ids| {
            ids.retain(|id| still_stored(id));
            !ids.is_empty()
        });
        self.smart_operations.lock().retain(|id, _| still_stored(id));
        self.smarts_pending
            .lock()
            .retain(|sequence, _| *sequence <= ancestor_sequence);
        self.pending_queue
            .lock()
            .retain(|(sequence, _, _)| *sequence <= ancestor_sequence);
    }

    /// Pools are scanned transaction-by-transaction in reverse; anything
    /// smart or smart-state joins the FIFO processing queue.
    fn enqueue_pool(&self, pool: &Pool) {
        let mut queue = self.pending_queue.lock();
        for (index, transaction) in pool.transactions().iter().enumerate().rev() {
            if transaction.is_smart() || transaction.is_smart_state() {
                queue.push_back((
                    pool.sequence(),
                    pool.transaction_id(index as u32),
                    transaction.clone(),
                ));
            }
        }
    }

    fn drain_queue(&self, init: bool) {
        loop {
            let Some((sequence, id, transaction)) = self.pending_queue.lock().pop_front() else {
                return;
            };
            if transaction.is_smart_state() {
                self.process_smart_state(&id, &transaction);
            } else {
                self.process_smart(sequence, &id, &transaction, init);
            }
        }
    }

    fn process_smart_state(&self, id: &TransactionId, transaction: &Transaction) {
        let Some(ref_field) = transaction.user_field(trx_fields::NEW_STATE_REF) else {
            return;
        };
        let reference = match SmartContractRef::from_user_field(ref_field) {
            Ok(reference) => reference,
            Err(err) => {
                warn!(?err, "new-state transaction carries an invalid start ref");
                return;
            }
        };
        let initiating_id = reference.transaction_id();
        let Some(contract_key) = self.wallets.resolve(&transaction.target) else {
            warn!(target = %transaction.target, "cannot resolve contract address");
            return;
        };

        let new_state: Vec<u8> = transaction
            .user_field(trx_fields::NEW_STATE_VALUE)
            .and_then(UserField::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        let entry = self.state_entry(contract_key);
        {
            let new_state = new_state.clone();
            let state_id = id.clone();
            let initiating = initiating_id.clone();
            entry.update(move |old| SmartState {
                state: if new_state.is_empty() {
                    old.state.clone()
                } else {
                    new_state.clone()
                },
                last_empty: new_state.is_empty(),
                state_transaction: Some(state_id.clone()),
                initiating_transaction: Some(initiating.clone()),
            });
        }

        let return_value = transaction
            .user_field(trx_fields::NEW_STATE_RET_VAL)
            .and_then(UserField::as_bytes)
            .and_then(|bytes| bincode::deserialize::<Variant>(bytes).ok());

        {
            let mut operations = self.smart_operations.lock();
            let operation = operations.entry(initiating_id.clone()).or_default();
            if operation.state == OperationState::Pending {
                operation.state = if new_state.is_empty() {
                    OperationState::Failed
                } else {
                    OperationState::Success
                };
                operation.state_transaction = Some(id.clone());
                operation.has_ret_val = return_value.is_some();
                operation.return_value = return_value;
            }
        }

        // Token bookkeeping happens with no tracker lock held.
        let initiating = match self.store.load_transaction(&initiating_id) {
            Ok(found) => found,
            Err(err) => {
                warn!(?err, "failed to load initiating transaction");
                None
            }
        };
        let Some(initiating) = initiating else {
            return;
        };
        if !initiating.is_smart() {
            return;
        }
        let Some(invocation) = initiating.invocation() else {
            return;
        };
        if !invocation.method.is_empty() {
            *self
                .execute_counts
                .lock()
                .entry(invocation.method.clone())
                .or_insert(0) += 1;
        }
        let Some(caller_key) = self.wallets.resolve(&initiating.source) else {
            return;
        };
        if invocation.is_deploy() {
            self.tokens
                .check_new_deploy(contract_key, caller_key, &invocation, &self.executor);
        }
        if !new_state.is_empty() {
            self.tokens.check_new_state(
                contract_key,
                caller_key,
                &invocation,
                &new_state,
                &self.executor,
            );
        }
    }

    fn process_smart(
        &self,
        sequence: u64,
        id: &TransactionId,
        transaction: &Transaction,
        init: bool,
    ) {
        let Some(contract_key) = self.wallets.resolve(&transaction.target) else {
            warn!(target = %transaction.target, "cannot resolve smart target");
            return;
        };

        if !init {
            let entry = self.trxn_entry(contract_key);
            entry.push(id.clone());
        }

        self.smart_operations
            .lock()
            .entry(id.clone())
            .or_default();
        self.smarts_pending
            .lock()
            .entry(sequence)
            .or_default()
            .push(id.clone());

        let Some(invocation) = transaction.invocation() else {
            return;
        };
        if invocation.is_deploy() && !invocation.bytecode_objects.is_empty() {
            self.smart_origin
                .lock()
                .insert(contract_key, id.clone());
            if let Some(creator_key) = self.wallets.resolve(&transaction.source) {
                self.deployed_by_creator
                    .lock()
                    .entry(creator_key)
                    .or_default()
                    .push(id.clone());
            }
        }
        debug!(sequence, %id, "tracked smart transaction");
    }

    /// Fails every still-pending invocation whose block fell out of the
    /// cancellation window. Each operation transitions at most once.
    fn expire_abandoned(&self) {
        let horizon = self.last_pull.lock().sequence;
        let mut expired: Vec<TransactionId> = Vec::new();
        {
            let mut pending = self.smarts_pending.lock();
            let cutoff: Vec<u64> = pending
                .keys()
                .copied()
                .take_while(|sequence| sequence + self.max_rounds_cancel <= horizon)
                .collect();
            for sequence in cutoff {
                if let Some(ids) = pending.remove(&sequence) {
                    expired.extend(ids);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut operations = self.smart_operations.lock();
        for id in expired {
            let operation = operations.entry(id.clone()).or_default();
            if operation.state == OperationState::Pending {
                debug!(%id, "invocation timed out without a new state");
                operation.state = OperationState::Failed;
            }
        }
    }

    pub fn state_entry(&self, contract: [u8; PUBLIC_KEY_SIZE]) -> Arc<ContractStateEntry> {
        self.smart_state
            .lock()
            .entry(contract)
            .or_insert_with(|| Arc::new(ContractStateEntry::new()))
            .clone()
    }

    fn trxn_entry(&self, contract: [u8; PUBLIC_KEY_SIZE]) -> Arc<SmartTrxnEntry> {
        self.smart_last_trxn
            .lock()
            .entry(contract)
            .or_insert_with(|| Arc::new(SmartTrxnEntry::new()))
            .clone()
    }

    // --- read interface -----------------------------------------------------

    pub fn operation(&self, id: &TransactionId) -> Option<SmartOperation> {
        self.smart_operations.lock().get(id).cloned()
    }

    pub fn contract_state(&self, contract: &[u8; PUBLIC_KEY_SIZE]) -> Option<SmartState> {
        self.smart_state
            .lock()
            .get(contract)
            .map(|entry| entry.snapshot())
    }

    pub fn origin(&self, contract: &[u8; PUBLIC_KEY_SIZE]) -> Option<TransactionId> {
        self.smart_origin.lock().get(contract).cloned()
    }

    pub fn origins_snapshot(&self) -> Vec<([u8; PUBLIC_KEY_SIZE], TransactionId)> {
        self.smart_origin
            .lock()
            .iter()
            .map(|(contract, id)| (*contract, id.clone()))
            .collect()
    }

    pub fn deployed_by(&self, creator: &[u8; PUBLIC_KEY_SIZE]) -> Vec<TransactionId> {
        self.deployed_by_creator
            .lock()
            .get(creator)
            .cloned()
            .unwrap_or_default()
    }

    pub fn execute_count(&self, method: &str) -> Option<u64> {
        self.execute_counts.lock().get(method).copied()
    }

    /// Suspends until the contract's state satisfies the predicate.
    pub fn wait_till_front<F>(
        &self,
        contract: [u8; PUBLIC_KEY_SIZE],
        predicate: F,
        timeout: Duration,
    ) -> bool
    where
        F: FnMut(&SmartState) -> bool,
    {
        self.state_entry(contract).wait_till_front(predicate, timeout)
    }

    /// Blocks until the tracker observes a smart transaction addressed to
    /// the contract, or the timeout elapses.
    pub fn wait_for_smart_transaction(
        &self,
        contract: [u8; PUBLIC_KEY_SIZE],
        timeout: Duration,
    ) -> Option<TransactionId> {
        self.trxn_entry(contract).wait(timeout)
    }
}
