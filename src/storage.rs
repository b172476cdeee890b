use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tracing::info;

use crate::codec::ByteWriter;
use crate::crypto::HASH_SIZE;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Pool, PoolHash, PoolMeta, SmartSignature, Transaction, TransactionId};

pub(crate) const CF_POOLS: &str = "pools";
pub(crate) const CF_HASH_INDEX: &str = "hash_index";
pub(crate) const CF_ADDR_TXS: &str = "addr_txs";
pub(crate) const CF_ADDR_INNER: &str = "addr_inner";
pub(crate) const CF_SMART_SIGS: &str = "smart_sigs";
pub(crate) const CF_METADATA: &str = "metadata";

const TIP_SEQUENCE_KEY: &[u8] = b"tip_sequence";
const TIP_HASH_KEY: &[u8] = b"tip_hash";

#[derive(Clone, Default)]
struct Tip {
    sequence: Option<u64>,
    hash: PoolHash,
}

/// Append-only pool log keyed by sequence, secondary-indexed by pool hash,
/// with per-address transaction indices and a single deferred slot for the
/// block awaiting final signature aggregation.
pub struct BlockStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    tip: RwLock<Tip>,
    deferred: RwLock<Option<Pool>>,
    append_lock: Mutex<()>,
    signal: (Mutex<Option<u64>>, Condvar),
}

fn address_key(address: &Address) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    address.write_to(&mut writer);
    writer.into_bytes()
}

impl BlockStore {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_POOLS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HASH_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_ADDR_TXS, Options::default()),
            ColumnFamilyDescriptor::new(CF_ADDR_INNER, Options::default()),
            ColumnFamilyDescriptor::new(CF_SMART_SIGS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let store = Self {
            db: Arc::new(db),
            tip: RwLock::new(Tip::default()),
            deferred: RwLock::new(None),
            append_lock: Mutex::new(()),
            signal: (Mutex::new(None), Condvar::new()),
        };
        store.restore_tip()?;
        Ok(store)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    fn restore_tip(&self) -> ChainResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        let sequence = match self.db.get_cf(&metadata, TIP_SEQUENCE_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid tip sequence encoding".into()))?;
                Some(u64::from_be_bytes(bytes))
            }
            None => None,
        };
        let hash = match self.db.get_cf(&metadata, TIP_HASH_KEY)? {
            Some(bytes) => PoolHash::from_bytes(bytes.to_vec())?,
            None => PoolHash::empty(),
        };
        let mut tip = self.tip.write();
        tip.sequence = sequence;
        tip.hash = hash;
        let mut last = self.signal.0.lock();
        *last = sequence;
        Ok(())
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.tip.read().sequence
    }

    pub fn last_hash(&self) -> PoolHash {
        self.tip.read().hash.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sequence().is_none()
    }

    /// Loads and decodes the pool at `sequence`, checking the recomputed
    /// hash against the stored one. A mismatch means corrupt chain data.
    pub fn load(&self, sequence: u64) -> ChainResult<Option<Pool>> {
        let pools = self.cf(CF_POOLS)?;
        let Some(value) = self.db.get_cf(&pools, sequence.to_be_bytes())? else {
            return Ok(None);
        };
        if value.len() < HASH_SIZE {
            return Err(ChainError::MalformedBinary(format!(
                "pool record at {sequence} is shorter than its hash"
            )));
        }
        let (stored_hash, body) = value.split_at(HASH_SIZE);
        let pool = Pool::from_bytes(body)?;
        if pool.hash().as_bytes() != stored_hash {
            return Err(ChainError::HashMismatch(format!(
                "pool {sequence}: stored {} recomputed {}",
                hex::encode(stored_hash),
                pool.hash()
            )));
        }
        Ok(Some(pool))
    }

    pub fn sequence_of(&self, hash: &PoolHash) -> ChainResult<Option<u64>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let index = self.cf(CF_HASH_INDEX)?;
        match self.db.get_cf(&index, hash.as_bytes())? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid hash index encoding".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn load_by_hash(&self, hash: &PoolHash) -> ChainResult<Option<Pool>> {
        match self.sequence_of(hash)? {
            Some(sequence) => self.load(sequence),
            None => Ok(None),
        }
    }

    /// Decodes only the pool header, without its transactions.
    pub fn load_meta(&self, hash: &PoolHash) -> ChainResult<Option<PoolMeta>> {
        let Some(sequence) = self.sequence_of(hash)? else {
            return Ok(None);
        };
        let pools = self.cf(CF_POOLS)?;
        let Some(value) = self.db.get_cf(&pools, sequence.to_be_bytes())? else {
            return Ok(None);
        };
        if value.len() < HASH_SIZE {
            return Err(ChainError::MalformedBinary(format!(
                "pool record at {sequence} is shorter than its hash"
            )));
        }
        Ok(Some(Pool::meta_from_bytes(&value[HASH_SIZE..])?))
    }

    pub fn load_transaction(&self, id: &TransactionId) -> ChainResult<Option<Transaction>> {
        let Some(pool) = self.load_by_hash(&id.pool_hash)? else {
            return Ok(None);
        };
        Ok(pool.transaction(id.index as usize).cloned())
    }

    /// Looks up a transaction by its source address and masked inner id.
    pub fn find_transaction(
        &self,
        address: &Address,
        inner_id: u64,
    ) -> ChainResult<Option<(TransactionId, Transaction)>> {
        let inner_cf = self.cf(CF_ADDR_INNER)?;
        let mut key = address_key(address);
        key.extend_from_slice(&inner_id.to_be_bytes());
        let Some(value) = self.db.get_cf(&inner_cf, &key)? else {
            return Ok(None);
        };
        if value.len() != 12 {
            return Err(ChainError::Config("invalid inner id index entry".into()));
        }
        let sequence = u64::from_be_bytes(value[..8].try_into().expect("8 bytes"));
        let index = u32::from_be_bytes(value[8..].try_into().expect("4 bytes"));
        let Some(pool) = self.load(sequence)? else {
            return Ok(None);
        };
        let id = pool.transaction_id(index);
        Ok(pool.transaction(index as usize).cloned().map(|trx| (id, trx)))
    }

    /// Transactions touching `address` (as source or target), newest first.
    pub fn transactions_of(
        &self,
        address: &Address,
        offset: usize,
        limit: usize,
    ) -> ChainResult<Vec<(TransactionId, Transaction)>> {
        let txs_cf = self.cf(CF_ADDR_TXS)?;
        let prefix = address_key(address);
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xff; 12]);
        let iterator = self
            .db
            .iterator_cf(&txs_cf, IteratorMode::From(&upper, Direction::Reverse));
        let mut result = Vec::new();
        let mut skipped = 0usize;
        let mut current_pool: Option<(u64, Pool)> = None;
        for entry in iterator {
            let (key, _value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() != prefix.len() + 12 {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if result.len() >= limit {
                break;
            }
            let sequence =
                u64::from_be_bytes(key[prefix.len()..prefix.len() + 8].try_into().expect("8"));
            let index =
                u32::from_be_bytes(key[prefix.len() + 8..].try_into().expect("4 bytes"));
            let cached = matches!(&current_pool, Some((cached, _)) if *cached == sequence);
            if !cached {
                let Some(pool) = self.load(sequence)? else {
                    continue;
                };
                current_pool = Some((sequence, pool));
            }
            let (_, pool) = current_pool.as_ref().expect("pool cached");
            if let Some(trx) = pool.transaction(index as usize) {
                result.push((pool.transaction_id(index), trx.clone()));
            }
        }
        Ok(result)
    }

    /// Nearest ancestor of `hash` that carries at least one transaction.
    pub fn previous_non_empty(&self, hash: &PoolHash) -> ChainResult<Option<PoolHash>> {
        let mut cursor = match self.load_meta(hash)? {
            Some(meta) => meta.previous_hash,
            None => return Ok(None),
        };
        while !cursor.is_empty() {
            let Some(meta) = self.load_meta(&cursor)? else {
                return Ok(None);
            };
            if meta.transaction_count > 0 {
                return Ok(Some(cursor));
            }
            cursor = meta.previous_hash;
        }
        Ok(None)
    }

    pub fn last_non_empty(&self) -> ChainResult<Option<PoolHash>> {
        let head = self.last_hash();
        if head.is_empty() {
            return Ok(None);
        }
        match self.load_meta(&head)? {
            Some(meta) if meta.transaction_count > 0 => Ok(Some(head)),
            Some(_) => self.previous_non_empty(&head),
            None => Ok(None),
        }
    }

    /// Appends a sealed pool. Re-appending the pool already stored at the
    /// same sequence is a no-op; anything else out of order is rejected.
    pub fn append(&self, pool: &Pool) -> ChainResult<()> {
        if !pool.is_read_only() {
            return Err(ChainError::Validation("pool is not sealed".into()));
        }
        let _guard = self.append_lock.lock();

        if let Some(existing) = self.sequence_of(pool.hash())? {
            if existing == pool.sequence() {
                return Ok(());
            }
            return Err(ChainError::Validation(format!(
                "pool {} already stored at sequence {existing}",
                pool.hash()
            )));
        }

        let tip = self.tip.read().clone();
        match tip.sequence {
            None => {
                if !pool.previous_hash().is_empty() {
                    return Err(ChainError::Validation(
                        "first pool must reference the empty hash".into(),
                    ));
                }
            }
            Some(last_sequence) => {
                if *pool.previous_hash() != tip.hash {
                    return Err(ChainError::Validation(format!(
                        "pool {} links {} but the chain head is {}",
                        pool.sequence(),
                        pool.previous_hash(),
                        tip.hash
                    )));
                }
                if pool.sequence() != last_sequence + 1 {
                    return Err(ChainError::Validation(format!(
                        "pool sequence {} does not extend head {last_sequence}",
                        pool.sequence()
                    )));
                }
            }
        }

        let mut batch = WriteBatch::default();
        let pools = self.cf(CF_POOLS)?;
        let hash_index = self.cf(CF_HASH_INDEX)?;
        let addr_txs = self.cf(CF_ADDR_TXS)?;
        let addr_inner = self.cf(CF_ADDR_INNER)?;
        let metadata = self.cf(CF_METADATA)?;

        let mut record = pool.hash().as_bytes().to_vec();
        record.extend_from_slice(&pool.to_bytes());
        batch.put_cf(&pools, pool.sequence().to_be_bytes(), record);
        batch.put_cf(
            &hash_index,
            pool.hash().as_bytes(),
            pool.sequence().to_be_bytes(),
        );

        for (index, transaction) in pool.transactions().iter().enumerate() {
            let position: Vec<u8> = pool
                .sequence()
                .to_be_bytes()
                .iter()
                .chain((index as u32).to_be_bytes().iter())
                .copied()
                .collect();
            for address in [&transaction.source, &transaction.target] {
                let mut key = address_key(address);
                key.extend_from_slice(&position);
                batch.put_cf(&addr_txs, key, transaction.inner_id().to_le_bytes());
            }
            let mut inner_key = address_key(&transaction.source);
            inner_key.extend_from_slice(&transaction.inner_id().to_be_bytes());
            batch.put_cf(&addr_inner, inner_key, &position);
        }

        batch.put_cf(&metadata, TIP_SEQUENCE_KEY, pool.sequence().to_be_bytes());
        batch.put_cf(&metadata, TIP_HASH_KEY, pool.hash().as_bytes());
        self.db.write(batch)?;

        {
            let mut tip = self.tip.write();
            tip.sequence = Some(pool.sequence());
            tip.hash = pool.hash().clone();
        }
        {
            let mut last = self.signal.0.lock();
            *last = Some(pool.sequence());
            self.signal.1.notify_all();
        }
        info!(sequence = pool.sequence(), hash = %pool.hash(), "appended pool");
        Ok(())
    }

    /// Blocks until a pool beyond `processed` is appended, or the timeout
    /// elapses. Returns the new head sequence without consuming anything.
    pub fn wait_for_block(&self, processed: Option<u64>, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let mut last = self.signal.0.lock();
        loop {
            match *last {
                Some(sequence) if processed.map_or(true, |p| sequence > p) => {
                    return Some(sequence);
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .signal
                .1
                .wait_for(&mut last, deadline - now)
                .timed_out()
            {
                return None;
            }
        }
    }

    /// Wakes every waiter; used on shutdown so worker loops can observe the
    /// stop flag.
    pub fn notify_waiters(&self) {
        let _last = self.signal.0.lock();
        self.signal.1.notify_all();
    }

    pub fn defer_pool(&self, pool: Pool) {
        *self.deferred.write() = Some(pool);
    }

    pub fn deferred_pool(&self) -> Option<Pool> {
        self.deferred.read().clone()
    }

    pub fn take_deferred(&self) -> Option<Pool> {
        self.deferred.write().take()
    }

    pub fn discard_deferred(&self) {
        *self.deferred.write() = None;
    }

    /// Rolls the chain head back to `sequence`, dropping every later pool
    /// and its index entries. Called by the synchronisation layer when a
    /// better branch replaces the local head; readers observe the shorter
    /// chain immediately.
    pub fn rewind_to(&self, sequence: u64) -> ChainResult<()> {
        let _guard = self.append_lock.lock();
        let Some(last) = self.last_sequence() else {
            return Ok(());
        };
        if sequence >= last {
            return Ok(());
        }
        let pools = self.cf(CF_POOLS)?;
        let hash_index = self.cf(CF_HASH_INDEX)?;
        let addr_txs = self.cf(CF_ADDR_TXS)?;
        let addr_inner = self.cf(CF_ADDR_INNER)?;
        let metadata = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        for removed in (sequence + 1)..=last {
            let Some(pool) = self.load(removed)? else {
                continue;
            };
            batch.delete_cf(&pools, removed.to_be_bytes());
            batch.delete_cf(&hash_index, pool.hash().as_bytes());
            for (index, transaction) in pool.transactions().iter().enumerate() {
                let position: Vec<u8> = removed
                    .to_be_bytes()
                    .iter()
                    .chain((index as u32).to_be_bytes().iter())
                    .copied()
                    .collect();
                for address in [&transaction.source, &transaction.target] {
                    let mut key = address_key(address);
                    key.extend_from_slice(&position);
                    batch.delete_cf(&addr_txs, key);
                }
                let mut inner_key = address_key(&transaction.source);
                inner_key.extend_from_slice(&transaction.inner_id().to_be_bytes());
                batch.delete_cf(&addr_inner, inner_key);
            }
        }
        let new_head = self.load(sequence)?.ok_or_else(|| {
            ChainError::Fatal(format!("rewind target {sequence} is missing"))
        })?;
        batch.put_cf(&metadata, TIP_SEQUENCE_KEY, sequence.to_be_bytes());
        batch.put_cf(&metadata, TIP_HASH_KEY, new_head.hash().as_bytes());
        self.db.write(batch)?;
        {
            let mut tip = self.tip.write();
            tip.sequence = Some(sequence);
            tip.hash = new_head.hash().clone();
        }
        {
            let mut last = self.signal.0.lock();
            *last = Some(sequence);
        }
        info!(sequence, "chain head rewound");
        Ok(())
    }

    pub fn put_smart_signatures(
        &self,
        sequence: u64,
        signatures: &[SmartSignature],
    ) -> ChainResult<()> {
        let cf = self.cf(CF_SMART_SIGS)?;
        let data = bincode::serialize(signatures)?;
        self.db.put_cf(&cf, sequence.to_be_bytes(), data)?;
        Ok(())
    }

    pub fn smart_signatures(&self, sequence: u64) -> ChainResult<Vec<SmartSignature>> {
        let cf = self.cf(CF_SMART_SIGS)?;
        match self.db.get_cf(&cf, sequence.to_be_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn flush(&self) -> ChainResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;
    use crate::types::{pool_fields, Amount, Commission, UserField};
    use ed25519_dalek::Keypair;
    use tempfile::tempdir;

    fn build_pool(previous: PoolHash, sequence: u64, writer: &Keypair, txs: u64) -> Pool {
        let mut pool = Pool::new(previous, sequence);
        pool.add_user_field(
            pool_fields::TIMESTAMP,
            UserField::Integer(1_700_000_000_000 + sequence as i64),
        );
        let sender = deterministic_keypair(9);
        for n in 0..txs {
            let mut trx = Transaction::new(
                sequence * 100 + n,
                Address::PublicKey(sender.public.to_bytes()),
                Address::PublicKey(writer.public.to_bytes()),
                Amount::new(1, 0),
                Commission::from_f64(0.1),
            );
            trx.sign(&sender);
            pool.add_transaction(trx);
        }
        pool.set_confidants(vec![writer.public.to_bytes()]);
        pool.set_real_trusted_mask(0b1);
        let digest = pool.signing_digest();
        pool.add_signature(0, crate::crypto::sign_message(writer, &digest).to_bytes());
        pool.sign_by_writer(writer);
        pool.compose();
        pool
    }

    #[test]
    fn append_links_and_loads() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let writer = deterministic_keypair(1);

        let genesis = build_pool(PoolHash::empty(), 0, &writer, 0);
        store.append(&genesis).unwrap();
        let first = build_pool(genesis.hash().clone(), 1, &writer, 2);
        store.append(&first).unwrap();

        assert_eq!(store.last_sequence(), Some(1));
        assert_eq!(store.last_hash(), *first.hash());
        let loaded = store.load(1).unwrap().unwrap();
        assert_eq!(loaded.hash(), first.hash());
        assert_eq!(
            store.load_by_hash(genesis.hash()).unwrap().unwrap().sequence(),
            0,
        );
    }

    #[test]
    fn append_is_idempotent_under_hash_equality() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let writer = deterministic_keypair(1);
        let genesis = build_pool(PoolHash::empty(), 0, &writer, 0);
        store.append(&genesis).unwrap();
        store.append(&genesis).unwrap();
        assert_eq!(store.last_sequence(), Some(0));
    }

    #[test]
    fn append_rejects_broken_links() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let writer = deterministic_keypair(1);
        let genesis = build_pool(PoolHash::empty(), 0, &writer, 0);
        store.append(&genesis).unwrap();

        let detached = build_pool(PoolHash::calc_from_data(b"elsewhere"), 1, &writer, 0);
        assert!(matches!(
            store.append(&detached).unwrap_err(),
            ChainError::Validation(_),
        ));

        let skipped = build_pool(genesis.hash().clone(), 5, &writer, 0);
        assert!(matches!(
            store.append(&skipped).unwrap_err(),
            ChainError::Validation(_),
        ));
    }

    #[test]
    fn transaction_indices_answer_queries() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let writer = deterministic_keypair(1);
        let genesis = build_pool(PoolHash::empty(), 0, &writer, 0);
        store.append(&genesis).unwrap();
        let first = build_pool(genesis.hash().clone(), 1, &writer, 3);
        store.append(&first).unwrap();

        let sender = deterministic_keypair(9);
        let source = Address::PublicKey(sender.public.to_bytes());
        let found = store.find_transaction(&source, 101).unwrap().unwrap();
        assert_eq!(found.1.inner_id(), 101);

        let listed = store.transactions_of(&source, 0, 10).unwrap();
        assert_eq!(listed.len(), 3);
        let paged = store.transactions_of(&source, 1, 1).unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[test]
    fn previous_non_empty_skips_empty_pools() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let writer = deterministic_keypair(1);
        let genesis = build_pool(PoolHash::empty(), 0, &writer, 0);
        store.append(&genesis).unwrap();
        let busy = build_pool(genesis.hash().clone(), 1, &writer, 1);
        store.append(&busy).unwrap();
        let idle = build_pool(busy.hash().clone(), 2, &writer, 0);
        store.append(&idle).unwrap();

        assert_eq!(
            store.previous_non_empty(idle.hash()).unwrap(),
            Some(busy.hash().clone()),
        );
        assert_eq!(store.last_non_empty().unwrap(), Some(busy.hash().clone()));
    }

    #[test]
    fn wait_for_block_times_out_and_wakes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        assert_eq!(
            store.wait_for_block(None, Duration::from_millis(20)),
            None,
        );

        let writer = deterministic_keypair(1);
        let genesis = build_pool(PoolHash::empty(), 0, &writer, 0);
        let appender = {
            let store = store.clone();
            let genesis = genesis.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                store.append(&genesis).unwrap();
            })
        };
        let woken = store.wait_for_block(None, Duration::from_secs(2));
        appender.join().unwrap();
        assert_eq!(woken, Some(0));
    }

    #[test]
    fn deferred_slot_holds_one_pool() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let writer = deterministic_keypair(1);
        let pool = build_pool(PoolHash::empty(), 0, &writer, 0);
        store.defer_pool(pool.clone());
        assert_eq!(
            store.deferred_pool().map(|p| p.hash().clone()),
            Some(pool.hash().clone()),
        );
        store.discard_deferred();
        assert!(store.deferred_pool().is_none());
    }
}
