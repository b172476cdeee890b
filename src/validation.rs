//! Ordered chain of predicates applied to every block presented for
//! acceptance. `Warning` is logged and acceptance proceeds, `Error` rejects
//! the block, `FatalError` additionally halts further chain extension.

use std::collections::HashSet;

use tracing::{error, warn};

use crate::crypto::{blake2b_256, verify_raw_signature};
use crate::errors::{ChainError, ChainResult};
use crate::storage::BlockStore;
use crate::types::{pool_fields, Address, Amount, Pool, Transaction, UserField};
use crate::wallets::WalletsCache;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    NoError,
    Warning,
    Error,
    FatalError,
}

pub struct ValidationContext<'a> {
    pub store: &'a BlockStore,
    pub wallets: &'a WalletsCache,
    pub prev: Option<&'a Pool>,
}

pub trait ValidationPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict>;
}

pub struct BlockValidator {
    plugins: Vec<Box<dyn ValidationPlugin>>,
}

impl BlockValidator {
    pub fn new() -> Self {
        Self {
            plugins: vec![
                Box::new(HashValidator),
                Box::new(BlockNumValidator),
                Box::new(TimestampValidator),
                Box::new(BlockSignaturesValidator),
                Box::new(SmartSourceSignaturesValidator),
                Box::new(BalanceChecker),
                Box::new(TransactionsChecker),
            ],
        }
    }

    /// Runs every plugin in order and returns the per-plugin verdicts,
    /// stopping after the first `Error` or `FatalError`.
    pub fn verdicts(
        &self,
        store: &BlockStore,
        wallets: &WalletsCache,
        block: &Pool,
    ) -> ChainResult<Vec<(&'static str, Verdict)>> {
        let prev = if block.sequence() == 0 {
            None
        } else {
            store.load(block.sequence() - 1)?
        };
        let ctx = ValidationContext {
            store,
            wallets,
            prev: prev.as_ref(),
        };
        let mut verdicts = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            let verdict = plugin.validate(&ctx, block)?;
            verdicts.push((plugin.name(), verdict));
            match verdict {
                Verdict::NoError => {}
                Verdict::Warning => {
                    warn!(plugin = plugin.name(), sequence = block.sequence(), "validation warning");
                }
                Verdict::Error | Verdict::FatalError => {
                    error!(plugin = plugin.name(), sequence = block.sequence(), "validation failed");
                    break;
                }
            }
        }
        Ok(verdicts)
    }

    pub fn validate_block(
        &self,
        store: &BlockStore,
        wallets: &WalletsCache,
        block: &Pool,
    ) -> ChainResult<()> {
        let verdicts = self.verdicts(store, wallets, block)?;
        match verdicts.last() {
            Some((name, Verdict::Error)) => Err(ChainError::Validation(format!(
                "pool {} rejected by {name}",
                block.sequence()
            ))),
            Some((name, Verdict::FatalError)) => Err(ChainError::Fatal(format!(
                "pool {} failed {name}; halting chain extension",
                block.sequence()
            ))),
            _ => Ok(()),
        }
    }
}

impl Default for BlockValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Recomputes the previous block's hash and compares it against the link.
struct HashValidator;

impl ValidationPlugin for HashValidator {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn validate(&self, ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict> {
        let Some(prev) = ctx.prev else {
            return Ok(Verdict::NoError);
        };
        let recomputed = crate::types::PoolHash::calc_from_data(&prev.to_bytes());
        if *block.previous_hash() != recomputed {
            return Ok(Verdict::FatalError);
        }
        Ok(Verdict::NoError)
    }
}

struct BlockNumValidator;

impl ValidationPlugin for BlockNumValidator {
    fn name(&self) -> &'static str {
        "block_number"
    }

    fn validate(&self, ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict> {
        let Some(prev) = ctx.prev else {
            return Ok(Verdict::NoError);
        };
        if block.sequence() != prev.sequence() + 1 {
            return Ok(Verdict::Error);
        }
        Ok(Verdict::NoError)
    }
}

/// Block timestamps must be monotone non-decreasing; a missing timestamp on
/// either side only warns.
struct TimestampValidator;

impl ValidationPlugin for TimestampValidator {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn validate(&self, ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict> {
        let Some(prev) = ctx.prev else {
            return Ok(Verdict::NoError);
        };
        let prev_ts = prev
            .user_field(pool_fields::TIMESTAMP)
            .and_then(UserField::as_integer);
        let current_ts = block
            .user_field(pool_fields::TIMESTAMP)
            .and_then(UserField::as_integer);
        match (prev_ts, current_ts) {
            (Some(prev_ts), Some(current_ts)) if current_ts < prev_ts => Ok(Verdict::Warning),
            (Some(_), Some(_)) => Ok(Verdict::NoError),
            _ => Ok(Verdict::Warning),
        }
    }
}

/// The population count of the trusted mask must match the signature count,
/// and every masked confidant's signature must cover the block's signing
/// digest.
struct BlockSignaturesValidator;

impl ValidationPlugin for BlockSignaturesValidator {
    fn name(&self) -> &'static str {
        "block_signatures"
    }

    fn validate(&self, _ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict> {
        let mask = block.real_trusted_mask();
        let expected = mask.count_ones() as usize;
        if block.signatures().len() != expected {
            return Ok(Verdict::Error);
        }
        let confidants = block.confidants();
        if confidants.len() > u64::BITS as usize {
            return Ok(Verdict::Error);
        }
        let digest = block.signing_digest();
        let mut checking = 0usize;
        for (index, confidant) in confidants.iter().enumerate() {
            if mask & (1u64 << index) == 0 {
                continue;
            }
            let (signed_index, signature) = block.signatures()[checking];
            if signed_index as usize != index
                || !verify_raw_signature(confidant, &digest, &signature)
            {
                return Ok(Verdict::Error);
            }
            checking += 1;
        }
        Ok(Verdict::NoError)
    }
}

/// Transactions emitted by a contract are grouped per source into packets;
/// each packet hash must be covered by signatures of the confidants recorded
/// with the initiating pool's consensus.
struct SmartSourceSignaturesValidator;

impl SmartSourceSignaturesValidator {
    fn packet_hash(transactions: &[&Transaction]) -> [u8; 32] {
        let mut data = Vec::new();
        for transaction in transactions {
            data.extend_from_slice(&transaction.signable_bytes());
        }
        blake2b_256(&data)
    }

    fn new_state_packs<'a>(block: &'a Pool) -> Vec<(Address, Vec<&'a Transaction>)> {
        let transactions = block.transactions();
        let mut packs = Vec::new();
        for (index, transaction) in transactions.iter().enumerate() {
            if !transaction.is_smart_state() {
                continue;
            }
            let mut pack = vec![transaction];
            for later in &transactions[index + 1..] {
                if later.source == transaction.source {
                    pack.push(later);
                }
            }
            packs.push((transaction.source, pack));
        }
        packs
    }
}

impl ValidationPlugin for SmartSourceSignaturesValidator {
    fn name(&self) -> &'static str {
        "smart_source_signatures"
    }

    fn validate(&self, ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict> {
        let packs = Self::new_state_packs(block);
        let recorded = ctx.store.smart_signatures(block.sequence())?;
        if recorded.is_empty() {
            if packs.is_empty() {
                return Ok(Verdict::NoError);
            }
            return Ok(Verdict::Error);
        }
        if recorded.len() != packs.len() {
            return Ok(Verdict::Error);
        }
        for (source, pack) in &packs {
            let Some(source_key) = ctx.wallets.resolve(source) else {
                return Ok(Verdict::Error);
            };
            let Some(entry) = recorded.iter().find(|sig| sig.source_key == source_key) else {
                return Ok(Verdict::Error);
            };
            let Some(init_pool) = ctx.store.load(entry.initiating_sequence)? else {
                return Ok(Verdict::Error);
            };
            let confidants = init_pool.confidants();
            let hash = Self::packet_hash(pack);
            for (index, signature) in &entry.signatures {
                let Some(confidant) = confidants.get(*index as usize) else {
                    return Ok(Verdict::Error);
                };
                let signature: [u8; 64] = match signature.as_slice().try_into() {
                    Ok(signature) => signature,
                    Err(_) => return Ok(Verdict::Error),
                };
                if !verify_raw_signature(confidant, &hash, &signature) {
                    return Ok(Verdict::Error);
                }
            }
        }
        Ok(Verdict::NoError)
    }
}

/// No wallet's running balance may be negative after the previous block's
/// transactions were applied.
struct BalanceChecker;

impl ValidationPlugin for BalanceChecker {
    fn name(&self) -> &'static str {
        "balance"
    }

    fn validate(&self, ctx: &ValidationContext<'_>, _block: &Pool) -> ChainResult<Verdict> {
        let Some(prev) = ctx.prev else {
            return Ok(Verdict::NoError);
        };
        for transaction in prev.transactions() {
            let balance = ctx
                .wallets
                .balance(&transaction.source)
                .unwrap_or_else(Amount::zero);
            if balance.is_negative() {
                return Ok(Verdict::Error);
            }
        }
        Ok(Verdict::NoError)
    }
}

/// Every ordinary transaction's signature must verify under its resolved
/// source key. Contract-emitted transactions are covered by the smart-source
/// plugin instead.
struct TransactionsChecker;

impl ValidationPlugin for TransactionsChecker {
    fn name(&self) -> &'static str {
        "transactions"
    }

    fn validate(&self, ctx: &ValidationContext<'_>, block: &Pool) -> ChainResult<Verdict> {
        let mut new_state_sources: HashSet<Address> = HashSet::new();
        for transaction in block.transactions() {
            if transaction.is_smart_state() {
                new_state_sources.insert(transaction.source);
                continue;
            }
            if new_state_sources.contains(&transaction.source) {
                continue;
            }
            if !transaction.max_fee.covers(&transaction.counted_fee) {
                return Ok(Verdict::Error);
            }
            if transaction.amount.is_negative() {
                return Ok(Verdict::Error);
            }
            let Some(source_key) = ctx.wallets.resolve(&transaction.source) else {
                return Ok(Verdict::Error);
            };
            if transaction.verify_signature(&source_key).is_err() {
                return Ok(Verdict::Error);
            }
        }
        Ok(Verdict::NoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{deterministic_keypair, sign_message};
    use crate::types::{Commission, PoolHash, UserField};
    use ed25519_dalek::Keypair;
    use tempfile::tempdir;

    fn sealed_pool(previous: PoolHash, sequence: u64, writer: &Keypair, timestamp: i64) -> Pool {
        let mut pool = Pool::new(previous, sequence);
        pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(timestamp));
        pool.set_confidants(vec![writer.public.to_bytes()]);
        pool.set_real_trusted_mask(0b1);
        let digest = pool.signing_digest();
        pool.add_signature(0, sign_message(writer, &digest).to_bytes());
        pool.sign_by_writer(writer);
        pool.compose();
        pool
    }

    fn store_with_genesis(writer: &Keypair) -> (tempfile::TempDir, BlockStore, Pool) {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let genesis = sealed_pool(PoolHash::empty(), 0, writer, 1_000);
        store.append(&genesis).unwrap();
        (dir, store, genesis)
    }

    #[test]
    fn accepts_a_well_formed_successor() {
        let writer = deterministic_keypair(1);
        let (_dir, store, genesis) = store_with_genesis(&writer);
        let wallets = WalletsCache::new();
        let block = sealed_pool(genesis.hash().clone(), 1, &writer, 2_000);

        let validator = BlockValidator::new();
        validator.validate_block(&store, &wallets, &block).unwrap();
    }

    #[test]
    fn broken_previous_hash_is_fatal() {
        let writer = deterministic_keypair(1);
        let (_dir, store, _genesis) = store_with_genesis(&writer);
        let wallets = WalletsCache::new();
        let block = sealed_pool(PoolHash::calc_from_data(b"other"), 1, &writer, 2_000);

        let validator = BlockValidator::new();
        let err = validator.validate_block(&store, &wallets, &block).unwrap_err();
        assert!(matches!(err, ChainError::Fatal(_)));
    }

    #[test]
    fn mask_and_signature_count_must_agree() {
        let writer = deterministic_keypair(1);
        let (_dir, store, genesis) = store_with_genesis(&writer);
        let wallets = WalletsCache::new();

        let mut block = Pool::new(genesis.hash().clone(), 1);
        block.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(2_000));
        block.set_confidants(vec![writer.public.to_bytes()]);
        // Two bits claimed, one signature present.
        block.set_real_trusted_mask(0b11);
        let digest = block.signing_digest();
        block.add_signature(0, sign_message(&writer, &digest).to_bytes());
        block.sign_by_writer(&writer);
        block.compose();

        let validator = BlockValidator::new();
        let err = validator.validate_block(&store, &wallets, &block).unwrap_err();
        assert!(matches!(err, ChainError::Validation(_)));
    }

    #[test]
    fn unsigned_ordinary_transaction_is_rejected() {
        let writer = deterministic_keypair(1);
        let (_dir, store, genesis) = store_with_genesis(&writer);
        let wallets = WalletsCache::new();

        let sender = deterministic_keypair(5);
        let mut block = Pool::new(genesis.hash().clone(), 1);
        block.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(2_000));
        let trx = Transaction::new(
            1,
            Address::PublicKey(sender.public.to_bytes()),
            Address::PublicKey(writer.public.to_bytes()),
            Amount::from_integral(1),
            Commission::from_f64(0.1),
        );
        // Deliberately unsigned.
        block.add_transaction(trx);
        block.set_confidants(vec![writer.public.to_bytes()]);
        block.set_real_trusted_mask(0b1);
        let digest = block.signing_digest();
        block.add_signature(0, sign_message(&writer, &digest).to_bytes());
        block.sign_by_writer(&writer);
        block.compose();

        let validator = BlockValidator::new();
        let err = validator.validate_block(&store, &wallets, &block).unwrap_err();
        assert!(matches!(err, ChainError::Validation(_)));
    }

    #[test]
    fn verdicts_are_pure() {
        let writer = deterministic_keypair(1);
        let (_dir, store, genesis) = store_with_genesis(&writer);
        let wallets = WalletsCache::new();
        let block = sealed_pool(genesis.hash().clone(), 1, &writer, 2_000);

        let validator = BlockValidator::new();
        let first = validator.verdicts(&store, &wallets, &block).unwrap();
        let second = validator.verdicts(&store, &wallets, &block).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|(_, verdict)| *verdict == Verdict::NoError));
    }
}
