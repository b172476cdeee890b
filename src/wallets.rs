//! Wallet cache: balances, transaction tails and the public-key to
//! wallet-id mapping, replayed from appended pools. Consumed as a read
//! interface by validation, the DPoS gate and the wallet queries.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::errors::{ChainError, ChainResult};
use crate::storage::BlockStore;
use crate::types::{Address, Amount, Pool, WalletId};

#[derive(Clone, Debug, Default)]
pub struct WalletRecord {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub wallet_id: Option<WalletId>,
    pub balance: Amount,
    pub last_inner_id: u64,
    pub transactions_count: u64,
}

#[derive(Default)]
struct WalletsInner {
    by_key: HashMap<[u8; PUBLIC_KEY_SIZE], WalletRecord>,
    by_id: HashMap<WalletId, [u8; PUBLIC_KEY_SIZE]>,
}

pub struct WalletsCache {
    inner: RwLock<WalletsInner>,
}

impl WalletsCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(WalletsInner::default()),
        }
    }

    /// Seeds a balance without a transaction, for genesis grants.
    pub fn grant(&self, public_key: [u8; PUBLIC_KEY_SIZE], amount: Amount) {
        let mut inner = self.inner.write();
        let record = inner.by_key.entry(public_key).or_insert_with(|| WalletRecord {
            public_key,
            ..WalletRecord::default()
        });
        record.balance = record.balance.checked_add(&amount).unwrap_or(record.balance);
    }

    /// Rebuilds the cache by replaying the whole chain.
    pub fn bootstrap(&self, store: &BlockStore) -> ChainResult<()> {
        {
            let mut inner = self.inner.write();
            inner.by_key.clear();
            inner.by_id.clear();
        }
        let Some(last) = store.last_sequence() else {
            return Ok(());
        };
        for sequence in 0..=last {
            let pool = store.load(sequence)?.ok_or_else(|| {
                ChainError::Fatal(format!("chain gap at sequence {sequence}"))
            })?;
            self.apply_pool(&pool);
        }
        Ok(())
    }

    /// Folds one appended pool into the cache: wallet-id assignments first,
    /// then balance movements.
    pub fn apply_pool(&self, pool: &Pool) {
        let mut inner = self.inner.write();
        for info in pool.new_wallets() {
            let Some(address) = pool.wallet_address(info) else {
                warn!(
                    sequence = pool.sequence(),
                    index = info.transaction_index,
                    "new wallet entry points past the pool"
                );
                continue;
            };
            let key = match address {
                Address::PublicKey(key) => key,
                Address::WalletId(id) => match inner.by_id.get(&id) {
                    Some(key) => *key,
                    None => {
                        warn!(wallet_id = id, "new wallet entry for unknown id");
                        continue;
                    }
                },
            };
            let record = inner.by_key.entry(key).or_insert_with(|| WalletRecord {
                public_key: key,
                ..WalletRecord::default()
            });
            record.wallet_id = Some(info.wallet_id);
            inner.by_id.insert(info.wallet_id, key);
        }

        for transaction in pool.transactions() {
            let fee = Amount::from_f64(transaction.counted_fee.to_f64());
            let source = resolve_key(&inner, &transaction.source);
            let target = resolve_key(&inner, &transaction.target);
            if let Some(key) = source {
                let record = inner.by_key.entry(key).or_insert_with(|| WalletRecord {
                    public_key: key,
                    ..WalletRecord::default()
                });
                let spent = transaction
                    .amount
                    .checked_add(&fee)
                    .unwrap_or(transaction.amount);
                record.balance = record
                    .balance
                    .checked_sub(&spent)
                    .unwrap_or_else(|| record.balance.checked_sub(&transaction.amount).unwrap_or(record.balance));
                record.last_inner_id = transaction.inner_id();
                record.transactions_count += 1;
            }
            if let Some(key) = target {
                let record = inner.by_key.entry(key).or_insert_with(|| WalletRecord {
                    public_key: key,
                    ..WalletRecord::default()
                });
                record.balance = record
                    .balance
                    .checked_add(&transaction.amount)
                    .unwrap_or(record.balance);
                record.transactions_count += 1;
            }
        }
    }

    /// Resolves either address form to the public key, if known.
    pub fn resolve(&self, address: &Address) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let inner = self.inner.read();
        resolve_key(&inner, address)
    }

    pub fn wallet_id_of(&self, public_key: &[u8; PUBLIC_KEY_SIZE]) -> Option<WalletId> {
        self.inner
            .read()
            .by_key
            .get(public_key)
            .and_then(|record| record.wallet_id)
    }

    pub fn data(&self, address: &Address) -> Option<WalletRecord> {
        let inner = self.inner.read();
        let key = resolve_key(&inner, address)?;
        inner.by_key.get(&key).cloned()
    }

    pub fn balance(&self, address: &Address) -> Option<Amount> {
        self.data(address).map(|record| record.balance)
    }

    /// Smallest id not yet assigned, for the round writer's new-wallet
    /// records.
    pub fn next_wallet_id(&self) -> WalletId {
        self.inner
            .read()
            .by_id
            .keys()
            .max()
            .copied()
            .unwrap_or(0)
            + 1
    }
}

impl Default for WalletsCache {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_key(inner: &WalletsInner, address: &Address) -> Option<[u8; PUBLIC_KEY_SIZE]> {
    match address {
        Address::PublicKey(key) => Some(*key),
        Address::WalletId(id) => inner.by_id.get(id).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;
    use crate::types::{Commission, NewWalletInfo, PoolHash, Transaction, WalletAddressKind};

    #[test]
    fn applies_wallet_ids_and_balances() {
        let cache = WalletsCache::new();
        let sender = deterministic_keypair(1);
        let receiver = deterministic_keypair(2);
        cache.grant(sender.public.to_bytes(), Amount::from_integral(100));

        let mut pool = Pool::new(PoolHash::empty(), 0);
        let mut trx = Transaction::new(
            1,
            Address::PublicKey(sender.public.to_bytes()),
            Address::PublicKey(receiver.public.to_bytes()),
            Amount::from_integral(30),
            Commission::from_f64(0.0),
        );
        trx.sign(&sender);
        pool.add_transaction(trx);
        pool.add_new_wallet(NewWalletInfo {
            transaction_index: 0,
            kind: WalletAddressKind::Target,
            wallet_id: 5,
        });
        pool.compose();

        cache.apply_pool(&pool);

        let sender_data = cache
            .data(&Address::PublicKey(sender.public.to_bytes()))
            .unwrap();
        assert_eq!(sender_data.balance, Amount::from_integral(70));
        assert_eq!(sender_data.last_inner_id, 1);

        let receiver_data = cache.data(&Address::WalletId(5)).unwrap();
        assert_eq!(receiver_data.balance, Amount::from_integral(30));
        assert_eq!(receiver_data.wallet_id, Some(5));
        assert_eq!(
            cache.resolve(&Address::WalletId(5)),
            Some(receiver.public.to_bytes()),
        );
    }
}
