//! Round bookkeeping and the transaction packet queue feeding consensus.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::codec::ByteWriter;
use crate::crypto::{blake2b_256, HASH_SIZE, PUBLIC_KEY_SIZE};
use crate::types::Transaction;

pub type PacketHash = [u8; HASH_SIZE];

/// Batch of transactions travelling between nodes ahead of the round.
#[derive(Clone, Debug, Default)]
pub struct TransactionPacket {
    transactions: Vec<Transaction>,
    hash: Option<PacketHash>,
}

impl TransactionPacket {
    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
        self.hash = None;
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn make_hash(&mut self) -> PacketHash {
        if let Some(hash) = self.hash {
            return hash;
        }
        let mut writer = ByteWriter::new();
        for transaction in &self.transactions {
            transaction.write_to(&mut writer);
        }
        let hash = blake2b_256(&writer.into_bytes());
        self.hash = Some(hash);
        hash
    }
}

/// Ordered confidants and the packet hashes expected this round. The
/// position of a key in `confidants` is the node's confidant index.
#[derive(Clone, Debug, Default)]
pub struct RoundTable {
    pub round: u64,
    pub confidants: Vec<[u8; PUBLIC_KEY_SIZE]>,
    pub hashes: Vec<PacketHash>,
}

impl RoundTable {
    pub fn confidant_index(&self, key: &[u8; PUBLIC_KEY_SIZE]) -> Option<u8> {
        self.confidants
            .iter()
            .position(|confidant| confidant == key)
            .map(|index| index as u8)
    }

    pub fn confidant_by_index(&self, index: u8) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.confidants.get(index as usize)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u64(self.round);
        writer.put_varint(self.confidants.len() as u64);
        for confidant in &self.confidants {
            writer.put_fixed(confidant);
        }
        writer.put_varint(self.hashes.len() as u64);
        for hash in &self.hashes {
            writer.put_fixed(hash);
        }
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> crate::errors::ChainResult<Self> {
        let mut reader = crate::codec::ByteReader::new(data);
        let round = reader.get_u64()?;
        let confidant_count = reader.get_varint()?;
        let mut confidants = Vec::with_capacity(confidant_count.min(256) as usize);
        for _ in 0..confidant_count {
            confidants.push(reader.get_fixed()?);
        }
        let hash_count = reader.get_varint()?;
        let mut hashes = Vec::with_capacity(hash_count.min(1024) as usize);
        for _ in 0..hash_count {
            hashes.push(reader.get_fixed()?);
        }
        Ok(Self {
            round,
            confidants,
            hashes,
        })
    }
}

const INVALID_RETENTION_ROUNDS: u64 = 5;

#[derive(Default)]
struct ConveyerInner {
    round_table: RoundTable,
    open_packet: TransactionPacket,
    packet_queue: VecDeque<TransactionPacket>,
    packet_table: HashMap<PacketHash, TransactionPacket>,
    recently_invalid: HashMap<u64, u64>,
}

/// Single-mutex holder of the current round table and the packet pipeline.
pub struct Conveyer {
    inner: Mutex<ConveyerInner>,
}

impl Conveyer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConveyerInner::default()),
        }
    }

    pub fn current_round(&self) -> u64 {
        self.inner.lock().round_table.round
    }

    pub fn round_table(&self) -> RoundTable {
        self.inner.lock().round_table.clone()
    }

    pub fn set_round_table(&self, table: RoundTable) {
        let mut inner = self.inner.lock();
        let round = table.round;
        inner.round_table = table;
        inner
            .recently_invalid
            .retain(|_, seen| round.saturating_sub(*seen) <= INVALID_RETENTION_ROUNDS);
    }

    pub fn confidants(&self) -> Vec<[u8; PUBLIC_KEY_SIZE]> {
        self.inner.lock().round_table.confidants.clone()
    }

    pub fn add_transaction(&self, transaction: Transaction) {
        self.inner.lock().open_packet.add_transaction(transaction);
    }

    /// Closes the open packet and queues it for the coming round.
    pub fn flush_packet(&self) -> Option<PacketHash> {
        let mut inner = self.inner.lock();
        if inner.open_packet.is_empty() {
            return None;
        }
        let mut packet = std::mem::take(&mut inner.open_packet);
        let hash = packet.make_hash();
        inner.packet_table.insert(hash, packet.clone());
        inner.packet_queue.push_back(packet);
        Some(hash)
    }

    /// Drains queued packets into a flat transaction list for the writer,
    /// capped at `limit` transactions.
    pub fn take_transactions(&self, limit: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();
        while taken.len() < limit {
            let Some(packet) = inner.packet_queue.pop_front() else {
                break;
            };
            for transaction in packet.transactions() {
                if taken.len() >= limit {
                    break;
                }
                taken.push(transaction.clone());
            }
        }
        taken
    }

    pub fn packet_by_hash(&self, hash: &PacketHash) -> Option<TransactionPacket> {
        self.inner.lock().packet_table.get(hash).cloned()
    }

    pub fn queued_transactions(&self) -> usize {
        let inner = self.inner.lock();
        inner.open_packet.len()
            + inner
                .packet_queue
                .iter()
                .map(TransactionPacket::len)
                .sum::<usize>()
    }

    /// True when a transaction with this inner id is still travelling
    /// through the packet pipeline.
    pub fn contains_inner_id(&self, inner_id: u64) -> bool {
        let inner = self.inner.lock();
        let in_open = inner
            .open_packet
            .transactions()
            .iter()
            .any(|t| t.inner_id() == inner_id);
        in_open
            || inner
                .packet_queue
                .iter()
                .chain(inner.packet_table.values())
                .any(|packet| {
                    packet
                        .transactions()
                        .iter()
                        .any(|t| t.inner_id() == inner_id)
                })
    }

    pub fn mark_invalid(&self, inner_id: u64) {
        let mut inner = self.inner.lock();
        let round = inner.round_table.round;
        inner.recently_invalid.insert(inner_id, round);
    }

    pub fn is_recently_invalid(&self, inner_id: u64) -> bool {
        self.inner.lock().recently_invalid.contains_key(&inner_id)
    }

    /// Forgets packets sealed into a block.
    pub fn discard_packet(&self, hash: &PacketHash) {
        self.inner.lock().packet_table.remove(hash);
    }
}

impl Default for Conveyer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;
    use crate::types::{Address, Amount, Commission};

    fn transaction(inner_id: u64) -> Transaction {
        let keypair = deterministic_keypair(8);
        let mut trx = Transaction::new(
            inner_id,
            Address::PublicKey(keypair.public.to_bytes()),
            Address::WalletId(1),
            Amount::from_integral(1),
            Commission::from_f64(0.1),
        );
        trx.sign(&keypair);
        trx
    }

    #[test]
    fn packets_flow_through_queue_and_table() {
        let conveyer = Conveyer::new();
        conveyer.add_transaction(transaction(1));
        conveyer.add_transaction(transaction(2));
        let hash = conveyer.flush_packet().unwrap();

        assert!(conveyer.contains_inner_id(1));
        assert_eq!(conveyer.packet_by_hash(&hash).unwrap().len(), 2);

        let taken = conveyer.take_transactions(10);
        assert_eq!(taken.len(), 2);
        // Still present in the table until the block is sealed.
        assert!(conveyer.contains_inner_id(2));
        conveyer.discard_packet(&hash);
        assert!(!conveyer.contains_inner_id(2));
    }

    #[test]
    fn invalid_marks_expire_with_rounds() {
        let conveyer = Conveyer::new();
        conveyer.set_round_table(RoundTable {
            round: 10,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        conveyer.mark_invalid(77);
        assert!(conveyer.is_recently_invalid(77));

        conveyer.set_round_table(RoundTable {
            round: 16,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        assert!(!conveyer.is_recently_invalid(77));
    }
}
