use std::collections::BTreeMap;

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter};
use crate::crypto::{
    blake2b_256, sign_message, verify_raw_signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::errors::{ChainError, ChainResult};

use super::user_field::{read_user_fields, write_user_fields};
use super::{Address, PoolHash, Transaction, TransactionId, UserField, UserFieldId, WalletId};

/// Pool user field holding the real-trusted bitmask of the sealing round.
pub const TRUSTED_MASK_FIELD: UserFieldId = -3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletAddressKind {
    Source,
    Target,
}

/// Wallet-id assignment recorded by the writer: the address at
/// `transaction_index` (source or target side) received `wallet_id`.
/// An index equal to the transaction count designates the writer key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWalletInfo {
    pub transaction_index: u64,
    pub kind: WalletAddressKind,
    pub wallet_id: WalletId,
}

impl NewWalletInfo {
    fn packed_id(&self) -> u64 {
        let kind = match self.kind {
            WalletAddressKind::Source => 0u64,
            WalletAddressKind::Target => 1u64,
        };
        (self.transaction_index << 1) | kind
    }

    fn from_packed(packed: u64, wallet_id: WalletId) -> Self {
        Self {
            transaction_index: packed >> 1,
            kind: if packed & 1 == 0 {
                WalletAddressKind::Source
            } else {
                WalletAddressKind::Target
            },
            wallet_id,
        }
    }

    fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u64(self.packed_id());
        writer.put_u32(self.wallet_id);
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let packed = reader.get_u64()?;
        let wallet_id = reader.get_u32()?;
        Ok(Self::from_packed(packed, wallet_id))
    }
}

/// Signatures produced by a contract's own consensus round, covering the
/// packet of transactions the contract emitted into a later block. Persisted
/// alongside the pool rather than inside its byte stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmartSignature {
    pub source_key: [u8; PUBLIC_KEY_SIZE],
    pub initiating_sequence: u64,
    pub signatures: Vec<(u8, Vec<u8>)>,
}

/// Header of a pool decoded without its transactions.
#[derive(Clone, Debug)]
pub struct PoolMeta {
    pub previous_hash: PoolHash,
    pub sequence: u64,
    pub user_fields: BTreeMap<UserFieldId, UserField>,
    pub transaction_count: u32,
}

/// One block. Mutable while being assembled by the round writer; sealing
/// (`compose`) fixes the byte stream, computes the hash and makes the pool
/// read-only.
#[derive(Clone, Debug)]
pub struct Pool {
    previous_hash: PoolHash,
    sequence: u64,
    user_fields: BTreeMap<UserFieldId, UserField>,
    transactions: Vec<Transaction>,
    new_wallets: Vec<NewWalletInfo>,
    confidants: Vec<[u8; PUBLIC_KEY_SIZE]>,
    signatures: Vec<(u8, [u8; SIGNATURE_SIZE])>,
    writer_public_key: [u8; PUBLIC_KEY_SIZE],
    writer_signature: [u8; SIGNATURE_SIZE],
    read_only: bool,
    hash: PoolHash,
    binary: Vec<u8>,
}

impl Pool {
    pub fn new(previous_hash: PoolHash, sequence: u64) -> Self {
        Self {
            previous_hash,
            sequence,
            user_fields: BTreeMap::new(),
            transactions: Vec::new(),
            new_wallets: Vec::new(),
            confidants: Vec::new(),
            signatures: Vec::new(),
            writer_public_key: [0u8; PUBLIC_KEY_SIZE],
            writer_signature: [0u8; SIGNATURE_SIZE],
            read_only: false,
            hash: PoolHash::empty(),
            binary: Vec::new(),
        }
    }

    pub fn previous_hash(&self) -> &PoolHash {
        &self.previous_hash
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn transaction(&self, index: usize) -> Option<&Transaction> {
        self.transactions.get(index)
    }

    pub fn transaction_count(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn transaction_id(&self, index: u32) -> TransactionId {
        TransactionId::new(self.hash.clone(), index)
    }

    pub fn confidants(&self) -> &[[u8; PUBLIC_KEY_SIZE]] {
        &self.confidants
    }

    pub fn signatures(&self) -> &[(u8, [u8; SIGNATURE_SIZE])] {
        &self.signatures
    }

    pub fn writer_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.writer_public_key
    }

    pub fn new_wallets(&self) -> &[NewWalletInfo] {
        &self.new_wallets
    }

    pub fn user_field(&self, id: UserFieldId) -> Option<&UserField> {
        self.user_fields.get(&id)
    }

    pub fn real_trusted_mask(&self) -> u64 {
        self.user_field(TRUSTED_MASK_FIELD)
            .and_then(UserField::as_integer)
            .map(|bits| bits as u64)
            .unwrap_or(0)
    }

    pub fn add_transaction(&mut self, transaction: Transaction) -> bool {
        if self.read_only {
            return false;
        }
        self.transactions.push(transaction);
        true
    }

    pub fn add_user_field(&mut self, id: UserFieldId, field: UserField) -> bool {
        if self.read_only {
            return false;
        }
        self.user_fields.insert(id, field);
        true
    }

    pub fn set_real_trusted_mask(&mut self, mask: u64) -> bool {
        if self.read_only {
            return false;
        }
        self.user_fields
            .insert(TRUSTED_MASK_FIELD, UserField::Integer(mask as i64));
        true
    }

    pub fn add_new_wallet(&mut self, info: NewWalletInfo) -> bool {
        if self.read_only {
            return false;
        }
        self.new_wallets.push(info);
        true
    }

    pub fn set_confidants(&mut self, confidants: Vec<[u8; PUBLIC_KEY_SIZE]>) -> bool {
        if self.read_only {
            return false;
        }
        self.confidants = confidants;
        true
    }

    pub fn add_signature(&mut self, index: u8, signature: [u8; SIGNATURE_SIZE]) -> bool {
        if self.read_only {
            return false;
        }
        self.signatures.push((index, signature));
        true
    }

    pub fn set_writer_public_key(&mut self, key: [u8; PUBLIC_KEY_SIZE]) -> bool {
        if self.read_only {
            return false;
        }
        self.writer_public_key = key;
        true
    }

    fn write_prefix(&self, writer: &mut ByteWriter) {
        self.previous_hash.write_to(writer);
        writer.put_u64(self.sequence);
        write_user_fields(&self.user_fields, writer);
        writer.put_varint(self.transactions.len() as u64);
        for transaction in &self.transactions {
            transaction.write_to(writer);
        }
        writer.put_varint(self.new_wallets.len() as u64);
        for wallet in &self.new_wallets {
            wallet.write_to(writer);
        }
        writer.put_varint(self.confidants.len() as u64);
        for confidant in &self.confidants {
            writer.put_bytes(confidant);
        }
    }

    fn write_signatures(&self, writer: &mut ByteWriter) {
        writer.put_varint(self.signatures.len() as u64);
        for (index, signature) in &self.signatures {
            writer.put_u8(*index);
            writer.put_bytes(signature);
        }
    }

    pub fn write_to(&self, writer: &mut ByteWriter) {
        self.write_prefix(writer);
        self.write_signatures(writer);
        writer.put_bytes(&self.writer_public_key);
        writer.put_bytes(&self.writer_signature);
    }

    /// Bytes covered by the pool hash point that confidant signatures attest
    /// to: everything up to the signatures section.
    pub fn hashing_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.write_prefix(&mut writer);
        writer.into_bytes()
    }

    /// Digest each confidant signs during the final consensus stage.
    pub fn signing_digest(&self) -> [u8; 32] {
        blake2b_256(&self.hashing_bytes())
    }

    /// Bytes covered by the writer signature: the full stream minus the
    /// trailing writer key and signature.
    pub fn writer_signable_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.write_prefix(&mut writer);
        self.write_signatures(&mut writer);
        writer.into_bytes()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        if self.read_only {
            return self.binary.clone();
        }
        let mut writer = ByteWriter::new();
        self.write_to(&mut writer);
        writer.into_bytes()
    }

    /// Seals the pool: fixes its byte stream, computes the content hash and
    /// rejects further mutation.
    pub fn compose(&mut self) {
        if self.read_only {
            return;
        }
        let mut writer = ByteWriter::new();
        self.write_to(&mut writer);
        self.binary = writer.into_bytes();
        self.hash = PoolHash::calc_from_data(&self.binary);
        self.read_only = true;
    }

    pub fn hash(&self) -> &PoolHash {
        &self.hash
    }

    pub fn sign_by_writer(&mut self, keypair: &Keypair) -> bool {
        if self.read_only {
            return false;
        }
        self.writer_public_key = keypair.public.to_bytes();
        let signature = sign_message(keypair, &self.writer_signable_bytes());
        self.writer_signature = signature.to_bytes();
        true
    }

    pub fn verify_writer_signature(&self) -> ChainResult<()> {
        if verify_raw_signature(
            &self.writer_public_key,
            &self.writer_signable_bytes(),
            &self.writer_signature,
        ) {
            Ok(())
        } else {
            Err(ChainError::SignatureInvalid(format!(
                "writer signature of pool {} fails verification",
                self.sequence
            )))
        }
    }

    fn read_prefix(reader: &mut ByteReader<'_>) -> ChainResult<Pool> {
        let previous_hash = PoolHash::read_from(reader)?;
        let sequence = reader.get_u64()?;
        let user_fields = read_user_fields(reader)?;
        let transaction_count = reader.get_varint()?;
        let mut transactions = Vec::with_capacity(transaction_count.min(1 << 20) as usize);
        for _ in 0..transaction_count {
            transactions.push(Transaction::read_from(reader)?);
        }
        let wallet_count = reader.get_varint()?;
        let mut new_wallets = Vec::with_capacity(wallet_count.min(1 << 16) as usize);
        for _ in 0..wallet_count {
            new_wallets.push(NewWalletInfo::read_from(reader)?);
        }
        let confidant_count = reader.get_varint()?;
        let mut confidants = Vec::with_capacity(confidant_count.min(256) as usize);
        for _ in 0..confidant_count {
            let bytes = reader.get_bytes()?;
            let key: [u8; PUBLIC_KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                ChainError::MalformedBinary("confidant key must be 32 bytes".into())
            })?;
            confidants.push(key);
        }
        let mut pool = Pool::new(previous_hash, sequence);
        pool.user_fields = user_fields;
        pool.transactions = transactions;
        pool.new_wallets = new_wallets;
        pool.confidants = confidants;
        Ok(pool)
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let mut pool = Self::read_prefix(&mut reader)?;
        let signature_count = reader.get_varint()?;
        for _ in 0..signature_count {
            let index = reader.get_u8()?;
            let bytes = reader.get_bytes()?;
            let signature: [u8; SIGNATURE_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                ChainError::MalformedBinary("pool signature must be 64 bytes".into())
            })?;
            pool.signatures.push((index, signature));
        }
        let writer_key = reader.get_bytes()?;
        pool.writer_public_key = writer_key.as_slice().try_into().map_err(|_| {
            ChainError::MalformedBinary("writer public key must be 32 bytes".into())
        })?;
        let writer_signature = reader.get_bytes()?;
        pool.writer_signature = writer_signature.as_slice().try_into().map_err(|_| {
            ChainError::MalformedBinary("writer signature must be 64 bytes".into())
        })?;
        if reader.remaining() != 0 {
            return Err(ChainError::MalformedBinary(format!(
                "{} trailing bytes after pool stream",
                reader.remaining()
            )));
        }
        pool.binary = data.to_vec();
        pool.hash = PoolHash::calc_from_data(data);
        pool.read_only = true;
        Ok(pool)
    }

    /// Decodes only the header fields, stopping at the transaction count.
    pub fn meta_from_bytes(data: &[u8]) -> ChainResult<PoolMeta> {
        let mut reader = ByteReader::new(data);
        let previous_hash = PoolHash::read_from(&mut reader)?;
        let sequence = reader.get_u64()?;
        let user_fields = read_user_fields(&mut reader)?;
        let transaction_count = reader.get_varint()? as u32;
        Ok(PoolMeta {
            previous_hash,
            sequence,
            user_fields,
            transaction_count,
        })
    }

    /// LZ4 transport encoding; the uncompressed length travels alongside.
    pub fn to_lz4_bytes(&self) -> (Vec<u8>, u32) {
        let raw = self.to_bytes();
        let compressed = lz4_flex::compress(&raw);
        (compressed, raw.len() as u32)
    }

    pub fn from_lz4_bytes(data: &[u8], uncompressed_len: u32) -> ChainResult<Self> {
        let raw = lz4_flex::decompress(data, uncompressed_len as usize)
            .map_err(|err| ChainError::MalformedBinary(format!("lz4 decode failed: {err}")))?;
        Self::from_bytes(&raw)
    }

    /// Resolves the address a `NewWalletInfo` entry refers to.
    pub fn wallet_address(&self, info: &NewWalletInfo) -> Option<Address> {
        let index = info.transaction_index as usize;
        if index == self.transactions.len() {
            return Some(Address::PublicKey(self.writer_public_key));
        }
        let transaction = self.transactions.get(index)?;
        Some(match info.kind {
            WalletAddressKind::Source => transaction.source,
            WalletAddressKind::Target => transaction.target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;
    use crate::types::{pool_fields, Amount, Commission};

    fn sample_pool() -> Pool {
        let writer = deterministic_keypair(3);
        let sender = deterministic_keypair(4);
        let mut pool = Pool::new(PoolHash::calc_from_data(b"genesis"), 1);
        pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(1_700_000_000_000));
        let mut trx = Transaction::new(
            1,
            Address::PublicKey(sender.public.to_bytes()),
            Address::WalletId(7),
            Amount::new(5, 0),
            Commission::from_f64(0.5),
        );
        trx.sign(&sender);
        pool.add_transaction(trx);
        pool.add_new_wallet(NewWalletInfo {
            transaction_index: 0,
            kind: WalletAddressKind::Target,
            wallet_id: 7,
        });
        pool.set_confidants(vec![writer.public.to_bytes()]);
        pool.set_real_trusted_mask(0b1);
        let digest = pool.signing_digest();
        let signature = sign_message(&writer, &digest);
        pool.add_signature(0, signature.to_bytes());
        pool.sign_by_writer(&writer);
        pool.compose();
        pool
    }

    #[test]
    fn serialization_round_trips_byte_identically() {
        let pool = sample_pool();
        let bytes = pool.to_bytes();
        let decoded = Pool::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.to_bytes(), bytes);
        assert_eq!(decoded.hash(), pool.hash());
        assert_eq!(decoded.sequence(), pool.sequence());
        assert_eq!(decoded.transactions(), pool.transactions());
        assert_eq!(decoded.real_trusted_mask(), 0b1);
    }

    #[test]
    fn hash_covers_the_full_stream() {
        let pool = sample_pool();
        assert_eq!(
            *pool.hash(),
            PoolHash::calc_from_data(&pool.to_bytes()),
        );
    }

    #[test]
    fn sealed_pool_rejects_mutation() {
        let mut pool = sample_pool();
        assert!(pool.is_read_only());
        assert!(!pool.add_user_field(9, UserField::Integer(1)));
        assert!(!pool.add_signature(1, [0u8; SIGNATURE_SIZE]));
        assert!(!pool.set_real_trusted_mask(0));
    }

    #[test]
    fn writer_signature_verifies_and_rejects_tamper() {
        let pool = sample_pool();
        pool.verify_writer_signature().unwrap();

        let mut bytes = pool.to_bytes();
        // Flip a byte inside the signed region.
        bytes[12] ^= 0xff;
        let tampered = Pool::from_bytes(&bytes).unwrap();
        assert!(tampered.verify_writer_signature().is_err());
    }

    #[test]
    fn confidant_signature_covers_hash_point() {
        let pool = sample_pool();
        let digest = pool.signing_digest();
        let (index, signature) = pool.signatures()[0];
        assert_eq!(index, 0);
        assert!(verify_raw_signature(
            &pool.confidants()[0],
            &digest,
            &signature,
        ));
    }

    #[test]
    fn meta_decode_stops_at_transaction_count() {
        let pool = sample_pool();
        let meta = Pool::meta_from_bytes(&pool.to_bytes()).unwrap();
        assert_eq!(meta.sequence, 1);
        assert_eq!(meta.transaction_count, 1);
        assert_eq!(meta.previous_hash, *pool.previous_hash());
    }

    #[test]
    fn lz4_transport_round_trip() {
        let pool = sample_pool();
        let (compressed, uncompressed_len) = pool.to_lz4_bytes();
        let decoded = Pool::from_lz4_bytes(&compressed, uncompressed_len).unwrap();
        assert_eq!(decoded.hash(), pool.hash());
    }

    #[test]
    fn truncated_pool_is_malformed() {
        let pool = sample_pool();
        let bytes = pool.to_bytes();
        let err = Pool::from_bytes(&bytes[..bytes.len() - 10]).unwrap_err();
        assert!(matches!(err, ChainError::MalformedBinary(_)));
    }

    #[test]
    fn wallet_address_resolves_target_and_writer() {
        let pool = sample_pool();
        let info = &pool.new_wallets()[0];
        assert_eq!(pool.wallet_address(info), Some(Address::WalletId(7)));

        let writer_info = NewWalletInfo {
            transaction_index: pool.transaction_count() as u64,
            kind: WalletAddressKind::Source,
            wallet_id: 9,
        };
        assert_eq!(
            pool.wallet_address(&writer_info),
            Some(Address::PublicKey(*pool.writer_public_key())),
        );
    }
}
