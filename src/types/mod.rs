mod amount;
mod pool;
mod smart;
mod transaction;
mod user_field;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter};
use crate::crypto::{blake2b_256, HASH_SIZE, PUBLIC_KEY_SIZE};
use crate::errors::{ChainError, ChainResult};

pub use amount::{Amount, Commission, FRACTION_DENOMINATOR};
pub use pool::{
    NewWalletInfo, Pool, PoolMeta, SmartSignature, WalletAddressKind, TRUSTED_MASK_FIELD,
};
pub use smart::{ByteCodeObject, SmartContractInvocation, SmartContractRef, Variant};
pub use transaction::{Transaction, INNER_ID_MASK};
pub use user_field::{
    pool_fields, read_user_fields, trx_fields, write_user_fields, UserField, UserFieldId,
};

pub type WalletId = u32;

/// Content hash of a pool. Either empty (the genesis previous hash) or a
/// full 32-byte digest.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolHash(Vec<u8>);

impl PoolHash {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> ChainResult<Self> {
        if bytes.is_empty() || bytes.len() == HASH_SIZE {
            Ok(Self(bytes))
        } else {
            Err(ChainError::MalformedBinary(format!(
                "pool hash must be empty or {HASH_SIZE} bytes, got {}",
                bytes.len()
            )))
        }
    }

    pub fn calc_from_data(data: &[u8]) -> Self {
        Self(blake2b_256(data).to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Config(format!("invalid pool hash encoding: {err}")))?;
        Self::from_bytes(bytes)
    }

    pub fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_bytes(&self.0);
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        Self::from_bytes(reader.get_bytes()?)
    }
}

impl fmt::Debug for PoolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolHash({})", self.to_hex())
    }
}

impl fmt::Display for PoolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PoolHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PoolHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        PoolHash::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

const ADDRESS_TAG_PUBLIC_KEY: u8 = 0;
const ADDRESS_TAG_WALLET_ID: u8 = 1;

/// Transaction endpoint: a full public key or a compact wallet id that the
/// wallet cache resolves to one. The two forms are never compared directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    PublicKey([u8; PUBLIC_KEY_SIZE]),
    WalletId(WalletId),
}

impl Address {
    pub fn is_wallet_id(&self) -> bool {
        matches!(self, Address::WalletId(_))
    }

    pub fn public_key(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        match self {
            Address::PublicKey(key) => Some(key),
            Address::WalletId(_) => None,
        }
    }

    pub fn wallet_id(&self) -> Option<WalletId> {
        match self {
            Address::WalletId(id) => Some(*id),
            Address::PublicKey(_) => None,
        }
    }

    pub fn from_public_key(key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Address::PublicKey(key)
    }

    pub fn write_to(&self, writer: &mut ByteWriter) {
        match self {
            Address::PublicKey(key) => {
                writer.put_u8(ADDRESS_TAG_PUBLIC_KEY);
                writer.put_fixed(key);
            }
            Address::WalletId(id) => {
                writer.put_u8(ADDRESS_TAG_WALLET_ID);
                writer.put_u32(*id);
            }
        }
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.get_u8()? {
            ADDRESS_TAG_PUBLIC_KEY => Ok(Address::PublicKey(reader.get_fixed()?)),
            ADDRESS_TAG_WALLET_ID => Ok(Address::WalletId(reader.get_u32()?)),
            tag => Err(ChainError::MalformedBinary(format!(
                "unknown address tag {tag}"
            ))),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::PublicKey(key) => write!(f, "Address::PublicKey({})", hex::encode(key)),
            Address::WalletId(id) => write!(f, "Address::WalletId({id})"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::PublicKey(key) => f.write_str(&hex::encode(key)),
            Address::WalletId(id) => write!(f, "id:{id}"),
        }
    }
}

/// Stable pointer to a transaction inside a sealed pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub pool_hash: PoolHash,
    pub index: u32,
}

impl TransactionId {
    pub fn new(pool_hash: PoolHash, index: u32) -> Self {
        Self { pool_hash, index }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool_hash, self.index)
    }
}
