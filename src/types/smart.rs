use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter};
use crate::errors::{ChainError, ChainResult};

use super::{PoolHash, TransactionId, UserField};

/// Typed parameter or return value of a contract method.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
}

impl Variant {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Variant::Text(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ByteCodeObject {
    pub name: String,
    pub bytecode: Vec<u8>,
}

/// Payload of a smart transaction. An empty `method` distinguishes a deploy
/// from an invoke.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SmartContractInvocation {
    pub source_code: String,
    pub bytecode_objects: Vec<ByteCodeObject>,
    pub hash_state: String,
    pub method: String,
    pub params: Vec<Variant>,
    pub uses: Vec<String>,
    pub forget_new_state: bool,
}

impl SmartContractInvocation {
    pub fn is_deploy(&self) -> bool {
        self.method.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialize invocation")
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        bincode::deserialize(bytes).map_err(|err| {
            ChainError::MalformedBinary(format!("invalid contract invocation: {err}"))
        })
    }
}

/// Stable pointer to the transaction that initiated a contract operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContractRef {
    pub hash: PoolHash,
    pub sequence: u64,
    pub transaction: u32,
}

impl SmartContractRef {
    pub fn new(hash: PoolHash, sequence: u64, transaction: u32) -> Self {
        Self {
            hash,
            sequence,
            transaction,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.hash.clone(), self.transaction)
    }

    pub fn to_user_field(&self) -> UserField {
        let mut writer = ByteWriter::new();
        self.hash.write_to(&mut writer);
        writer.put_u64(self.sequence);
        writer.put_u32(self.transaction);
        UserField::Bytes(writer.into_bytes())
    }

    pub fn from_user_field(field: &UserField) -> ChainResult<Self> {
        let bytes = field
            .as_bytes()
            .ok_or_else(|| ChainError::MalformedBinary("contract ref is not a byte field".into()))?;
        let mut reader = ByteReader::new(bytes);
        let hash = PoolHash::read_from(&mut reader)?;
        let sequence = reader.get_u64()?;
        let transaction = reader.get_u32()?;
        Ok(Self {
            hash,
            sequence,
            transaction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_round_trips_through_bincode() {
        let invocation = SmartContractInvocation {
            source_code: "contract Counter {}".into(),
            bytecode_objects: vec![ByteCodeObject {
                name: "Counter".into(),
                bytecode: vec![1, 2, 3],
            }],
            hash_state: "h0".into(),
            method: "increment".into(),
            params: vec![Variant::Integer(1), Variant::Text("x".into())],
            uses: vec![],
            forget_new_state: false,
        };
        let decoded = SmartContractInvocation::decode(&invocation.encode()).unwrap();
        assert_eq!(decoded, invocation);
        assert!(!decoded.is_deploy());
    }

    #[test]
    fn contract_ref_round_trips_through_user_field() {
        let reference = SmartContractRef::new(PoolHash::calc_from_data(b"pool"), 9, 3);
        let field = reference.to_user_field();
        let decoded = SmartContractRef::from_user_field(&field).unwrap();
        assert_eq!(decoded, reference);
        assert_eq!(decoded.transaction_id().index, 3);
    }
}
