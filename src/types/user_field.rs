use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter};
use crate::errors::{ChainError, ChainResult};

use super::Amount;

pub type UserFieldId = i32;

/// Well-known pool user fields.
pub mod pool_fields {
    use super::UserFieldId;

    /// Block timestamp in milliseconds, set by the round writer.
    pub const TIMESTAMP: UserFieldId = 0;
}

/// Well-known transaction user fields.
pub mod trx_fields {
    use super::UserFieldId;

    /// Serialized contract invocation; presence marks a smart transaction.
    pub const SMART_INVOKE: UserFieldId = 0;
    /// Free-form client payload on ordinary transactions.
    pub const GENERAL_DATA: UserFieldId = 1;
    /// Reference to the initiating smart transaction on a new-state.
    pub const NEW_STATE_REF: UserFieldId = -1;
    /// Serialized contract state on a new-state transaction.
    pub const NEW_STATE_VALUE: UserFieldId = -2;
    /// Execution fee charged by the executor.
    pub const NEW_STATE_FEE: UserFieldId = 1;
    /// Serialized return value of the invocation.
    pub const NEW_STATE_RET_VAL: UserFieldId = 2;
}

const TAG_INTEGER: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_AMOUNT: u8 = 3;

/// Tagged user-field value; the tag byte precedes the payload on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserField {
    Integer(i64),
    Bytes(Vec<u8>),
    Amount(Amount),
}

impl UserField {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            UserField::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            UserField::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<Amount> {
        match self {
            UserField::Amount(value) => Some(*value),
            _ => None,
        }
    }

    pub fn write_to(&self, writer: &mut ByteWriter) {
        match self {
            UserField::Integer(value) => {
                writer.put_u8(TAG_INTEGER);
                writer.put_i64(*value);
            }
            UserField::Bytes(value) => {
                writer.put_u8(TAG_BYTES);
                writer.put_bytes(value);
            }
            UserField::Amount(value) => {
                writer.put_u8(TAG_AMOUNT);
                value.write_to(writer);
            }
        }
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.get_u8()? {
            TAG_INTEGER => Ok(UserField::Integer(reader.get_i64()?)),
            TAG_BYTES => Ok(UserField::Bytes(reader.get_bytes()?)),
            TAG_AMOUNT => Ok(UserField::Amount(Amount::read_from(reader)?)),
            tag => Err(ChainError::MalformedBinary(format!(
                "unknown user field tag {tag}"
            ))),
        }
    }
}

/// Serializes a user-field map: varint count, then `(id, field)` pairs in
/// ascending id order so the stream is deterministic.
pub fn write_user_fields(
    fields: &std::collections::BTreeMap<UserFieldId, UserField>,
    writer: &mut ByteWriter,
) {
    writer.put_varint(fields.len() as u64);
    for (id, field) in fields {
        writer.put_i32(*id);
        field.write_to(writer);
    }
}

pub fn read_user_fields(
    reader: &mut ByteReader<'_>,
) -> ChainResult<std::collections::BTreeMap<UserFieldId, UserField>> {
    let count = reader.get_varint()?;
    let mut fields = std::collections::BTreeMap::new();
    for _ in 0..count {
        let id = reader.get_i32()?;
        let field = UserField::read_from(reader)?;
        fields.insert(id, field);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn fields_round_trip_in_id_order() {
        let mut fields = BTreeMap::new();
        fields.insert(trx_fields::NEW_STATE_VALUE, UserField::Bytes(b"state".to_vec()));
        fields.insert(trx_fields::GENERAL_DATA, UserField::Integer(42));
        fields.insert(2, UserField::Amount(Amount::new(1, 5)));

        let mut writer = ByteWriter::new();
        write_user_fields(&fields, &mut writer);
        let bytes = writer.into_bytes();
        let decoded = read_user_fields(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut writer = ByteWriter::new();
        writer.put_u8(9);
        let bytes = writer.into_bytes();
        let err = UserField::read_from(&mut ByteReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, ChainError::MalformedBinary(_)));
    }
}
