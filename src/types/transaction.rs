use std::collections::BTreeMap;

use ed25519_dalek::Keypair;

use crate::codec::{ByteReader, ByteWriter};
use crate::crypto::{sign_message, verify_raw_signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::errors::{ChainError, ChainResult};

use super::user_field::{read_user_fields, trx_fields, write_user_fields};
use super::{Address, Amount, Commission, SmartContractInvocation, UserField, UserFieldId};

/// The low 46 bits of `inner_id` are significant; the rest is reserved.
pub const INNER_ID_MASK: u64 = 0x3fff_ffff_ffff;

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    inner_id: u64,
    pub source: Address,
    pub target: Address,
    pub amount: Amount,
    pub max_fee: Commission,
    pub counted_fee: Commission,
    pub currency: u8,
    signature: [u8; SIGNATURE_SIZE],
    user_fields: BTreeMap<UserFieldId, UserField>,
}

impl Transaction {
    pub fn new(
        inner_id: u64,
        source: Address,
        target: Address,
        amount: Amount,
        max_fee: Commission,
    ) -> Self {
        Self {
            inner_id: inner_id & INNER_ID_MASK,
            source,
            target,
            amount,
            max_fee,
            counted_fee: Commission::from_raw(0),
            currency: 1,
            signature: [0u8; SIGNATURE_SIZE],
            user_fields: BTreeMap::new(),
        }
    }

    pub fn inner_id(&self) -> u64 {
        self.inner_id
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signature
    }

    pub fn set_signature(&mut self, signature: [u8; SIGNATURE_SIZE]) {
        self.signature = signature;
    }

    pub fn add_user_field(&mut self, id: UserFieldId, field: UserField) {
        self.user_fields.insert(id, field);
    }

    pub fn user_field(&self, id: UserFieldId) -> Option<&UserField> {
        self.user_fields.get(&id)
    }

    fn write_body(&self, writer: &mut ByteWriter) {
        writer.put_u64(self.inner_id);
        self.source.write_to(writer);
        self.target.write_to(writer);
        self.amount.write_to(writer);
        writer.put_u16(self.max_fee.raw());
        writer.put_u16(self.counted_fee.raw());
        writer.put_u8(self.currency);
        write_user_fields(&self.user_fields, writer);
    }

    pub fn write_to(&self, writer: &mut ByteWriter) {
        self.write_body(writer);
        writer.put_fixed(&self.signature);
    }

    /// Canonical byte stream covered by the source's signature: every field
    /// in declaration order except the signature itself.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.write_body(&mut writer);
        writer.into_bytes()
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let inner_id = reader.get_u64()?;
        if inner_id & !INNER_ID_MASK != 0 {
            return Err(ChainError::MalformedBinary(
                "reserved inner id bits are set".into(),
            ));
        }
        let source = Address::read_from(reader)?;
        let target = Address::read_from(reader)?;
        let amount = Amount::read_from(reader)?;
        let max_fee = Commission::from_raw(reader.get_u16()?);
        let counted_fee = Commission::from_raw(reader.get_u16()?);
        let currency = reader.get_u8()?;
        let user_fields = read_user_fields(reader)?;
        let signature = reader.get_fixed()?;
        Ok(Self {
            inner_id,
            source,
            target,
            amount,
            max_fee,
            counted_fee,
            currency,
            signature,
            user_fields,
        })
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        let signature = sign_message(keypair, &self.signable_bytes());
        self.signature = signature.to_bytes();
    }

    pub fn verify_signature(&self, public_key: &[u8; PUBLIC_KEY_SIZE]) -> ChainResult<()> {
        if verify_raw_signature(public_key, &self.signable_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(ChainError::SignatureInvalid(format!(
                "transaction {} from {} fails verification",
                self.inner_id, self.source
            )))
        }
    }

    /// Carries a contract deploy or invoke payload.
    pub fn is_smart(&self) -> bool {
        matches!(
            self.user_field(trx_fields::SMART_INVOKE),
            Some(UserField::Bytes(_))
        )
    }

    /// Carries a contract new-state produced by the executor.
    pub fn is_smart_state(&self) -> bool {
        matches!(
            self.user_field(trx_fields::NEW_STATE_VALUE),
            Some(UserField::Bytes(_))
        ) && matches!(
            self.user_field(trx_fields::NEW_STATE_REF),
            Some(UserField::Bytes(_))
        )
    }

    pub fn invocation(&self) -> Option<SmartContractInvocation> {
        let bytes = self.user_field(trx_fields::SMART_INVOKE)?.as_bytes()?;
        SmartContractInvocation::decode(bytes).ok()
    }

    pub fn is_deploy(&self) -> bool {
        self.invocation()
            .map(|invocation| invocation.is_deploy())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;

    fn sample_transaction() -> Transaction {
        let source = deterministic_keypair(1);
        let target = deterministic_keypair(2);
        let mut trx = Transaction::new(
            7,
            Address::PublicKey(source.public.to_bytes()),
            Address::PublicKey(target.public.to_bytes()),
            Amount::new(10, 0),
            Commission::from_f64(0.1),
        );
        trx.add_user_field(trx_fields::GENERAL_DATA, UserField::Bytes(b"memo".to_vec()));
        trx.sign(&source);
        trx
    }

    #[test]
    fn inner_id_is_masked_to_46_bits() {
        let trx = Transaction::new(
            u64::MAX,
            Address::WalletId(1),
            Address::WalletId(2),
            Amount::zero(),
            Commission::from_raw(0),
        );
        assert_eq!(trx.inner_id(), INNER_ID_MASK);
    }

    #[test]
    fn codec_round_trip_preserves_transaction() {
        let trx = sample_transaction();
        let mut writer = ByteWriter::new();
        trx.write_to(&mut writer);
        let bytes = writer.into_bytes();
        let decoded = Transaction::read_from(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, trx);
    }

    #[test]
    fn signature_covers_all_fields_but_itself() {
        let keypair = deterministic_keypair(1);
        let mut trx = sample_transaction();
        trx.verify_signature(&keypair.public.to_bytes()).unwrap();

        trx.add_user_field(5, UserField::Integer(1));
        let err = trx.verify_signature(&keypair.public.to_bytes()).unwrap_err();
        assert!(matches!(err, ChainError::SignatureInvalid(_)));
    }

    #[test]
    fn smart_classification_follows_user_fields() {
        let mut trx = sample_transaction();
        assert!(!trx.is_smart());
        assert!(!trx.is_smart_state());

        trx.add_user_field(
            trx_fields::SMART_INVOKE,
            UserField::Bytes(SmartContractInvocation::default().encode()),
        );
        assert!(trx.is_smart());
        assert!(trx.is_deploy());
    }
}
