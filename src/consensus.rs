//! Three-stage commit consensus among the round's confidants.
//!
//! Stage 1 commits to the node's candidate view, stage 2 reveals and
//! cross-signs every commit, stage 3 agrees on the writer, the trusted mask
//! and the block/round/trusted hashes. Disagreement clears the offender's
//! mask bit and re-runs stage 3 with the shrunk trusted set.

use std::collections::HashMap;

use ed25519_dalek::Keypair;

use crate::codec::{ByteReader, ByteWriter};
use crate::crypto::{
    blake2b_256, sign_message, verify_raw_signature, HASH_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::conveyer::RoundTable;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Amount, Pool, PoolHash};
use crate::wallets::WalletsCache;
use tracing::{debug, warn};

pub const INVALID_CONFIDANT_INDEX: u8 = u8::MAX;
pub const FIRST_WRITER_INDEX: u8 = 0;

/// Node's role in the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLevel {
    Normal,
    Confidant,
    Main,
    Writer,
}

/// Result of feeding a stage-3 message into the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Pending,
    Finish,
    Retry,
    Failure,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageOne {
    pub sender: u8,
    pub hash: [u8; HASH_SIZE],
    pub round_timestamp: u64,
    pub trusted_candidates: Vec<[u8; PUBLIC_KEY_SIZE]>,
    pub hashes_candidates: Vec<[u8; HASH_SIZE]>,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl StageOne {
    /// Bytes the commit hash is computed over: the candidate view without
    /// the sender or its signature.
    fn commit_payload(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u64(self.round_timestamp);
        writer.put_varint(self.trusted_candidates.len() as u64);
        for candidate in &self.trusted_candidates {
            writer.put_fixed(candidate);
        }
        writer.put_varint(self.hashes_candidates.len() as u64);
        for hash in &self.hashes_candidates {
            writer.put_fixed(hash);
        }
        writer.into_bytes()
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u8(self.sender);
        writer.put_fixed(&self.hash);
        writer.put_fixed(&self.commit_payload());
        writer.into_bytes()
    }

    /// Hash stage-2 messages reference this stage by.
    pub fn message_hash(&self) -> [u8; HASH_SIZE] {
        blake2b_256(&self.signable_bytes())
    }

    pub fn build(
        sender: u8,
        round_timestamp: u64,
        trusted_candidates: Vec<[u8; PUBLIC_KEY_SIZE]>,
        hashes_candidates: Vec<[u8; HASH_SIZE]>,
        keypair: &Keypair,
    ) -> Self {
        let mut stage = Self {
            sender,
            hash: [0u8; HASH_SIZE],
            round_timestamp,
            trusted_candidates,
            hashes_candidates,
            signature: [0u8; SIGNATURE_SIZE],
        };
        stage.hash = blake2b_256(&stage.commit_payload());
        stage.signature = sign_message(keypair, &stage.signable_bytes()).to_bytes();
        stage
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u8(self.sender);
        writer.put_fixed(&self.hash);
        writer.put_u64(self.round_timestamp);
        writer.put_varint(self.trusted_candidates.len() as u64);
        for candidate in &self.trusted_candidates {
            writer.put_fixed(candidate);
        }
        writer.put_varint(self.hashes_candidates.len() as u64);
        for hash in &self.hashes_candidates {
            writer.put_fixed(hash);
        }
        writer.put_fixed(&self.signature);
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let sender = reader.get_u8()?;
        let hash = reader.get_fixed()?;
        let round_timestamp = reader.get_u64()?;
        let candidate_count = reader.get_varint()?;
        let mut trusted_candidates = Vec::with_capacity(candidate_count.min(256) as usize);
        for _ in 0..candidate_count {
            trusted_candidates.push(reader.get_fixed()?);
        }
        let hash_count = reader.get_varint()?;
        let mut hashes_candidates = Vec::with_capacity(hash_count.min(1024) as usize);
        for _ in 0..hash_count {
            hashes_candidates.push(reader.get_fixed()?);
        }
        let signature = reader.get_fixed()?;
        Ok(Self {
            sender,
            hash,
            round_timestamp,
            trusted_candidates,
            hashes_candidates,
            signature,
        })
    }

    pub fn verify(&self, confidant: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.hash == blake2b_256(&self.commit_payload())
            && verify_raw_signature(confidant, &self.signable_bytes(), &self.signature)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageTwo {
    pub sender: u8,
    /// Stage-1 message hashes per confidant index.
    pub hashes: Vec<[u8; HASH_SIZE]>,
    /// The stage-1 signatures validating each hash.
    pub signatures: Vec<[u8; SIGNATURE_SIZE]>,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl StageTwo {
    fn signable_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u8(self.sender);
        writer.put_varint(self.hashes.len() as u64);
        for (hash, signature) in self.hashes.iter().zip(&self.signatures) {
            writer.put_fixed(hash);
            writer.put_fixed(signature);
        }
        writer.into_bytes()
    }

    pub fn build(sender: u8, stages: &[StageOne], keypair: &Keypair) -> Self {
        let mut ordered: Vec<&StageOne> = stages.iter().collect();
        ordered.sort_by_key(|stage| stage.sender);
        let mut stage = Self {
            sender,
            hashes: ordered.iter().map(|s| s.message_hash()).collect(),
            signatures: ordered.iter().map(|s| s.signature).collect(),
            signature: [0u8; SIGNATURE_SIZE],
        };
        stage.signature = sign_message(keypair, &stage.signable_bytes()).to_bytes();
        stage
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u8(self.sender);
        writer.put_varint(self.hashes.len() as u64);
        for (hash, signature) in self.hashes.iter().zip(&self.signatures) {
            writer.put_fixed(hash);
            writer.put_fixed(signature);
        }
        writer.put_fixed(&self.signature);
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let sender = reader.get_u8()?;
        let count = reader.get_varint()?;
        let mut hashes = Vec::with_capacity(count.min(256) as usize);
        let mut signatures = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            hashes.push(reader.get_fixed()?);
            signatures.push(reader.get_fixed()?);
        }
        let signature = reader.get_fixed()?;
        Ok(Self {
            sender,
            hashes,
            signatures,
            signature,
        })
    }

    pub fn verify(&self, confidant: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.hashes.len() == self.signatures.len()
            && verify_raw_signature(confidant, &self.signable_bytes(), &self.signature)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageThree {
    pub sender: u8,
    pub writer: u8,
    pub iteration: u8,
    pub real_trusted: Vec<u8>,
    pub block_hash: [u8; HASH_SIZE],
    pub block_signature: [u8; SIGNATURE_SIZE],
    pub round_hash: [u8; HASH_SIZE],
    pub round_signature: [u8; SIGNATURE_SIZE],
    pub trusted_hash: [u8; HASH_SIZE],
    pub trusted_signature: [u8; SIGNATURE_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl StageThree {
    fn signable_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u8(self.sender);
        writer.put_u8(self.writer);
        writer.put_u8(self.iteration);
        writer.put_bytes(&self.real_trusted);
        writer.put_fixed(&self.block_hash);
        writer.put_fixed(&self.block_signature);
        writer.put_fixed(&self.round_hash);
        writer.put_fixed(&self.round_signature);
        writer.put_fixed(&self.trusted_hash);
        writer.put_fixed(&self.trusted_signature);
        writer.into_bytes()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_fixed(&self.signable_bytes());
        writer.put_fixed(&self.signature);
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let sender = reader.get_u8()?;
        let writer = reader.get_u8()?;
        let iteration = reader.get_u8()?;
        let real_trusted = reader.get_bytes()?;
        let block_hash = reader.get_fixed()?;
        let block_signature = reader.get_fixed()?;
        let round_hash = reader.get_fixed()?;
        let round_signature = reader.get_fixed()?;
        let trusted_hash = reader.get_fixed()?;
        let trusted_signature = reader.get_fixed()?;
        let signature = reader.get_fixed()?;
        Ok(Self {
            sender,
            writer,
            iteration,
            real_trusted,
            block_hash,
            block_signature,
            round_hash,
            round_signature,
            trusted_hash,
            trusted_signature,
            signature,
        })
    }

    pub fn verify(&self, confidant: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        verify_raw_signature(confidant, &self.signable_bytes(), &self.signature)
    }
}

/// Mask over the round's confidants: `1` bit per entry still trusted.
pub fn mask_bits(real_trusted: &[u8]) -> u64 {
    real_trusted
        .iter()
        .enumerate()
        .filter(|(_, marker)| **marker != INVALID_CONFIDANT_INDEX)
        .fold(0u64, |bits, (index, _)| bits | (1u64 << index))
}

pub fn mask_population(real_trusted: &[u8]) -> usize {
    real_trusted
        .iter()
        .filter(|marker| **marker != INVALID_CONFIDANT_INDEX)
        .count()
}

/// Deterministic writer choice: fold the accepted commit hashes and reduce
/// modulo the number of valid confidants; ties resolve to the lowest index
/// by construction.
pub fn select_writer(commit_hashes: &[[u8; HASH_SIZE]], real_trusted: &[u8]) -> Option<u8> {
    let valid = mask_population(real_trusted);
    if valid == 0 {
        return None;
    }
    let mut data = Vec::with_capacity(commit_hashes.len() * HASH_SIZE);
    for hash in commit_hashes {
        data.extend_from_slice(hash);
    }
    let digest = blake2b_256(&data);
    let seed = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));
    let mut position = (seed % valid as u64) as usize;
    for (index, marker) in real_trusted.iter().enumerate() {
        if *marker == INVALID_CONFIDANT_INDEX {
            continue;
        }
        if position == 0 {
            return Some(index as u8);
        }
        position -= 1;
    }
    None
}

pub struct ConsensusConfig {
    pub min_stake: Amount,
    pub starting_dpos_round: u64,
    pub gray_list_penalty: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_stake: Amount::from_integral(1000),
            starting_dpos_round: 10,
            gray_list_penalty: 30,
        }
    }
}

/// Per-round state machine run by each trusted validator.
pub struct ConsensusEngine {
    keypair: Keypair,
    public_key: [u8; PUBLIC_KEY_SIZE],
    config: ConsensusConfig,
    round_table: RoundTable,
    level: NodeLevel,
    confidant_index: Option<u8>,
    iteration: u8,
    stage_one: Vec<StageOne>,
    stage_two: Vec<StageTwo>,
    stage_three: Vec<StageThree>,
    true_stage_three: Vec<StageThree>,
    own_stage_three: Option<StageThree>,
    real_trusted: Vec<u8>,
    gray_list: HashMap<[u8; PUBLIC_KEY_SIZE], u32>,
    last_gray_update: u64,
    cached_hashes: Vec<(PoolHash, [u8; PUBLIC_KEY_SIZE])>,
    accepted_hash_senders: Vec<[u8; PUBLIC_KEY_SIZE]>,
}

impl ConsensusEngine {
    pub fn new(keypair: Keypair, config: ConsensusConfig) -> Self {
        let public_key = keypair.public.to_bytes();
        Self {
            keypair,
            public_key,
            config,
            round_table: RoundTable::default(),
            level: NodeLevel::Normal,
            confidant_index: None,
            iteration: 0,
            stage_one: Vec::new(),
            stage_two: Vec::new(),
            stage_three: Vec::new(),
            true_stage_three: Vec::new(),
            own_stage_three: None,
            real_trusted: Vec::new(),
            gray_list: HashMap::new(),
            last_gray_update: 0,
            cached_hashes: Vec::new(),
            accepted_hash_senders: Vec::new(),
        }
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public_key
    }

    pub fn level(&self) -> NodeLevel {
        self.level
    }

    pub fn confidant_index(&self) -> Option<u8> {
        self.confidant_index
    }

    pub fn iteration(&self) -> u8 {
        self.iteration
    }

    pub fn round(&self) -> u64 {
        self.round_table.round
    }

    pub fn real_trusted(&self) -> &[u8] {
        &self.real_trusted
    }

    /// Clears round storages and derives the node's level from the new
    /// round table.
    pub fn next_round(&mut self, table: RoundTable) {
        self.update_gray_list(table.round);
        self.stage_one.clear();
        self.stage_two.clear();
        self.stage_three.clear();
        self.true_stage_three.clear();
        self.own_stage_three = None;
        self.iteration = 0;
        self.accepted_hash_senders.clear();
        self.real_trusted = vec![FIRST_WRITER_INDEX; table.confidants.len()];
        self.confidant_index = table.confidant_index(&self.public_key);
        self.level = match self.confidant_index {
            Some(0) => NodeLevel::Main,
            Some(_) => NodeLevel::Confidant,
            None => NodeLevel::Normal,
        };
        self.round_table = table;
    }

    pub fn add_to_gray_list(&mut self, sender: [u8; PUBLIC_KEY_SIZE]) {
        let term = self.config.gray_list_penalty * 2;
        match self.gray_list.get_mut(&sender) {
            None => {
                debug!(sender = %hex::encode(sender), rounds = term, "gray-listing node");
                self.gray_list.insert(sender, term);
            }
            Some(remaining) => {
                debug!(sender = %hex::encode(sender), "extending gray list term");
                *remaining += term * 2;
            }
        }
    }

    pub fn is_gray(&self, sender: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.gray_list.contains_key(sender)
    }

    /// Decrements every entry by the round delta; entries reaching zero are
    /// released.
    fn update_gray_list(&mut self, round: u64) {
        if self.last_gray_update >= round {
            return;
        }
        let delta = (round - self.last_gray_update) as u32;
        self.last_gray_update = round;
        self.gray_list.retain(|_, remaining| {
            // The term covers the current round too, so an entry expires
            // only once its counter cannot absorb the whole delta.
            if *remaining < delta {
                false
            } else {
                *remaining -= delta;
                true
            }
        });
    }

    /// A peer reported its chain head. Gray-listed and under-staked senders
    /// are ignored; hashes arriving while this node is still catching up are
    /// buffered for later.
    pub fn on_hash(
        &mut self,
        hash: PoolHash,
        sender: [u8; PUBLIC_KEY_SIZE],
        wallets: &WalletsCache,
        last_sequence: Option<u64>,
    ) -> bool {
        if self.is_gray(&sender) {
            debug!(sender = %hex::encode(sender), "dropping hash from gray-listed sender");
            return false;
        }
        if !self.passes_dpos(&sender, wallets) {
            debug!(sender = %hex::encode(sender), "sender stake below threshold");
            return false;
        }
        let behind = match last_sequence {
            Some(last) => self.round_table.round.saturating_sub(last) > 1,
            None => self.round_table.round > 1,
        };
        if behind {
            self.cached_hashes.push((hash, sender));
            debug!("caching hash until the store catches up");
            return false;
        }
        if !self.accepted_hash_senders.contains(&sender) {
            self.accepted_hash_senders.push(sender);
        }
        true
    }

    /// Replays hashes buffered while the chain store lagged behind.
    pub fn on_store_synced(&mut self, wallets: &WalletsCache, last_sequence: Option<u64>) {
        let cached = std::mem::take(&mut self.cached_hashes);
        for (hash, sender) in cached {
            self.on_hash(hash, sender, wallets, last_sequence);
        }
    }

    fn passes_dpos(&self, sender: &[u8; PUBLIC_KEY_SIZE], wallets: &WalletsCache) -> bool {
        if self.round_table.round < self.config.starting_dpos_round {
            return true;
        }
        let balance = wallets
            .balance(&crate::types::Address::PublicKey(*sender))
            .unwrap_or_else(Amount::zero);
        balance >= self.config.min_stake
    }

    pub fn accepted_hash_senders(&self) -> &[[u8; PUBLIC_KEY_SIZE]] {
        &self.accepted_hash_senders
    }

    pub fn build_stage_one(
        &mut self,
        round_timestamp: u64,
        hashes_candidates: Vec<[u8; HASH_SIZE]>,
    ) -> ChainResult<StageOne> {
        let sender = self
            .confidant_index
            .ok_or_else(|| ChainError::Validation("not a confidant this round".into()))?;
        let mut trusted_candidates = self.accepted_hash_senders.clone();
        trusted_candidates.sort();
        let stage = StageOne::build(
            sender,
            round_timestamp,
            trusted_candidates,
            hashes_candidates,
            &self.keypair,
        );
        self.stage_one.push(stage.clone());
        Ok(stage)
    }

    /// Returns `true` once stage-1 messages from every confidant are held.
    pub fn on_stage_one(&mut self, stage: StageOne) -> bool {
        let Some(confidant) = self.round_table.confidant_by_index(stage.sender).copied() else {
            return self.stage_one_complete();
        };
        if self.find_stage_one(stage.sender).is_some() {
            return self.stage_one_complete();
        }
        if !stage.verify(&confidant) {
            warn!(sender = stage.sender, "malformed stage-1 message");
            self.add_to_gray_list(confidant);
            return self.stage_one_complete();
        }
        debug!(sender = stage.sender, total = self.stage_one.len() + 1, "stage-1 stored");
        self.stage_one.push(stage);
        self.stage_one_complete()
    }

    pub fn stage_one_complete(&self) -> bool {
        self.stage_one.len() == self.round_table.confidants.len()
    }

    pub fn find_stage_one(&self, sender: u8) -> Option<&StageOne> {
        self.stage_one.iter().find(|stage| stage.sender == sender)
    }

    /// Confidant indices whose stage-1 is still missing.
    pub fn missing_stage_one(&self) -> Vec<u8> {
        (0..self.round_table.confidants.len() as u8)
            .filter(|index| self.find_stage_one(*index).is_none())
            .collect()
    }

    pub fn build_stage_two(&mut self) -> ChainResult<StageTwo> {
        let sender = self
            .confidant_index
            .ok_or_else(|| ChainError::Validation("not a confidant this round".into()))?;
        let stage = StageTwo::build(sender, &self.stage_one, &self.keypair);
        self.stage_two.push(stage.clone());
        Ok(stage)
    }

    pub fn on_stage_two(&mut self, stage: StageTwo) -> bool {
        let Some(confidant) = self.round_table.confidant_by_index(stage.sender).copied() else {
            return self.stage_two_complete();
        };
        if self.find_stage_two(stage.sender).is_some() {
            return self.stage_two_complete();
        }
        if !stage.verify(&confidant) {
            warn!(sender = stage.sender, "malformed stage-2 message");
            self.add_to_gray_list(confidant);
            return self.stage_two_complete();
        }
        debug!(sender = stage.sender, total = self.stage_two.len() + 1, "stage-2 stored");
        self.stage_two.push(stage);
        self.stage_two_complete()
    }

    pub fn stage_two_complete(&self) -> bool {
        self.stage_two.len() == self.round_table.confidants.len()
    }

    pub fn find_stage_two(&self, sender: u8) -> Option<&StageTwo> {
        self.stage_two.iter().find(|stage| stage.sender == sender)
    }

    pub fn missing_stage_two(&self) -> Vec<u8> {
        (0..self.round_table.confidants.len() as u8)
            .filter(|index| self.find_stage_two(*index).is_none())
            .collect()
    }

    /// Marks confidants whose stage-1/stage-2 contributions are missing or
    /// inconsistent with this node's view.
    fn compute_real_trusted(&mut self) {
        let count = self.round_table.confidants.len();
        let own_hashes: Vec<[u8; HASH_SIZE]> = {
            let mut ordered: Vec<&StageOne> = self.stage_one.iter().collect();
            ordered.sort_by_key(|stage| stage.sender);
            ordered.iter().map(|stage| stage.message_hash()).collect()
        };
        let mut markers = vec![INVALID_CONFIDANT_INDEX; count];
        let mut rank = FIRST_WRITER_INDEX;
        for index in 0..count as u8 {
            let consistent = self.find_stage_one(index).is_some()
                && self
                    .find_stage_two(index)
                    .map(|stage| stage.hashes == own_hashes)
                    .unwrap_or(false);
            if consistent && self.real_trusted.get(index as usize).copied()
                != Some(INVALID_CONFIDANT_INDEX)
            {
                markers[index as usize] = rank;
                rank += 1;
            }
        }
        self.real_trusted = markers;
    }

    fn round_hash(&self) -> [u8; HASH_SIZE] {
        let mut writer = ByteWriter::new();
        writer.put_u64(self.round_table.round);
        for confidant in &self.round_table.confidants {
            writer.put_fixed(confidant);
        }
        blake2b_256(&writer.into_bytes())
    }

    fn trusted_hash(&self, writer_index: u8) -> [u8; HASH_SIZE] {
        let mut writer = ByteWriter::new();
        writer.put_u8(writer_index);
        writer.put_bytes(&self.real_trusted);
        blake2b_256(&writer.into_bytes())
    }

    /// Stamps the candidate pool with the round's confidants and the
    /// current trusted mask, returning the digest stage-3 signs. The same
    /// stamp is re-applied on every retry so the digest always covers the
    /// mask being agreed on.
    pub fn prepare_candidate(&mut self, pool: &mut Pool) -> ChainResult<[u8; HASH_SIZE]> {
        if self.confidant_index.is_none() {
            return Err(ChainError::Validation("not a confidant this round".into()));
        }
        self.compute_real_trusted();
        pool.set_confidants(self.round_table.confidants.clone());
        pool.set_real_trusted_mask(mask_bits(&self.real_trusted));
        Ok(pool.signing_digest())
    }

    /// Builds and stores this node's stage-3 message for the candidate
    /// block digest.
    pub fn build_stage_three(&mut self, block_hash: [u8; HASH_SIZE]) -> ChainResult<StageThree> {
        let sender = self
            .confidant_index
            .ok_or_else(|| ChainError::Validation("not a confidant this round".into()))?;
        self.compute_real_trusted();
        let commit_hashes: Vec<[u8; HASH_SIZE]> = {
            let mut ordered: Vec<&StageOne> = self.stage_one.iter().collect();
            ordered.sort_by_key(|stage| stage.sender);
            ordered.iter().map(|stage| stage.hash).collect()
        };
        let writer_index = select_writer(&commit_hashes, &self.real_trusted)
            .ok_or_else(|| ChainError::Validation("no trusted confidants remain".into()))?;
        let round_hash = self.round_hash();
        let trusted_hash = self.trusted_hash(writer_index);
        let mut stage = StageThree {
            sender,
            writer: writer_index,
            iteration: self.iteration,
            real_trusted: self.real_trusted.clone(),
            block_hash,
            block_signature: sign_message(&self.keypair, &block_hash).to_bytes(),
            round_hash,
            round_signature: sign_message(&self.keypair, &round_hash).to_bytes(),
            trusted_hash,
            trusted_signature: sign_message(&self.keypair, &trusted_hash).to_bytes(),
            signature: [0u8; SIGNATURE_SIZE],
        };
        stage.signature = sign_message(&self.keypair, &stage.signable_bytes()).to_bytes();
        if self.level != NodeLevel::Writer && Some(writer_index) == self.confidant_index {
            self.level = NodeLevel::Writer;
        }
        self.own_stage_three = Some(stage.clone());
        self.true_stage_three.push(stage.clone());
        self.stage_three.push(stage.clone());
        Ok(stage)
    }

    /// Cross-checks a peer's stage-3 against this node's own: all three
    /// signatures must verify over the local hashes and the mask and writer
    /// must agree. A mismatch clears the offender's mask bit.
    pub fn on_stage_three(&mut self, stage: StageThree) -> StageOutcome {
        if stage.iteration < self.iteration {
            return StageOutcome::Pending;
        }
        if self
            .stage_three
            .iter()
            .any(|existing| existing.sender == stage.sender && existing.iteration == stage.iteration)
        {
            return StageOutcome::Pending;
        }
        let Some(confidant) = self.round_table.confidant_by_index(stage.sender).copied() else {
            return StageOutcome::Pending;
        };
        if !stage.verify(&confidant) {
            warn!(sender = stage.sender, "stage-3 envelope signature invalid");
            self.add_to_gray_list(confidant);
            return StageOutcome::Pending;
        }
        let Some(own) = self.own_stage_three.clone() else {
            self.stage_three.push(stage);
            return StageOutcome::Pending;
        };

        let mut mismatch = false;
        if own.real_trusted.get(stage.sender as usize).copied() == Some(INVALID_CONFIDANT_INDEX) {
            warn!(sender = stage.sender, "stage-3 from an already distrusted confidant");
            mismatch = true;
        }
        if !verify_raw_signature(&confidant, &own.block_hash, &stage.block_signature) {
            warn!(sender = stage.sender, "stage-3 block signature invalid");
            mismatch = true;
        }
        if !verify_raw_signature(&confidant, &own.round_hash, &stage.round_signature) {
            warn!(sender = stage.sender, "stage-3 round signature invalid");
            mismatch = true;
        }
        if !verify_raw_signature(&confidant, &own.trusted_hash, &stage.trusted_signature) {
            warn!(sender = stage.sender, "stage-3 trusted signature invalid");
            mismatch = true;
        }
        if stage.real_trusted != own.real_trusted || stage.writer != own.writer {
            warn!(sender = stage.sender, "stage-3 view disagrees");
            mismatch = true;
        }

        if mismatch {
            if let Some(marker) = self.real_trusted.get_mut(stage.sender as usize) {
                *marker = INVALID_CONFIDANT_INDEX;
            }
        } else {
            self.true_stage_three.push(stage.clone());
        }
        self.stage_three.push(stage);
        self.decide()
    }

    fn threshold(&self) -> usize {
        self.round_table.confidants.len() / 2 + 1
    }

    /// Current stage-3 standing, for drivers that must decide after their
    /// own stage rather than on a peer message.
    pub fn outcome(&self) -> StageOutcome {
        self.decide()
    }

    fn decide(&self) -> StageOutcome {
        let population = mask_population(&self.real_trusted);
        if population == 0 {
            return StageOutcome::Failure;
        }
        if let Some(own) = &self.own_stage_three {
            // A bit cleared after our stage-3 went out invalidates the
            // agreement it described.
            if own.real_trusted != self.real_trusted {
                return StageOutcome::Retry;
            }
        }
        // Committing needs a majority AND a verified stage-3 from every
        // confidant the mask still marks valid, so the sealed block carries
        // exactly one signature per mask bit.
        if self.true_stage_three.len() >= self.threshold()
            && self.true_stage_three.len() >= population
        {
            return StageOutcome::Finish;
        }
        let current: usize = self
            .stage_three
            .iter()
            .filter(|stage| stage.iteration == self.iteration)
            .count();
        if current >= self.round_table.confidants.len() {
            // Everyone answered and consensus still did not form.
            return StageOutcome::Retry;
        }
        StageOutcome::Pending
    }

    /// Starts the next stage-3 iteration with the shrunk trusted set.
    /// Returns `false` when no trusted confidants remain.
    pub fn retry_stage_three(&mut self) -> bool {
        self.iteration += 1;
        self.stage_three.clear();
        self.true_stage_three.clear();
        self.own_stage_three = None;
        // Re-rank the surviving confidants.
        let mut rank = FIRST_WRITER_INDEX;
        for marker in self.real_trusted.iter_mut() {
            if *marker != INVALID_CONFIDANT_INDEX {
                *marker = rank;
                rank += 1;
            }
        }
        mask_population(&self.real_trusted) > 0
    }

    pub fn find_stage_three(&self, sender: u8) -> Option<&StageThree> {
        self.stage_three
            .iter()
            .find(|stage| stage.sender == sender && stage.iteration == self.iteration)
    }

    pub fn true_stage_three(&self) -> &[StageThree] {
        &self.true_stage_three
    }

    /// Writer chosen by the current stage-3 agreement.
    pub fn writer_index(&self) -> Option<u8> {
        self.own_stage_three.as_ref().map(|stage| stage.writer)
    }

    /// Seals the candidate pool with the agreed mask and the collected
    /// stage-3 block signatures, then writer-signs and composes it.
    pub fn seal_pool(&self, mut pool: Pool) -> ChainResult<Pool> {
        let own = self
            .own_stage_three
            .as_ref()
            .ok_or_else(|| ChainError::Validation("no stage-3 agreement to seal with".into()))?;
        pool.set_confidants(self.round_table.confidants.clone());
        pool.set_real_trusted_mask(mask_bits(&own.real_trusted));
        let mut signatures: Vec<(u8, [u8; SIGNATURE_SIZE])> = self
            .true_stage_three
            .iter()
            .filter(|stage| {
                own.real_trusted.get(stage.sender as usize).copied()
                    != Some(INVALID_CONFIDANT_INDEX)
            })
            .map(|stage| (stage.sender, stage.block_signature))
            .collect();
        signatures.sort_by_key(|(sender, _)| *sender);
        signatures.dedup_by_key(|(sender, _)| *sender);
        for (sender, signature) in signatures {
            pool.add_signature(sender, signature);
        }
        pool.sign_by_writer(&self.keypair);
        pool.compose();
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;
    use crate::types::{pool_fields, UserField};

    fn engines(count: u8) -> Vec<ConsensusEngine> {
        let keypairs: Vec<Keypair> = (0..count).map(|n| deterministic_keypair(n + 1)).collect();
        let confidants: Vec<[u8; 32]> = keypairs.iter().map(|k| k.public.to_bytes()).collect();
        keypairs
            .into_iter()
            .map(|keypair| {
                let mut engine = ConsensusEngine::new(keypair, ConsensusConfig::default());
                engine.next_round(RoundTable {
                    round: 1,
                    confidants: confidants.clone(),
                    hashes: Vec::new(),
                });
                engine
            })
            .collect()
    }

    fn exchange_stages_one_and_two(engines: &mut [ConsensusEngine]) {
        let stage_ones: Vec<StageOne> = engines
            .iter_mut()
            .map(|engine| engine.build_stage_one(1_000, Vec::new()).unwrap())
            .collect();
        for engine in engines.iter_mut() {
            for stage in &stage_ones {
                if Some(stage.sender) != engine.confidant_index() {
                    engine.on_stage_one(stage.clone());
                }
            }
            assert!(engine.stage_one_complete());
        }
        let stage_twos: Vec<StageTwo> = engines
            .iter_mut()
            .map(|engine| engine.build_stage_two().unwrap())
            .collect();
        for engine in engines.iter_mut() {
            for stage in &stage_twos {
                if Some(stage.sender) != engine.confidant_index() {
                    engine.on_stage_two(stage.clone());
                }
            }
            assert!(engine.stage_two_complete());
        }
    }

    fn candidate_block_digest() -> [u8; 32] {
        let mut pool = Pool::new(PoolHash::empty(), 0);
        pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(1_000));
        pool.signing_digest()
    }

    #[test]
    fn stage_messages_round_trip() {
        let keypair = deterministic_keypair(1);
        let stage = StageOne::build(0, 42, vec![[5u8; 32]], vec![[6u8; 32]], &keypair);
        let decoded = StageOne::from_bytes(&stage.to_bytes()).unwrap();
        assert_eq!(decoded, stage);
        assert!(decoded.verify(&keypair.public.to_bytes()));

        let two = StageTwo::build(0, &[stage], &keypair);
        let decoded = StageTwo::from_bytes(&two.to_bytes()).unwrap();
        assert_eq!(decoded, two);
        assert!(decoded.verify(&keypair.public.to_bytes()));
    }

    #[test]
    fn clean_round_reaches_finish() {
        let mut engines = engines(4);
        exchange_stages_one_and_two(&mut engines);
        let digest = candidate_block_digest();

        let stage_threes: Vec<StageThree> = engines
            .iter_mut()
            .map(|engine| engine.build_stage_three(digest).unwrap())
            .collect();
        // All four computed the same writer and mask.
        let writer = stage_threes[0].writer;
        assert!(stage_threes.iter().all(|stage| stage.writer == writer));

        let engine = &mut engines[0];
        let mut outcome = StageOutcome::Pending;
        for stage in &stage_threes {
            if Some(stage.sender) != engine.confidant_index() {
                outcome = engine.on_stage_three(stage.clone());
                if outcome == StageOutcome::Finish {
                    break;
                }
            }
        }
        assert_eq!(outcome, StageOutcome::Finish);
        assert_eq!(mask_population(engine.real_trusted()), 4);
    }

    #[test]
    fn corrupted_stage_three_shrinks_the_mask_and_retries() {
        let mut engines = engines(4);
        exchange_stages_one_and_two(&mut engines);
        let digest = candidate_block_digest();

        let mut stage_threes: Vec<StageThree> = engines
            .iter_mut()
            .map(|engine| engine.build_stage_three(digest).unwrap())
            .collect();
        // Confidant 2 corrupts its block signature (the envelope is re-signed
        // so only the inner check can catch it).
        {
            let offender = deterministic_keypair(3);
            let stage = &mut stage_threes[2];
            stage.block_signature[0] ^= 0xff;
            stage.signature = sign_message(&offender, &stage.signable_bytes()).to_bytes();
        }

        // The corrupted stage arrives first: engine 0 clears bit 2 and asks
        // for a retry before the honest stages can complete the iteration.
        let engine = &mut engines[0];
        let outcome = engine.on_stage_three(stage_threes[2].clone());
        assert_eq!(outcome, StageOutcome::Retry);
        assert_eq!(engine.real_trusted()[2], INVALID_CONFIDANT_INDEX);

        // Re-run stage 3 with the shrunk set on the honest engines.
        assert!(engine.retry_stage_three());
        assert_eq!(engine.iteration(), 1);
        for index in [1usize, 3] {
            engines[index].real_trusted[2] = INVALID_CONFIDANT_INDEX;
            assert!(engines[index].retry_stage_three());
        }

        let retry_threes: Vec<StageThree> = [0usize, 1, 3]
            .iter()
            .map(|index| engines[*index].build_stage_three(digest).unwrap())
            .collect();
        let engine = &mut engines[0];
        let mut outcome = StageOutcome::Pending;
        for stage in retry_threes.iter().skip(1) {
            outcome = engine.on_stage_three(stage.clone());
        }
        assert_eq!(outcome, StageOutcome::Finish);

        let sealed = engine
            .seal_pool({
                let mut pool = Pool::new(PoolHash::empty(), 0);
                pool.add_user_field(pool_fields::TIMESTAMP, UserField::Integer(1_000));
                pool
            })
            .unwrap();
        assert_eq!(sealed.signatures().len(), 3);
        assert_eq!(sealed.real_trusted_mask(), 0b1011);
        let signers: Vec<u8> = sealed.signatures().iter().map(|(index, _)| *index).collect();
        assert_eq!(signers, vec![0, 1, 3]);
    }

    #[test]
    fn gray_list_term_is_twice_the_penalty_and_expires() {
        let keypair = deterministic_keypair(1);
        let mut engine = ConsensusEngine::new(
            keypair,
            ConsensusConfig {
                gray_list_penalty: 1,
                ..ConsensusConfig::default()
            },
        );
        engine.next_round(RoundTable {
            round: 1,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        let offender = [9u8; 32];
        // First offence in round 1: listed for 2·penalty rounds.
        engine.add_to_gray_list(offender);
        assert!(engine.is_gray(&offender));
        engine.next_round(RoundTable {
            round: 3,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        assert!(engine.is_gray(&offender));
        engine.next_round(RoundTable {
            round: 4,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        assert!(!engine.is_gray(&offender));

        // A repeat offender accumulates a doubled term.
        engine.add_to_gray_list(offender);
        engine.add_to_gray_list(offender);
        engine.next_round(RoundTable {
            round: 9,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        assert!(engine.is_gray(&offender));
        engine.next_round(RoundTable {
            round: 11,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        assert!(!engine.is_gray(&offender));
    }

    #[test]
    fn hashes_cache_until_the_store_catches_up() {
        let keypair = deterministic_keypair(1);
        let mut engine = ConsensusEngine::new(keypair, ConsensusConfig::default());
        engine.next_round(RoundTable {
            round: 5,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        let wallets = WalletsCache::new();
        let sender = deterministic_keypair(2).public.to_bytes();
        wallets.grant(sender, Amount::from_integral(10_000));

        // Store is three behind the round: the hash is cached, not accepted.
        assert!(!engine.on_hash(PoolHash::calc_from_data(b"h"), sender, &wallets, Some(2)));
        assert!(engine.accepted_hash_senders().is_empty());

        engine.on_store_synced(&wallets, Some(4));
        assert_eq!(engine.accepted_hash_senders(), &[sender]);
    }

    #[test]
    fn dpos_gate_rejects_low_stakes() {
        let keypair = deterministic_keypair(1);
        let mut engine = ConsensusEngine::new(keypair, ConsensusConfig::default());
        engine.next_round(RoundTable {
            round: 50,
            confidants: Vec::new(),
            hashes: Vec::new(),
        });
        let wallets = WalletsCache::new();
        let poor = deterministic_keypair(2).public.to_bytes();
        wallets.grant(poor, Amount::from_integral(1));
        assert!(!engine.on_hash(PoolHash::calc_from_data(b"h"), poor, &wallets, Some(49)));

        let rich = deterministic_keypair(3).public.to_bytes();
        wallets.grant(rich, Amount::from_integral(100_000));
        assert!(engine.on_hash(PoolHash::calc_from_data(b"h"), rich, &wallets, Some(49)));
    }

    #[test]
    fn degenerate_all_invalid_mask_fails_the_round() {
        let mut engines = engines(1);
        exchange_stages_one_and_two(&mut engines);
        let engine = &mut engines[0];
        engine.build_stage_three(candidate_block_digest()).unwrap();
        engine.real_trusted[0] = INVALID_CONFIDANT_INDEX;
        assert!(!engine.retry_stage_three());
    }
}
