use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::coinbase::{
    create_generation, CoinbaseParams, GenerationTransaction, Recipient, RewardType,
    RESPONSE_SLOT_LEN,
};
use crate::error::{PoolError, PoolResult};
use crate::merkle::MerkleTree;
use crate::randomness::ChallengeRandomness;
use crate::sigma::SigmaProver;
use crate::target::{difficulty, Target};
use crate::types::{JobParams, UpstreamTemplate};
use crate::util::{hash_from_hex, reverse_word_order, sha256, uint256_from_display_hex, var_int};

/// Pool-side inputs shared by every template the manager builds.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub pool_script: Vec<u8>,
    pub extranonce_placeholder: Vec<u8>,
    /// Fixed marker spliced into the challenge and the response blocks.
    pub marker: [u8; 4],
    pub reward: RewardType,
    pub tx_messages: bool,
    pub recipients: Vec<Recipient>,
}

type SubmitKey = (String, String, String, String);

/// One mineable job. Immutable once built apart from the submitted-share set.
#[derive(Debug)]
pub struct BlockTemplate {
    pub job_id: String,
    /// Sigma round whose response is embedded in this job's coinbase.
    pub round: usize,
    pub upstream: UpstreamTemplate,
    pub target: Target,
    pub difficulty: f64,
    pub prev_hash: [u8; 32],
    pub bits: [u8; 4],
    pub merkle_tree: MerkleTree,
    pub merkle_branch: Vec<String>,
    pub generation_transaction: GenerationTransaction,
    pub challenge: Vec<u8>,
    pub challenge_hash: [u8; 32],
    pub sigma_response: [u8; 32],
    marker: [u8; 4],
    reward: RewardType,
    transaction_data: Vec<u8>,
    submits: Mutex<HashSet<SubmitKey>>,
    job_params: OnceLock<JobParams>,
}

impl BlockTemplate {
    pub fn new(
        job_id: String,
        round: usize,
        upstream: UpstreamTemplate,
        context: &TemplateContext,
        prover: &mut SigmaProver,
        randomness: &ChallengeRandomness,
    ) -> PoolResult<Self> {
        let prev_hash = hash_from_hex(&upstream.previous_block_hash).ok_or_else(|| {
            PoolError::Template(format!(
                "previous block hash is not 32 bytes of hex: {}",
                upstream.previous_block_hash
            ))
        })?;
        let bits: [u8; 4] = hex::decode(&upstream.bits)?
            .try_into()
            .map_err(|_| PoolError::Template(format!("bits must be 4 bytes: {}", upstream.bits)))?;

        let target = match &upstream.target {
            Some(t) => Target::from_hex(t)
                .ok_or_else(|| PoolError::Template(format!("invalid target {}", t)))?,
            None => Target::from_compact(u32::from_be_bytes(bits))
                .ok_or_else(|| PoolError::Template(format!("bits overflow: {}", upstream.bits)))?,
        };
        if target.is_zero() {
            return Err(PoolError::Template("target is zero".into()));
        }

        let mut tx_hashes = Vec::with_capacity(upstream.transactions.len());
        let mut transaction_data = Vec::new();
        for tx in &upstream.transactions {
            let id = tx
                .txid
                .as_deref()
                .or(tx.hash.as_deref())
                .ok_or_else(|| PoolError::Template("transaction without txid or hash".into()))?;
            let hash = uint256_from_display_hex(id)
                .ok_or_else(|| PoolError::Template(format!("bad transaction id {}", id)))?;
            tx_hashes.push(hash);
            transaction_data.extend(hex::decode(&tx.data)?);
        }
        let merkle_tree = MerkleTree::new(&tx_hashes);
        let merkle_branch = merkle_tree.steps().iter().map(hex::encode).collect();

        let mut generation_transaction = create_generation(
            &upstream,
            &CoinbaseParams {
                pool_script: &context.pool_script,
                extranonce_placeholder_len: context.extranonce_placeholder.len(),
                reward: context.reward,
                tx_messages: context.tx_messages,
                recipients: &context.recipients,
            },
        )?;

        let challenge = build_challenge(
            upstream.version,
            &prev_hash,
            &generation_transaction,
            &context.marker,
            upstream.curtime,
            &bits,
            randomness,
        );
        let challenge_hash = sha256(&challenge);
        let sigma_response = prover.get_response(&challenge_hash)?;
        generation_transaction.part1[..RESPONSE_SLOT_LEN].copy_from_slice(&sigma_response);

        Ok(Self {
            job_id,
            round,
            target,
            difficulty: difficulty(&target),
            prev_hash,
            bits,
            merkle_tree,
            merkle_branch,
            generation_transaction,
            challenge,
            challenge_hash,
            sigma_response,
            marker: context.marker,
            reward: context.reward,
            transaction_data,
            submits: Mutex::new(HashSet::new()),
            job_params: OnceLock::new(),
            upstream,
        })
    }

    pub fn marker(&self) -> [u8; 4] {
        self.marker
    }

    pub fn serialize_coinbase(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let gen_tx = &self.generation_transaction;
        let mut out = Vec::with_capacity(
            gen_tx.part0.len() + extranonce1.len() + extranonce2.len() + gen_tx.part1.len(),
        );
        out.extend_from_slice(&gen_tx.part0);
        out.extend_from_slice(extranonce1);
        out.extend_from_slice(extranonce2);
        out.extend_from_slice(&gen_tx.part1);
        out
    }

    /// `merkle_root` in display (big-endian) order, as stratum carries it.
    pub fn serialize_header(&self, merkle_root: &[u8; 32], ntime: u32, nonce: u32) -> [u8; 80] {
        serialize_header(
            self.upstream.version,
            &self.prev_hash,
            &self.bits,
            merkle_root,
            ntime,
            nonce,
        )
    }

    pub fn serialize_block(&self, header: &[u8; 80], coinbase: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(80 + 9 + coinbase.len() + self.transaction_data.len() + 1);
        out.extend_from_slice(header);
        out.extend(var_int(self.upstream.transactions.len() as u64 + 1));
        out.extend_from_slice(coinbase);
        out.extend_from_slice(&self.transaction_data);
        // POS daemons replace this byte with the block signature.
        if self.reward == RewardType::Pos {
            out.push(0);
        }
        out
    }

    /// Record a submission; false if this exact tuple was seen before.
    pub fn register_submit(&self, extranonce1: &str, extranonce2: &str, ntime: &str, nonce: &str) -> bool {
        let key = (
            extranonce1.to_ascii_lowercase(),
            extranonce2.to_ascii_lowercase(),
            ntime.to_ascii_lowercase(),
            nonce.to_ascii_lowercase(),
        );
        self.submits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
    }

    /// Fields in the order the response block and the verifier expect them.
    pub fn block_contents(&self) -> Vec<String> {
        vec![
            hex::encode(&self.generation_transaction.part0),
            hex::encode(self.marker),
            hex::encode(&self.generation_transaction.part1),
            hex::encode(self.bits),
            format!("{:08x}", self.upstream.curtime),
            hex::encode(self.prev_hash),
            format!("{:08x}", self.upstream.version),
        ]
    }

    pub fn job_params(&self) -> &JobParams {
        self.job_params.get_or_init(|| JobParams {
            job_id: self.job_id.clone(),
            prev_hash: hex::encode(reverse_word_order(&self.prev_hash)),
            coinbase1: hex::encode(&self.generation_transaction.part0),
            coinbase2: hex::encode(&self.generation_transaction.part1),
            merkle_branch: self.merkle_branch.clone(),
            version: format!("{:08x}", self.upstream.version),
            bits: hex::encode(self.bits),
            ntime: format!("{:08x}", self.upstream.curtime),
            clean_jobs: true,
        })
    }
}

fn build_challenge(
    version: u32,
    prev_hash: &[u8; 32],
    generation_transaction: &GenerationTransaction,
    marker: &[u8; 4],
    curtime: u32,
    bits: &[u8; 4],
    randomness: &ChallengeRandomness,
) -> Vec<u8> {
    let tail = &generation_transaction.part1[RESPONSE_SLOT_LEN..];
    let mut challenge =
        Vec::with_capacity(4 + 32 + generation_transaction.part0.len() + 4 + tail.len() + 4 + 4 + 32);
    challenge.extend_from_slice(&version.to_be_bytes());
    challenge.extend_from_slice(prev_hash);
    challenge.extend_from_slice(&generation_transaction.part0);
    challenge.extend_from_slice(marker);
    challenge.extend_from_slice(tail);
    challenge.extend_from_slice(&curtime.to_be_bytes());
    challenge.extend_from_slice(bits);
    challenge.extend_from_slice(randomness.as_bytes());
    challenge
}

/// 80-byte header. Fields are laid out big-endian from nonce to version and
/// then the whole buffer is reversed, which yields the little-endian wire
/// header with both hashes in internal order.
pub fn serialize_header(
    version: u32,
    prev_hash: &[u8; 32],
    bits: &[u8; 4],
    merkle_root: &[u8; 32],
    ntime: u32,
    nonce: u32,
) -> [u8; 80] {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&nonce.to_be_bytes());
    header[4..8].copy_from_slice(bits);
    header[8..12].copy_from_slice(&ntime.to_be_bytes());
    header[12..44].copy_from_slice(merkle_root);
    header[44..76].copy_from_slice(prev_hash);
    header[76..80].copy_from_slice(&version.to_be_bytes());
    header.reverse();
    header
}
