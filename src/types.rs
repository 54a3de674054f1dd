use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// `getblocktemplate` result, trimmed to the fields the pool consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash", alias = "previousBlockHash")]
    pub previous_block_hash: String,
    pub bits: String,
    pub curtime: u32,
    pub height: u64,
    #[serde(rename = "coinbasevalue", alias = "coinbaseValue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub coinbaseaux: Option<CoinbaseAux>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: String,
}

/// A miner's `mining.submit`, plus the connection context the transport knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareSubmission {
    pub job_id: String,
    pub extranonce1: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub difficulty: f64,
    #[serde(default)]
    pub previous_difficulty: Option<f64>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// `mining.notify` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub bits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

/// Accounting record of an accepted share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub job_id: String,
    pub worker: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub height: u64,
    pub block_reward: u64,
    pub difficulty: f64,
    pub share_diff: f64,
    pub block_diff: f64,
    pub block_diff_actual: f64,
    pub block_hash: Option<String>,
    pub block_hash_invalid: Option<String>,
    pub round: usize,
    pub challenge: String,
    pub challenge_hash: String,
    pub sigma_response: String,
    pub nonce: String,
    pub extranonce2: String,
    pub block_contents: Vec<String>,
    pub coinbase: String,
    pub coinbase_hash: String,
    pub merkle_root: String,
    pub header: String,
    pub header_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRejection {
    pub job_id: String,
    pub worker: Option<String>,
    pub ip: Option<String>,
    pub difficulty: f64,
    pub code: u32,
    pub message: String,
}

/// What `process_share` hands back for an accepted share.
#[derive(Debug, Clone)]
pub struct ShareOutcome {
    pub record: ShareRecord,
    /// Serialized block, present only when the share met the network target.
    pub block_hex: Option<String>,
    /// Work for the next round, present while rounds remain.
    pub next_job: Option<JobParams>,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    NewBlock(JobParams),
    UpdatedBlock(JobParams),
    Share {
        record: Box<ShareRecord>,
        block_hex: Option<String>,
    },
    ShareRejected(ShareRejection),
    RoundAdvanced {
        round: usize,
        randomness: String,
    },
    ProofCompleted {
        rounds: usize,
        path: Option<PathBuf>,
    },
}
