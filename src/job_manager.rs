//! Job rotation, share validation and Sigma round progression.
//!
//! Two locks guard the mutable state. `round` serializes everything that
//! touches the prover, the randomness and the proof bundle; `jobs` is the
//! live job table that share validation reads concurrently. When both are
//! needed the round lock is taken first.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::block_template::{BlockTemplate, TemplateContext};
use crate::config::{Config, ConfigError};
use crate::error::{PoolError, PoolResult, ProtocolError, ShareError, SigmaError};
use crate::proof::{ProofBundle, ResponseBlock};
use crate::randomness::{ChallengeRandomness, RandomnessReceiver};
use crate::sigma::{CommitmentSet, SigmaProver};
use crate::target::{share_difficulty, Target};
use crate::types::{
    JobParams, PoolEvent, ShareOutcome, ShareRecord, ShareRejection, ShareSubmission,
    UpstreamTemplate,
};
use crate::util::{reversed32, sha256, sha256d, u32_from_hex, unix_now};

/// How far into the future a share's nTime may run.
const MAX_NTIME_DRIFT_SECS: i64 = 7200;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct JobManagerOptions {
    pub context: TemplateContext,
    pub extranonce2_size: usize,
    pub coinbase_single_sha256: bool,
    pub share_multiplier: f64,
    pub emit_invalid_block_hashes: bool,
    pub proof_path: Option<PathBuf>,
    pub randomness_timeout: Duration,
}

impl JobManagerOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let invalid = |key: &str, e: hex::FromHexError| {
            ConfigError::InvalidEnvVar(key.to_string(), e.to_string())
        };
        let placeholder = hex::decode(&config.extranonce_placeholder)
            .map_err(|e| invalid("EXTRANONCE_PLACEHOLDER", e))?;
        let marker: [u8; 4] = hex::decode(&config.extranonce1_marker)
            .map_err(|e| invalid("EXTRANONCE1_MARKER", e))?
            .try_into()
            .map_err(|_| {
                ConfigError::ValidationError("EXTRANONCE1_MARKER must be 4 bytes".to_string())
            })?;
        let extranonce2_size = placeholder.len().checked_sub(marker.len()).ok_or_else(|| {
            ConfigError::ValidationError(
                "EXTRANONCE_PLACEHOLDER must be longer than EXTRANONCE1_MARKER".to_string(),
            )
        })?;

        Ok(Self {
            context: TemplateContext {
                pool_script: hex::decode(&config.pool_address_script)
                    .map_err(|e| invalid("POOL_ADDRESS_SCRIPT", e))?,
                extranonce_placeholder: placeholder,
                marker,
                reward: config.reward_type,
                tx_messages: config.tx_messages,
                recipients: config.recipients()?,
            },
            extranonce2_size,
            coinbase_single_sha256: config.coinbase_single_sha256,
            share_multiplier: config.share_multiplier,
            emit_invalid_block_hashes: config.emit_invalid_block_hashes,
            proof_path: Some(config.proof_path.clone()),
            randomness_timeout: config.randomness_timeout(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProtocolState {
    Uninitialized,
    AwaitingRandomness,
    Active { round: usize },
    Complete,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Uninitialized => write!(f, "uninitialized"),
            ProtocolState::AwaitingRandomness => write!(f, "awaiting randomness"),
            ProtocolState::Active { round } => write!(f, "active (round {})", round),
            ProtocolState::Complete => write!(f, "complete"),
        }
    }
}

/// Hex job ids; skips multiples of 0xffff by restarting at 1.
#[derive(Debug, Default)]
pub struct JobCounter {
    counter: u64,
}

impl JobCounter {
    pub fn next(&mut self) -> String {
        self.counter += 1;
        if self.counter % 0xffff == 0 {
            self.counter = 1;
        }
        format!("{:x}", self.counter)
    }

    pub fn current(&self) -> String {
        format!("{:x}", self.counter)
    }
}

/// Threshold check of step 9: returns the difficulty to credit.
pub fn evaluate_share_difficulty(
    share_diff: f64,
    difficulty: f64,
    previous_difficulty: Option<f64>,
) -> Result<f64, ShareError> {
    if share_diff / difficulty >= 0.99 {
        return Ok(difficulty);
    }
    // Shares mined just before a retarget are still credited at the old value.
    match previous_difficulty {
        Some(previous) if share_diff >= previous => Ok(previous),
        _ => Err(ShareError::LowDifficulty(share_diff)),
    }
}

struct RoundState {
    prover: SigmaProver,
    randomness: Option<ChallengeRandomness>,
    bundle: ProofBundle,
    job_counter: JobCounter,
    latest_upstream: Option<UpstreamTemplate>,
    state: ProtocolState,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Arc<BlockTemplate>>,
    current: Option<Arc<BlockTemplate>>,
    // Jobs of the previous round, kept only so resubmissions still read as
    // duplicates. Shares on them never advance a round.
    retired: HashMap<String, Arc<BlockTemplate>>,
}

/// Share data computed outside the round lock.
struct CheckedShare {
    job: Arc<BlockTemplate>,
    extranonce2: Vec<u8>,
    nonce: u32,
    record: ShareRecord,
    block_hex: Option<String>,
}

pub struct JobManager {
    options: JobManagerOptions,
    total_rounds: usize,
    round: Mutex<RoundState>,
    jobs: RwLock<JobTable>,
    events: broadcast::Sender<PoolEvent>,
}

impl JobManager {
    pub fn new(prover: SigmaProver, options: JobManagerOptions) -> Self {
        let total_rounds = prover.total_rounds();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            options,
            total_rounds,
            round: Mutex::new(RoundState {
                prover,
                randomness: None,
                bundle: ProofBundle::new(total_rounds),
                job_counter: JobCounter::default(),
                latest_upstream: None,
                state: ProtocolState::Uninitialized,
            }),
            jobs: RwLock::new(JobTable::default()),
            events,
        }
    }

    /// Construct and block until the round-0 randomness arrives.
    pub async fn start(
        prover: SigmaProver,
        options: JobManagerOptions,
        randomness: RandomnessReceiver,
    ) -> PoolResult<Self> {
        let manager = Self::new(prover, options);
        manager.await_randomness(randomness).await?;
        Ok(manager)
    }

    pub async fn await_randomness(&self, receiver: RandomnessReceiver) -> PoolResult<()> {
        self.set_state(ProtocolState::AwaitingRandomness)?;
        info!(
            timeout_ms = self.options.randomness_timeout.as_millis() as u64,
            "waiting for challenge randomness"
        );
        let randomness = receiver.wait(self.options.randomness_timeout).await?;
        self.activate(randomness)
    }

    /// Seed round 0 and enter `Active`.
    pub fn activate(&self, randomness: ChallengeRandomness) -> PoolResult<()> {
        let mut round = self.round.lock()?;
        match round.state {
            ProtocolState::Uninitialized | ProtocolState::AwaitingRandomness => {}
            other => return Err(ProtocolError::NotActive(other.to_string()).into()),
        }
        round.randomness = Some(randomness);
        round.state = ProtocolState::Active { round: 0 };
        info!(randomness = %randomness.to_hex(), rounds = self.total_rounds, "sigma protocol active");
        Ok(())
    }

    fn set_state(&self, state: ProtocolState) -> PoolResult<()> {
        self.round.lock()?.state = state;
        Ok(())
    }

    /// Returns true when `upstream` is a new block and the job table was
    /// replaced. A new block that shows up after the current round's response
    /// is already bound is kept for the next rotation and reported as a Sigma
    /// error.
    pub fn process_template(&self, upstream: UpstreamTemplate) -> PoolResult<bool> {
        let mut state = self.round.lock()?;
        let round = active_round(&state)?;

        if let Some(latest) = &state.latest_upstream {
            if latest.previous_block_hash == upstream.previous_block_hash {
                return Ok(false);
            }
            if upstream.height < latest.height {
                debug!(
                    height = upstream.height,
                    current_height = latest.height,
                    "ignoring stale block template"
                );
                return Ok(false);
            }
        }

        // The prover runs last in the build, so a refused nonce means the
        // template itself parsed and is safe to keep for the next round.
        let template = match self.build_template(&mut state, round, upstream.clone()) {
            Ok(template) => template,
            Err(PoolError::Sigma(e @ SigmaError::NonceAlreadyUsed(_))) => {
                warn!(round, "new block deferred until the round advances");
                state.latest_upstream = Some(upstream);
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };
        state.latest_upstream = Some(upstream);
        let params = self.install(template, false)?;
        info!(job_id = %params.job_id, round, "new block template");
        let _ = self.events.send(PoolEvent::NewBlock(params));
        Ok(true)
    }

    /// Rebuild the current job under a fresh job id, without waiting on upstream.
    pub fn get_rotated_job_params(&self) -> PoolResult<JobParams> {
        let mut state = self.round.lock()?;
        let round = active_round(&state)?;
        let upstream = match self.current_job()? {
            Some(job) => job.upstream.clone(),
            None => state
                .latest_upstream
                .clone()
                .ok_or(ProtocolError::NoTemplate)?,
        };
        let template = self.build_template(&mut state, round, upstream)?;
        let params = self.install(template, false)?;
        debug!(job_id = %params.job_id, round, "rotated job");
        let _ = self.events.send(PoolEvent::UpdatedBlock(params.clone()));
        Ok(params)
    }

    pub fn process_share(&self, share: &ShareSubmission) -> PoolResult<ShareOutcome> {
        let result = self.check_share(share).and_then(|checked| self.accept_share(checked));
        match &result {
            Ok(outcome) => {
                let _ = self.events.send(PoolEvent::Share {
                    record: Box::new(outcome.record.clone()),
                    block_hex: outcome.block_hex.clone(),
                });
            }
            Err(PoolError::Share(e)) => {
                debug!(job_id = %share.job_id, code = e.code(), error = %e, "share rejected");
                let _ = self.events.send(PoolEvent::ShareRejected(ShareRejection {
                    job_id: share.job_id.clone(),
                    worker: share.worker.clone(),
                    ip: share.ip.clone(),
                    difficulty: share.difficulty,
                    code: e.code(),
                    message: e.to_string(),
                }));
            }
            Err(e) => warn!(job_id = %share.job_id, error = %e, "share not processed"),
        }
        result
    }

    /// Validation steps 1 to 9. Runs without the round lock.
    fn check_share(&self, share: &ShareSubmission) -> PoolResult<CheckedShare> {
        if share.extranonce2.len() != self.options.extranonce2_size * 2 {
            return Err(ShareError::IncorrectExtranonce2Size.into());
        }
        let extranonce2 = hex::decode(&share.extranonce2)
            .map_err(|_| ShareError::MalformedField("extranonce2"))?;

        let job = {
            let table = self.jobs.read()?;
            table
                .jobs
                .get(&share.job_id)
                .or_else(|| table.retired.get(&share.job_id))
                .cloned()
                .ok_or_else(|| ShareError::JobNotFound(share.job_id.clone()))?
        };

        if share.ntime.len() != 8 {
            return Err(ShareError::IncorrectNtimeSize.into());
        }
        let ntime = u32_from_hex(&share.ntime).ok_or(ShareError::MalformedField("ntime"))?;
        if ntime < job.upstream.curtime || ntime as i64 > unix_now() + MAX_NTIME_DRIFT_SECS {
            return Err(ShareError::NtimeOutOfRange.into());
        }

        if share.nonce.len() != 8 {
            return Err(ShareError::IncorrectNonceSize.into());
        }
        let nonce = u32_from_hex(&share.nonce).ok_or(ShareError::MalformedField("nonce"))?;

        // The response blocks record the marker, so a coinbase mined with any
        // other extranonce1 could not be rebuilt from the bundle.
        let extranonce1 = hex::decode(&share.extranonce1)
            .map_err(|_| ShareError::MalformedField("extranonce1"))?;
        if extranonce1 != self.options.context.marker {
            return Err(ShareError::IncorrectExtranonce1.into());
        }

        if !job.register_submit(&share.extranonce1, &share.extranonce2, &share.ntime, &share.nonce) {
            return Err(ShareError::Duplicate.into());
        }

        let coinbase = job.serialize_coinbase(&extranonce1, &extranonce2);
        let coinbase_hash = if self.options.coinbase_single_sha256 {
            sha256(&coinbase)
        } else {
            sha256d(&coinbase)
        };
        let merkle_root = reversed32(&job.merkle_tree.with_first(coinbase_hash));
        let header = job.serialize_header(&merkle_root, ntime, nonce);
        let header_hash = sha256d(&header);
        let header_value = Target::from_le_bytes(&header_hash);

        let multiplier = self.options.share_multiplier;
        let share_diff = share_difficulty(&header_value, multiplier);
        let block_diff_adjusted = job.difficulty * multiplier;

        let mut block_hex = None;
        let mut block_hash = None;
        let mut block_hash_invalid = None;
        let credited = if header_value <= job.target {
            block_hex = Some(hex::encode(job.serialize_block(&header, &coinbase)));
            block_hash = Some(hex::encode(reversed32(&header_hash)));
            share.difficulty
        } else {
            if self.options.emit_invalid_block_hashes {
                block_hash_invalid = Some(hex::encode(reversed32(&header_hash)));
            }
            evaluate_share_difficulty(share_diff, share.difficulty, share.previous_difficulty)?
        };

        let record = ShareRecord {
            job_id: share.job_id.clone(),
            worker: share.worker.clone(),
            ip: share.ip.clone(),
            port: share.port,
            height: job.upstream.height,
            block_reward: job.upstream.coinbase_value,
            difficulty: credited,
            share_diff: (share_diff * 1e8).round() / 1e8,
            block_diff: block_diff_adjusted,
            block_diff_actual: job.difficulty,
            block_hash,
            block_hash_invalid,
            round: job.round,
            challenge: hex::encode(&job.challenge),
            challenge_hash: hex::encode(job.challenge_hash),
            sigma_response: hex::encode(job.sigma_response),
            nonce: share.nonce.clone(),
            extranonce2: share.extranonce2.clone(),
            block_contents: job.block_contents(),
            coinbase: hex::encode(&coinbase),
            coinbase_hash: hex::encode(coinbase_hash),
            merkle_root: hex::encode(merkle_root),
            header: hex::encode(header),
            header_hash: hex::encode(header_hash),
        };

        Ok(CheckedShare {
            job,
            extranonce2,
            nonce,
            record,
            block_hex,
        })
    }

    /// Steps 10 to 12 under the round lock.
    fn accept_share(&self, checked: CheckedShare) -> PoolResult<ShareOutcome> {
        let CheckedShare {
            job,
            extranonce2,
            nonce,
            record,
            block_hex,
        } = checked;

        let mut state = self.round.lock()?;
        let round = match state.state {
            ProtocolState::Active { round } => round,
            ProtocolState::Complete => {
                return Err(SigmaError::RoundsExhausted(self.total_rounds).into());
            }
            other => return Err(ProtocolError::NotActive(other.to_string()).into()),
        };
        // Another share already advanced the round this job was built for.
        if job.round != round {
            return Err(ShareError::JobNotFound(job.job_id.clone()).into());
        }

        state.bundle.push(ResponseBlock {
            part0: job.generation_transaction.part0.clone(),
            marker: job.marker(),
            extranonce2,
            part1: job.generation_transaction.part1.clone(),
            nonce,
            bits: job.bits,
            curtime: job.upstream.curtime,
            previous_block_hash: job.prev_hash,
            version: job.upstream.version,
        })?;
        let randomness = state
            .randomness
            .as_mut()
            .ok_or_else(|| ProtocolError::NotActive("randomness missing".to_string()))?;
        randomness.increment();
        let randomness_hex = randomness.to_hex();

        let next_round = round + 1;
        let mut next_job = None;
        if next_round < self.total_rounds {
            state.prover.update_round(next_round)?;
            state.state = ProtocolState::Active { round: next_round };
            info!(round = next_round, randomness = %randomness_hex, "sigma round advanced");
            let _ = self.events.send(PoolEvent::RoundAdvanced {
                round: next_round,
                randomness: randomness_hex,
            });

            let upstream = state
                .latest_upstream
                .clone()
                .unwrap_or_else(|| job.upstream.clone());
            let template = match self.build_template(&mut state, next_round, upstream) {
                Ok(template) => template,
                // The response is already in the bundle; stay on the block
                // this share was mined against.
                Err(e) => {
                    warn!(round = next_round, error = %e, "latest template unusable, reusing current block");
                    state.latest_upstream = Some(job.upstream.clone());
                    self.build_template(&mut state, next_round, job.upstream.clone())?
                }
            };
            let params = self.install(template, true)?;
            let _ = self.events.send(PoolEvent::UpdatedBlock(params.clone()));
            next_job = Some(params);
        } else {
            state.state = ProtocolState::Complete;
            info!(rounds = self.total_rounds, "proof bundle complete");
            let path = self.options.proof_path.clone();
            let persisted = match &path {
                Some(path) => match state.bundle.persist(path) {
                    Ok(()) => Some(path.clone()),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to persist proof bundle");
                        None
                    }
                },
                None => None,
            };
            let _ = self.events.send(PoolEvent::ProofCompleted {
                rounds: self.total_rounds,
                path: persisted,
            });
        }

        if let Some(hash) = &record.block_hash {
            info!(job_id = %record.job_id, block_hash = %hash, height = record.height, "block candidate found");
        }

        Ok(ShareOutcome {
            record,
            block_hex,
            next_job,
        })
    }

    fn build_template(
        &self,
        state: &mut RoundState,
        round: usize,
        upstream: UpstreamTemplate,
    ) -> PoolResult<Arc<BlockTemplate>> {
        let randomness = state
            .randomness
            .ok_or_else(|| ProtocolError::NotActive(state.state.to_string()))?;
        let job_id = state.job_counter.next();
        let template = BlockTemplate::new(
            job_id,
            round,
            upstream,
            &self.options.context,
            &mut state.prover,
            &randomness,
        )?;
        Ok(Arc::new(template))
    }

    /// Replace the whole job table with `template`. With `retire`, the
    /// replaced jobs stay reachable for duplicate detection.
    fn install(&self, template: Arc<BlockTemplate>, retire: bool) -> PoolResult<JobParams> {
        let params = template.job_params().clone();
        let mut table = self.jobs.write()?;
        if retire {
            table.retired = std::mem::take(&mut table.jobs);
        } else {
            table.jobs.clear();
            table.retired.clear();
        }
        table.jobs.insert(template.job_id.clone(), Arc::clone(&template));
        table.current = Some(template);
        Ok(params)
    }

    pub fn current_job(&self) -> PoolResult<Option<Arc<BlockTemplate>>> {
        Ok(self.jobs.read()?.current.clone())
    }

    pub fn get_job_params(&self) -> PoolResult<Option<JobParams>> {
        Ok(self.current_job()?.map(|job| job.job_params().clone()))
    }

    pub fn commitments(&self) -> PoolResult<CommitmentSet> {
        Ok(self.round.lock()?.prover.commitments()?)
    }

    pub fn proof_bundle(&self) -> PoolResult<ProofBundle> {
        Ok(self.round.lock()?.bundle.clone())
    }

    /// Write the bundle if it is complete and has not been written yet.
    pub fn persist_proof(&self, path: &std::path::Path) -> PoolResult<()> {
        self.round.lock()?.bundle.persist(path)
    }

    pub fn state(&self) -> PoolResult<ProtocolState> {
        Ok(self.round.lock()?.state)
    }

    pub fn randomness(&self) -> PoolResult<Option<ChallengeRandomness>> {
        Ok(self.round.lock()?.randomness)
    }

    pub fn total_rounds(&self) -> usize {
        self.total_rounds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Every miner is handed the same extranonce1: the marker that the
    /// response blocks carry.
    pub fn next_extranonce1(&self) -> String {
        hex::encode(self.options.context.marker)
    }

    pub fn extranonce2_size(&self) -> usize {
        self.options.extranonce2_size
    }
}

fn active_round(state: &RoundState) -> PoolResult<usize> {
    match state.state {
        ProtocolState::Active { round } => Ok(round),
        ProtocolState::Complete => Err(SigmaError::RoundsExhausted(state.bundle.total_rounds()).into()),
        other => Err(ProtocolError::NotActive(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::RewardType;

    #[test]
    fn job_counter_skips_multiples_of_ffff() {
        let mut counter = JobCounter::default();
        assert_eq!(counter.next(), "1");
        assert_eq!(counter.next(), "2");
        counter.counter = 0xfffe;
        assert_eq!(counter.next(), "1");
        assert_eq!(counter.current(), "1");
    }

    #[test]
    fn difficulty_threshold_is_ninety_nine_percent() {
        assert_eq!(evaluate_share_difficulty(0.99, 1.0, None), Ok(1.0));
        assert_eq!(evaluate_share_difficulty(5.0, 1.0, None), Ok(1.0));
        assert_eq!(
            evaluate_share_difficulty(0.989, 1.0, None),
            Err(ShareError::LowDifficulty(0.989))
        );
    }

    #[test]
    fn previous_difficulty_credits_pre_retarget_shares() {
        assert_eq!(evaluate_share_difficulty(9.0, 16.0, Some(8.0)), Ok(8.0));
        assert_eq!(
            evaluate_share_difficulty(7.0, 16.0, Some(8.0)),
            Err(ShareError::LowDifficulty(7.0))
        );
    }

    #[test]
    fn options_split_placeholder_into_extranonce_sizes() {
        let config = Config {
            sigma_sk_hex: "11".repeat(32),
            pool_address_script: "51".into(),
            ..Config::default()
        };
        let options = JobManagerOptions::from_config(&config).unwrap();
        assert_eq!(options.extranonce2_size, 1);
        assert_eq!(options.context.marker, [0xde, 0xad, 0xc0, 0xde]);
        assert_eq!(options.context.reward, RewardType::Pow);
    }

    #[test]
    fn state_display() {
        assert_eq!(ProtocolState::Active { round: 2 }.to_string(), "active (round 2)");
        let json = serde_json::to_value(ProtocolState::Active { round: 2 }).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["round"], 2);
    }
}
