use std::sync::Arc;
use crate::config::Config;
use crate::job_manager::{JobManager, ProtocolState};
use crate::metrics::{HealthStatus, MetricsCollector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct DetailedStatus {
    pub health: String,
    pub uptime_seconds: u64,
    pub protocol: ProtocolState,
    pub total_rounds: usize,
    pub responses_collected: usize,
    pub proof_persisted: bool,
    pub current_job_id: Option<String>,
    pub shares: ShareCounts,
    pub error_counts: ErrorCounts,
    pub circuit_breaker_status: Option<String>,
    pub config_summary: ConfigSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShareCounts {
    pub accepted: u64,
    pub blocks_found: u64,
    pub rejected_malformed: u64,
    pub rejected_unknown_job: u64,
    pub rejected_duplicate: u64,
    pub rejected_low_difficulty: u64,
    pub shares_per_second: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub rpc_errors: u64,
    pub protocol_errors: u64,
    pub persistence_errors: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub daemon_url: String,
    pub total_rounds: usize,
    pub proof_path: String,
    pub reward_type: String,
    pub max_retries: u32,
    pub rate_limit_per_second: u32,
}

pub struct HealthChecker {
    metrics: Arc<MetricsCollector>,
    manager: Arc<JobManager>,
    config: Config,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(metrics: Arc<MetricsCollector>, manager: Arc<JobManager>, config: Config) -> Self {
        Self {
            metrics,
            manager,
            config,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_health(&self) -> HealthResponse {
        HealthResponse {
            status: self.metrics.get_health_status().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.metrics.get_health_status(), HealthStatus::Healthy)
    }

    pub fn get_detailed_status(&self, circuit_breaker_status: Option<String>) -> DetailedStatus {
        let metrics = self.metrics.get_metrics();
        // A poisoned lock is reported as an uninitialized protocol.
        let protocol = self.manager.state().unwrap_or(ProtocolState::Uninitialized);
        let (responses_collected, proof_persisted) = self
            .manager
            .proof_bundle()
            .map(|b| (b.len(), b.is_persisted()))
            .unwrap_or((0, false));
        let current_job_id = self
            .manager
            .get_job_params()
            .ok()
            .flatten()
            .map(|p| p.job_id);

        DetailedStatus {
            health: self.metrics.get_health_status().to_string(),
            uptime_seconds: metrics.uptime_seconds,
            protocol,
            total_rounds: self.manager.total_rounds(),
            responses_collected,
            proof_persisted,
            current_job_id,
            shares: ShareCounts {
                accepted: metrics.shares_accepted,
                blocks_found: metrics.blocks_found,
                rejected_malformed: metrics.rejected_malformed,
                rejected_unknown_job: metrics.rejected_unknown_job,
                rejected_duplicate: metrics.rejected_duplicate,
                rejected_low_difficulty: metrics.rejected_low_difficulty,
                shares_per_second: metrics.shares_per_second,
            },
            error_counts: ErrorCounts {
                rpc_errors: metrics.rpc_errors,
                protocol_errors: metrics.protocol_errors,
                persistence_errors: metrics.persistence_errors,
                consecutive_failures: metrics.consecutive_failures,
            },
            circuit_breaker_status,
            config_summary: ConfigSummary {
                daemon_url: self.config.daemon_url.clone(),
                total_rounds: self.config.total_rounds,
                proof_path: self.config.proof_path.display().to_string(),
                reward_type: format!("{:?}", self.config.reward_type).to_uppercase(),
                max_retries: self.config.max_retries,
                rate_limit_per_second: self.config.rate_limit_per_second,
            },
        }
    }
}
