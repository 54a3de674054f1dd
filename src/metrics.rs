use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    // Work distribution
    pub templates_processed: u64,
    pub jobs_rotated: u64,

    // Shares
    pub shares_accepted: u64,
    pub blocks_found: u64,
    pub rejected_malformed: u64,
    pub rejected_unknown_job: u64,
    pub rejected_duplicate: u64,
    pub rejected_low_difficulty: u64,

    // Sigma rounds
    pub current_round: u64,
    pub rounds_completed: u64,
    pub proof_complete: bool,

    // Errors
    pub rpc_errors: u64,
    pub protocol_errors: u64,
    pub persistence_errors: u64,

    // Health
    pub uptime_seconds: u64,
    pub last_accepted_share: Option<u64>,
    pub consecutive_failures: u32,
    pub shares_per_second: f64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    templates_processed: AtomicU64,
    jobs_rotated: AtomicU64,
    shares_accepted: AtomicU64,
    blocks_found: AtomicU64,
    rejected_malformed: AtomicU64,
    rejected_unknown_job: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_low_difficulty: AtomicU64,
    current_round: AtomicU64,
    rounds_completed: AtomicU64,
    proof_complete: AtomicU32,
    rpc_errors: AtomicU64,
    protocol_errors: AtomicU64,
    persistence_errors: AtomicU64,
    // Consecutive upstream failures; reset by any successful RPC call.
    consecutive_failures: AtomicU32,

    start_time: Instant,
    last_share_time: Mutex<Option<Instant>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            templates_processed: AtomicU64::new(0),
            jobs_rotated: AtomicU64::new(0),
            shares_accepted: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
            rejected_malformed: AtomicU64::new(0),
            rejected_unknown_job: AtomicU64::new(0),
            rejected_duplicate: AtomicU64::new(0),
            rejected_low_difficulty: AtomicU64::new(0),
            current_round: AtomicU64::new(0),
            rounds_completed: AtomicU64::new(0),
            proof_complete: AtomicU32::new(0),
            rpc_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            start_time: Instant::now(),
            last_share_time: Mutex::new(None),
        }
    }

    pub fn record_template(&self, rotated: bool) {
        if rotated {
            self.jobs_rotated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.templates_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_share_accepted(&self, block: bool) {
        self.shares_accepted.fetch_add(1, Ordering::Relaxed);
        if block {
            self.blocks_found.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last_share_time.lock() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_share_rejected(&self, code: u32) {
        let counter = match code {
            21 => &self.rejected_unknown_job,
            22 => &self.rejected_duplicate,
            23 => &self.rejected_low_difficulty,
            _ => &self.rejected_malformed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round(&self, next_round: u64) {
        self.current_round.store(next_round, Ordering::Relaxed);
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proof_complete(&self) {
        self.proof_complete.store(1, Ordering::Relaxed);
    }

    pub fn record_rpc_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_error(&self, error_type: ErrorType) {
        match error_type {
            ErrorType::Rpc => {
                self.rpc_errors.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            ErrorType::Protocol => {
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
            }
            ErrorType::Persistence => {
                self.persistence_errors.fetch_add(1, Ordering::Relaxed);
            }
        };
    }

    pub fn get_metrics(&self) -> Metrics {
        let shares_accepted = self.shares_accepted.load(Ordering::Relaxed);
        let uptime_seconds = self.start_time.elapsed().as_secs();

        let last_accepted_share = if let Ok(last) = self.last_share_time.lock() {
            last.map(|time| time.duration_since(self.start_time).as_secs())
        } else {
            None
        };

        let shares_per_second = if uptime_seconds > 0 {
            shares_accepted as f64 / uptime_seconds as f64
        } else {
            0.0
        };

        Metrics {
            templates_processed: self.templates_processed.load(Ordering::Relaxed),
            jobs_rotated: self.jobs_rotated.load(Ordering::Relaxed),
            shares_accepted,
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            rejected_malformed: self.rejected_malformed.load(Ordering::Relaxed),
            rejected_unknown_job: self.rejected_unknown_job.load(Ordering::Relaxed),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::Relaxed),
            rejected_low_difficulty: self.rejected_low_difficulty.load(Ordering::Relaxed),
            current_round: self.current_round.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            proof_complete: self.proof_complete.load(Ordering::Relaxed) == 1,
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            uptime_seconds,
            last_accepted_share,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            shares_per_second,
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);

        if consecutive_failures >= 10 {
            HealthStatus::Critical
        } else if consecutive_failures >= 5 {
            HealthStatus::Unhealthy
        } else if consecutive_failures >= 2 || self.persistence_errors.load(Ordering::Relaxed) > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Rpc,
    Protocol,
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_bucketed_by_code() {
        let m = MetricsCollector::new();
        m.record_share_rejected(20);
        m.record_share_rejected(21);
        m.record_share_rejected(22);
        m.record_share_rejected(22);
        m.record_share_rejected(23);
        let snap = m.get_metrics();
        assert_eq!(snap.rejected_malformed, 1);
        assert_eq!(snap.rejected_unknown_job, 1);
        assert_eq!(snap.rejected_duplicate, 2);
        assert_eq!(snap.rejected_low_difficulty, 1);
    }

    #[test]
    fn health_degrades_with_rpc_failures() {
        let m = MetricsCollector::new();
        assert_eq!(m.get_health_status(), HealthStatus::Healthy);
        for _ in 0..5 {
            m.record_error(ErrorType::Rpc);
        }
        assert_eq!(m.get_health_status(), HealthStatus::Unhealthy);
        m.record_rpc_success();
        assert_eq!(m.get_health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn accepted_shares_and_rounds() {
        let m = MetricsCollector::new();
        m.record_share_accepted(true);
        m.record_share_accepted(false);
        m.record_round(2);
        let snap = m.get_metrics();
        assert_eq!(snap.shares_accepted, 2);
        assert_eq!(snap.blocks_found, 1);
        assert_eq!(snap.current_round, 2);
        assert_eq!(snap.rounds_completed, 1);
        assert!(snap.last_accepted_share.is_some());
    }
}
