use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use crate::metrics::ErrorType;

pub struct PrometheusMetrics {
    registry: Registry,

    // Counters
    templates_processed: Counter,
    jobs_rotated: Counter,
    shares_accepted: Counter,
    shares_rejected: Counter,
    blocks_found: Counter,
    rpc_errors: Counter,
    protocol_errors: Counter,
    persistence_errors: Counter,

    // Gauges
    uptime_seconds: Gauge<i64>,
    consecutive_failures: Gauge<i64>,
    current_round: Gauge<i64>,
    proof_complete: Gauge<i64>,

    // Histograms
    share_difficulty: Histogram,
    rpc_latency_ms: Histogram,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let templates_processed = Counter::default();
        let jobs_rotated = Counter::default();
        let shares_accepted = Counter::default();
        let shares_rejected = Counter::default();
        let blocks_found = Counter::default();
        let rpc_errors = Counter::default();
        let protocol_errors = Counter::default();
        let persistence_errors = Counter::default();

        let uptime_seconds = Gauge::default();
        let consecutive_failures = Gauge::default();
        let current_round = Gauge::default();
        let proof_complete = Gauge::default();

        let share_difficulty = Histogram::new(
            [0.001, 0.01, 0.1, 1.0, 10.0, 100.0, 1000.0, 10000.0].into_iter()
        );
        let rpc_latency_ms = Histogram::new(
            [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0].into_iter()
        );

        registry.register(
            "sigma_pool_templates_processed",
            "New upstream blocks turned into jobs",
            templates_processed.clone(),
        );
        registry.register(
            "sigma_pool_jobs_rotated",
            "Jobs rebuilt without a new upstream block",
            jobs_rotated.clone(),
        );
        registry.register(
            "sigma_pool_shares_accepted",
            "Accepted shares",
            shares_accepted.clone(),
        );
        registry.register(
            "sigma_pool_shares_rejected",
            "Rejected shares",
            shares_rejected.clone(),
        );
        registry.register(
            "sigma_pool_blocks_found",
            "Shares that met the network target",
            blocks_found.clone(),
        );
        registry.register(
            "sigma_pool_rpc_errors",
            "Failed upstream RPC calls",
            rpc_errors.clone(),
        );
        registry.register(
            "sigma_pool_protocol_errors",
            "Sigma protocol and state errors",
            protocol_errors.clone(),
        );
        registry.register(
            "sigma_pool_persistence_errors",
            "Failed proof bundle writes",
            persistence_errors.clone(),
        );
        registry.register(
            "sigma_pool_uptime_seconds",
            "Pool uptime in seconds",
            uptime_seconds.clone(),
        );
        registry.register(
            "sigma_pool_consecutive_failures",
            "Consecutive upstream RPC failures",
            consecutive_failures.clone(),
        );
        registry.register(
            "sigma_pool_current_round",
            "Current Sigma protocol round",
            current_round.clone(),
        );
        registry.register(
            "sigma_pool_proof_complete",
            "1 once the proof bundle holds every round",
            proof_complete.clone(),
        );
        registry.register(
            "sigma_pool_share_difficulty",
            "Difficulty of accepted shares",
            share_difficulty.clone(),
        );
        registry.register(
            "sigma_pool_rpc_latency_ms",
            "Upstream RPC latency in milliseconds",
            rpc_latency_ms.clone(),
        );

        Self {
            registry,
            templates_processed,
            jobs_rotated,
            shares_accepted,
            shares_rejected,
            blocks_found,
            rpc_errors,
            protocol_errors,
            persistence_errors,
            uptime_seconds,
            consecutive_failures,
            current_round,
            proof_complete,
            share_difficulty,
            rpc_latency_ms,
        }
    }

    pub fn update_from_metrics(&self, metrics: &crate::metrics::Metrics) {
        self.uptime_seconds.set(metrics.uptime_seconds as i64);
        self.consecutive_failures.set(metrics.consecutive_failures as i64);
        self.current_round.set(metrics.current_round as i64);
        self.proof_complete.set(metrics.proof_complete as i64);
    }

    pub fn record_template(&self, rotated: bool) {
        if rotated {
            self.jobs_rotated.inc();
        } else {
            self.templates_processed.inc();
        }
    }

    pub fn record_share(&self, difficulty: f64, block: bool) {
        self.shares_accepted.inc();
        if block {
            self.blocks_found.inc();
        }
        self.share_difficulty.observe(difficulty);
    }

    pub fn record_rejected_share(&self) {
        self.shares_rejected.inc();
    }

    pub fn record_error(&self, error_type: ErrorType) {
        match error_type {
            ErrorType::Rpc => self.rpc_errors.inc(),
            ErrorType::Protocol => self.protocol_errors.inc(),
            ErrorType::Persistence => self.persistence_errors.inc(),
        };
    }

    pub fn record_rpc_latency(&self, latency_ms: f64) {
        self.rpc_latency_ms.observe(latency_ms);
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
