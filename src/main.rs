use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sigma_pool::config::Config;
use sigma_pool::error::{PoolError, ProtocolError};
use sigma_pool::error_handling::{ErrorHandler, RateLimiter};
use sigma_pool::health::HealthChecker;
use sigma_pool::job_manager::{JobManager, JobManagerOptions, ProtocolState};
use sigma_pool::metrics::{ErrorType, MetricsCollector};
use sigma_pool::prometheus_metrics::PrometheusMetrics;
use sigma_pool::randomness;
use sigma_pool::server::{ServerState, StatusServer};
use sigma_pool::sigma::SigmaProver;
use sigma_pool::types::PoolEvent;
use sigma_pool::upstream::DaemonClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("sigma_pool={}", config.log_level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    tracing::info!(
        rounds = config.total_rounds,
        daemon = %config.daemon_url,
        proof_path = %config.proof_path.display(),
        "starting sigma pool"
    );

    let prover = SigmaProver::from_hex(&config.sigma_sk_hex, config.total_rounds)?;
    // The verifier must register these before the challenge is initiated.
    let commitments = serde_json::to_string(&prover.commitments()?)?;
    tracing::info!(%commitments, "sigma commitments");

    let metrics = Arc::new(MetricsCollector::new());
    let prometheus = Arc::new(PrometheusMetrics::new());
    let client = Arc::new(DaemonClient::new(
        config.daemon_url.clone(),
        config.daemon_user.clone(),
        config.daemon_password.clone(),
    )?);
    let error_handler = Arc::new(
        ErrorHandler::new(Arc::clone(&metrics))
            .with_retry_config(config.retry_config())
            .with_circuit_breaker(config.circuit_breaker_threshold, config.circuit_breaker_recovery()),
    );

    let (sender, receiver) = randomness::channel();
    tokio::spawn(randomness::watch_file(
        config.randomness_path.clone(),
        sender,
        config.retry_config(),
        config.randomness_timeout(),
    ));
    let options = JobManagerOptions::from_config(&config)?;
    let manager = Arc::new(
        JobManager::start(prover, options, receiver)
            .await
            .context("waiting for challenge randomness")?,
    );

    tokio::spawn(consume_events(
        manager.subscribe(),
        Arc::clone(&metrics),
        Arc::clone(&prometheus),
        Arc::clone(&client),
        Arc::clone(&error_handler),
    ));

    let server_state = Arc::new(ServerState {
        health_checker: HealthChecker::new(Arc::clone(&metrics), Arc::clone(&manager), config.clone()),
        manager: Arc::clone(&manager),
        metrics: Arc::clone(&metrics),
        prometheus: Arc::clone(&prometheus),
        rate_limiter: RateLimiter::new(config.rate_limit_per_second, config.rate_limit_per_second as f64),
        error_handler: Some(Arc::clone(&error_handler)),
    });
    let status_port = config.status_port;
    tokio::spawn(async move {
        if let Err(e) = StatusServer::new(server_state, status_port).start().await {
            tracing::error!(error = %e, "status server stopped");
        }
    });

    let mut poll = tokio::time::interval(config.poll_interval());
    let mut last_job = Instant::now();
    loop {
        poll.tick().await;
        if manager.state()? == ProtocolState::Complete {
            break;
        }

        let started = Instant::now();
        match error_handler.execute_with_retry(|| client.get_block_template()).await {
            Ok(template) => {
                prometheus.record_rpc_latency(started.elapsed().as_secs_f64() * 1000.0);
                match manager.process_template(template) {
                    Ok(true) => last_job = Instant::now(),
                    Ok(false) => {}
                    Err(e) => {
                        metrics.record_error(ErrorType::Protocol);
                        prometheus.record_error(ErrorType::Protocol);
                        tracing::debug!(error = %e, "template not applied");
                    }
                }
            }
            Err(e) => {
                prometheus.record_error(ErrorType::Rpc);
                tracing::warn!(error = %e, "getblocktemplate failed");
            }
        }

        if last_job.elapsed() >= config.rebroadcast_interval() {
            match manager.get_rotated_job_params() {
                Ok(params) => {
                    tracing::debug!(job_id = %params.job_id, "job rebroadcast");
                    last_job = Instant::now();
                }
                Err(PoolError::Protocol(ProtocolError::NoTemplate)) => {}
                Err(e) => tracing::warn!(error = %e, "job rotation failed"),
            }
        }
    }

    if !manager.proof_bundle()?.is_persisted() {
        manager
            .persist_proof(&config.proof_path)
            .context("writing proof bundle")?;
    }
    tracing::info!(path = %config.proof_path.display(), "all rounds complete, shutting down");
    Ok(())
}

async fn consume_events(
    mut events: broadcast::Receiver<PoolEvent>,
    metrics: Arc<MetricsCollector>,
    prometheus: Arc<PrometheusMetrics>,
    client: Arc<DaemonClient>,
    error_handler: Arc<ErrorHandler>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event consumer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            PoolEvent::NewBlock(params) => {
                metrics.record_template(false);
                prometheus.record_template(false);
                tracing::info!(job_id = %params.job_id, "broadcasting new job");
            }
            PoolEvent::UpdatedBlock(_) => {
                metrics.record_template(true);
                prometheus.record_template(true);
            }
            PoolEvent::Share { record, block_hex } => {
                metrics.record_share_accepted(block_hex.is_some());
                prometheus.record_share(record.difficulty, block_hex.is_some());
                if let Some(block_hex) = block_hex {
                    match error_handler.execute_with_retry(|| client.submit_block(&block_hex)).await {
                        Ok(None) => tracing::info!(height = record.height, hash = ?record.block_hash, "block accepted by daemon"),
                        Ok(Some(reason)) => tracing::warn!(height = record.height, %reason, "block rejected by daemon"),
                        Err(e) => {
                            prometheus.record_error(ErrorType::Rpc);
                            tracing::error!(height = record.height, error = %e, "submitblock failed");
                        }
                    }
                }
            }
            PoolEvent::ShareRejected(rejection) => {
                metrics.record_share_rejected(rejection.code);
                prometheus.record_rejected_share();
            }
            PoolEvent::RoundAdvanced { round, .. } => metrics.record_round(round as u64),
            PoolEvent::ProofCompleted { rounds, path } => {
                metrics.record_round(rounds as u64);
                metrics.record_proof_complete();
                if path.is_none() {
                    metrics.record_error(ErrorType::Persistence);
                    prometheus.record_error(ErrorType::Persistence);
                }
                tracing::info!(rounds, "proof bundle ready");
            }
        }
    }
}
