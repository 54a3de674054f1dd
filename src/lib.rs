pub mod types;
pub mod util;
pub mod target;
pub mod merkle;
pub mod sigma;
pub mod coinbase;
pub mod block_template;
pub mod randomness;
pub mod proof;
pub mod job_manager;
pub mod upstream;
pub mod config;
pub mod error;
pub mod metrics;
pub mod prometheus_metrics;
pub mod error_handling;
pub mod health;
pub mod server;
