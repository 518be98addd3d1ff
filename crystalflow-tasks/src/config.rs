//! Command-line and environment configuration.

use clap::Parser;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// CrystalFlow server: HTTP API plus the cpu and gpu worker pools.
#[derive(Debug, Clone, Parser)]
#[command(name = "crystalflow")]
#[command(about = "Durable inference and lookup workflows behind an HTTP API", long_about = None)]
#[command(version)]
pub struct Config {
    /// Listen address
    #[arg(short, long, env = "CRYSTALFLOW_LISTEN_ADDR", default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,

    /// Concurrent tasks on the gpu-queue pool
    #[arg(long, env = "CRYSTALFLOW_GPU_CONCURRENCY", default_value = "8")]
    pub gpu_concurrency: NonZeroUsize,

    /// Concurrent tasks on the cpu-queue pool
    #[arg(long, env = "CRYSTALFLOW_CPU_CONCURRENCY", default_value = "4")]
    pub cpu_concurrency: NonZeroUsize,

    /// Directory relative model paths resolve against
    #[arg(long, env = "CRYSTALFLOW_MODEL_ROOT", default_value = ".")]
    pub model_root: PathBuf,

    /// Directory persisted samples are written under
    #[arg(long, env = "CRYSTALFLOW_OUTPUT_ROOT", default_value = ".")]
    pub output_root: PathBuf,

    /// Idle poll interval of workers and result waiters, in milliseconds
    #[arg(long, env = "CRYSTALFLOW_POLL_INTERVAL_MS", default_value = "200")]
    pub poll_interval_ms: u64,

    /// How long GET /get-result waits for a run to finish, in seconds
    #[arg(long, env = "CRYSTALFLOW_RESULT_TIMEOUT_SECS", default_value = "300")]
    pub result_timeout_secs: u64,

    /// Simulated latency of molecule lookups, in milliseconds
    #[arg(long, env = "CRYSTALFLOW_LOOKUP_LATENCY_MS", default_value = "5000")]
    pub lookup_latency_ms: u64,

    /// Log level
    #[arg(long, env = "CRYSTALFLOW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "CRYSTALFLOW_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn lookup_latency(&self) -> Duration {
        Duration::from_millis(self.lookup_latency_ms)
    }
}
