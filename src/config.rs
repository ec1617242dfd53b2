use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Scratch directory probed by `/readyz`; local stores usually live below it.
    pub storage_dir: String,
    pub database_url: String,
    pub sync_interval_secs: u64,
    pub verify_checksums: bool,
}

/// One-shot modes selected on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    pub migrate: bool,
    pub sync_once: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Template lifecycle orchestrator")]
pub struct Args {
    /// Host to bind to (overrides TEMPLATE_ORCH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TEMPLATE_ORCH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Scratch directory for readiness probes (overrides TEMPLATE_ORCH_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TEMPLATE_ORCH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds between reconciliation sweeps (overrides TEMPLATE_ORCH_SYNC_INTERVAL_SECS)
    #[arg(long)]
    pub sync_interval_secs: Option<u64>,

    /// Re-hash payloads while listing stores (overrides TEMPLATE_ORCH_VERIFY_CHECKSUMS)
    #[arg(long)]
    pub verify_checksums: Option<bool>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Sweep every image store once and exit
    #[arg(long)]
    pub sync_once: bool,
}

/// Read `key`, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run flags.
    pub fn from_env_and_args() -> Result<(Self, RunFlags)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("TEMPLATE_ORCH_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("TEMPLATE_ORCH_PORT", 3000u16)?;
        let env_storage =
            env::var("TEMPLATE_ORCH_STORAGE_DIR").unwrap_or_else(|_| "./data/stores".into());
        let env_db = env::var("TEMPLATE_ORCH_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/templates.db".into());
        let env_interval = env_or("TEMPLATE_ORCH_SYNC_INTERVAL_SECS", 300u64)?;
        let env_verify = env_or("TEMPLATE_ORCH_VERIFY_CHECKSUMS", false)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            sync_interval_secs: args.sync_interval_secs.unwrap_or(env_interval),
            verify_checksums: args.verify_checksums.unwrap_or(env_verify),
        };
        if cfg.sync_interval_secs == 0 {
            anyhow::bail!("sync interval must be at least one second");
        }

        let flags = RunFlags {
            migrate: args.migrate,
            sync_once: args.sync_once,
        };
        Ok((cfg, flags))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
