use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use archreview_core::Region;

/// Name of the SQLite file inside `STATE_DIR`.
pub const DATABASE_FILE: &str = "archreview-state.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown storage backend '{}' (expected sqlite or memory)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory holding the SQLite database. Defaults to the working directory.
    pub state_dir: PathBuf,
    pub storage_backend: StorageBackend,
    pub agent_url: String,
    /// Upper bound on one agent invocation.
    pub agent_timeout: Duration,
    /// How long a delivered work item stays hidden from other workers.
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    /// Delay before a failed work item is offered again.
    pub retry_delay: Duration,
    pub worker_concurrency: usize,
    pub worker_batch_size: usize,
    /// Idle wait between polls of an empty queue.
    pub worker_batch_window: Duration,
    pub reconcile_interval: Duration,
    /// Added to the agent timeout to decide when a claim is stale.
    pub stale_margin: Duration,
    /// Bearer token for operator endpoints. If unset, those endpoints are disabled.
    pub ops_auth_token: Option<String>,
    /// Region used when a submission omits one.
    pub default_region: Region,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or(&lookup, "PORT", 3000u16)?;

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let storage_backend = lookup("STORAGE_BACKEND")
            .map(|v| v.parse::<StorageBackend>())
            .transpose()
            .context("STORAGE_BACKEND is invalid")?
            .unwrap_or(StorageBackend::Sqlite);

        let agent_url = lookup("AGENT_URL")
            .filter(|v| !v.trim().is_empty())
            .context("AGENT_URL environment variable is required")?;
        if !(agent_url.starts_with("http://") || agent_url.starts_with("https://")) {
            bail!("AGENT_URL must be an http(s) URL, got '{}'", agent_url);
        }

        let default_region = match lookup("DEFAULT_REGION") {
            Some(raw) => Region::parse(&raw).context("DEFAULT_REGION is invalid")?,
            None => Region::parse("us-east-1").context("built-in default region")?,
        };

        let config = Config {
            port,
            state_dir,
            storage_backend,
            agent_url,
            agent_timeout: secs(&lookup, "AGENT_TIMEOUT_SECS", 900)?,
            visibility_timeout: secs(&lookup, "QUEUE_VISIBILITY_TIMEOUT_SECS", 960)?,
            max_receive_count: parse_or(&lookup, "QUEUE_MAX_RECEIVE_COUNT", 3u32)?,
            retry_delay: secs(&lookup, "QUEUE_RETRY_DELAY_SECS", 30)?,
            worker_concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", 4usize)?,
            worker_batch_size: parse_or(&lookup, "WORKER_BATCH_SIZE", 1usize)?,
            worker_batch_window: Duration::from_millis(parse_or(
                &lookup,
                "WORKER_BATCH_WINDOW_MS",
                5000u64,
            )?),
            reconcile_interval: secs(&lookup, "RECONCILE_INTERVAL_SECS", 60)?,
            stale_margin: secs(&lookup, "STALE_MARGIN_SECS", 60)?,
            ops_auth_token: parse_ops_auth_token(lookup("OPS_AUTH_TOKEN")),
            default_region,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check relationships between settings.
    pub fn validate(&self) -> Result<()> {
        if self.agent_timeout.is_zero() {
            bail!("AGENT_TIMEOUT_SECS must be positive");
        }
        if self.visibility_timeout < self.stale_after() {
            bail!(
                "QUEUE_VISIBILITY_TIMEOUT_SECS ({}s) must be at least AGENT_TIMEOUT_SECS + STALE_MARGIN_SECS ({}s)",
                self.visibility_timeout.as_secs(),
                self.stale_after().as_secs()
            );
        }
        if self.max_receive_count == 0 {
            bail!("QUEUE_MAX_RECEIVE_COUNT must be at least 1");
        }
        if self.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.worker_batch_size == 0 {
            bail!("WORKER_BATCH_SIZE must be at least 1");
        }
        if self.reconcile_interval.is_zero() {
            bail!("RECONCILE_INTERVAL_SECS must be positive");
        }
        Ok(())
    }

    /// Age after which an `IN_PROGRESS` claim is considered abandoned.
    pub fn stale_after(&self) -> Duration {
        self.agent_timeout + self.stale_margin
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILE)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number, got '{}'", key, raw)),
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default).map(Duration::from_secs)
}

/// Parse OPS_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or whitespace, so that an
/// empty token can never grant access.
pub fn parse_ops_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
