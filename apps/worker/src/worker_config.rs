use std::env;
use std::time::Duration;

use tether_core::{AppError, AppResult};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub api_base_url: String,
    pub internal_shared_secret: String,
    pub execution_id: String,
    pub lock_name: String,
    pub holder_identity: String,
    pub lock_ttl_seconds: u32,
    pub batch_max_lines: usize,
    pub batch_flush_interval_ms: u64,
    pub program: String,
    pub arguments: Vec<String>,
}

impl WorkerConfig {
    pub fn load() -> AppResult<Self> {
        let api_base_url = env::var("TETHER_API_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3001".to_owned())
            .trim_end_matches('/')
            .to_owned();
        let internal_shared_secret = required_env("INTERNAL_SHARED_SECRET")?;
        let execution_id = optional_trimmed_env("EXECUTION_ID")
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lock_name = required_env("LOCK_NAME")?;
        let holder_identity = optional_trimmed_env("HOLDER_IDENTITY")
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));
        let lock_ttl_seconds = parse_env_u32("LOCK_TTL_SECONDS", 60)?;
        let batch_max_lines = parse_env_usize("BATCH_MAX_LINES", 100)?;
        let batch_flush_interval_ms = parse_env_u64("BATCH_FLUSH_INTERVAL_MS", 500)?;

        if lock_ttl_seconds < 3 {
            return Err(AppError::Validation(
                "LOCK_TTL_SECONDS must be at least 3".to_owned(),
            ));
        }

        if batch_max_lines == 0 {
            return Err(AppError::Validation(
                "BATCH_MAX_LINES must be greater than zero".to_owned(),
            ));
        }

        if batch_flush_interval_ms == 0 {
            return Err(AppError::Validation(
                "BATCH_FLUSH_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        let mut command = env::args().skip(1);
        let program = command
            .next()
            .ok_or_else(|| AppError::Validation("a command to run is required".to_owned()))?;

        Ok(Self {
            api_base_url,
            internal_shared_secret,
            execution_id,
            lock_name,
            holder_identity,
            lock_ttl_seconds,
            batch_max_lines,
            batch_flush_interval_ms,
            program,
            arguments: command.collect(),
        })
    }

    /// A third of the lock TTL, at least one second.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.lock_ttl_seconds / 3).max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    optional_trimmed_env(name).ok_or_else(|| AppError::Validation(format!("{name} is required")))
}

fn optional_trimmed_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
