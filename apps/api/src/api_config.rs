use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tether_application::{DEFAULT_FANOUT_CONCURRENCY, DEFAULT_LOG_RETENTION_SECONDS};
use tether_core::AppError;
use tracing_subscriber::EnvFilter;

const MIN_INTERNAL_SECRET_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub migrate_only: bool,
    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    pub api_host: String,
    pub api_port: u16,
    pub viewer_origin: String,
    pub internal_shared_secret: String,
    pub fanout_concurrency: usize,
    pub viewer_token_ttl_seconds: u32,
    pub log_retention_seconds: i64,
    pub request_timeout_seconds: u64,
    pub expiry_sweep_interval_seconds: u64,
}

impl ApiConfig {
    pub fn load() -> Result<Self, AppError> {
        let migrate_only = env::args().nth(1).as_deref() == Some("migrate");

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_owned())
            .as_str()
        {
            "postgres" => StoreBackend::Postgres {
                database_url: required_non_empty_env("DATABASE_URL")?,
            },
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::Validation(format!(
                    "STORE_BACKEND must be either 'postgres' or 'memory', got '{other}'"
                )));
            }
        };

        let redis_url = env::var("REDIS_URL")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let api_host = env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());
        let api_port = parse_env_u16("API_PORT", 3001)?;
        let viewer_origin =
            env::var("VIEWER_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_owned());

        let internal_shared_secret = required_non_empty_env("INTERNAL_SHARED_SECRET")?;
        if internal_shared_secret.len() < MIN_INTERNAL_SECRET_LENGTH {
            return Err(AppError::Validation(format!(
                "INTERNAL_SHARED_SECRET must be at least {MIN_INTERNAL_SECRET_LENGTH} characters"
            )));
        }

        let fanout_concurrency = parse_env_usize("FANOUT_CONCURRENCY", DEFAULT_FANOUT_CONCURRENCY)?;
        let viewer_token_ttl_seconds = parse_env_u32("VIEWER_TOKEN_TTL_SECONDS", 3600)?;
        let log_retention_seconds =
            parse_env_i64("LOG_RETENTION_SECONDS", DEFAULT_LOG_RETENTION_SECONDS)?;
        let request_timeout_seconds = parse_env_u64("REQUEST_TIMEOUT_SECONDS", 30)?;
        let expiry_sweep_interval_seconds = parse_env_u64("EXPIRY_SWEEP_INTERVAL_SECONDS", 300)?;

        for (name, value) in [
            ("FANOUT_CONCURRENCY", fanout_concurrency as u64),
            ("VIEWER_TOKEN_TTL_SECONDS", u64::from(viewer_token_ttl_seconds)),
            ("REQUEST_TIMEOUT_SECONDS", request_timeout_seconds),
            ("EXPIRY_SWEEP_INTERVAL_SECONDS", expiry_sweep_interval_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if log_retention_seconds <= 0 {
            return Err(AppError::Validation(
                "LOG_RETENTION_SECONDS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            migrate_only,
            store_backend,
            redis_url,
            api_host,
            api_port,
            viewer_origin,
            internal_shared_secret,
            fanout_concurrency,
            viewer_token_ttl_seconds,
            log_retention_seconds,
            request_timeout_seconds,
            expiry_sweep_interval_seconds,
        })
    }

    pub fn socket_address(&self) -> Result<SocketAddr, AppError> {
        let host = IpAddr::from_str(&self.api_host).map_err(|error| {
            AppError::Internal(format!("invalid API_HOST '{}': {error}", self.api_host))
        })?;
        Ok(SocketAddr::from((host, self.api_port)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_seconds)
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

fn required_env(name: &str) -> Result<String, AppError> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn required_non_empty_env(name: &str) -> Result<String, AppError> {
    let value = required_env(name)?;
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{name} must not be empty")));
    }

    Ok(value)
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, AppError> {
    match env::var(name) {
        Ok(value) => value.parse::<u16>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, AppError> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, AppError> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_i64(name: &str, default: i64) -> Result<i64, AppError> {
    match env::var(name) {
        Ok(value) => value.parse::<i64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, AppError> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
