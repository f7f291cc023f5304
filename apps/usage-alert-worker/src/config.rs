use crate::engine::SessionSettings;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/Users/Shared/FarmDashboard/setup/config.json";
pub const DEFAULT_THRESHOLD_HOURS: f64 = 0.0833;
pub const DEFAULT_EVALUATE_INTERVAL_SECS: u64 = 5 * 60;
const MIN_EVALUATE_INTERVAL_SECS: u64 = 5;

fn setup_config_path() -> PathBuf {
    for key in ["USAGE_SETUP_CONFIG_PATH", "FARM_SETUP_CONFIG_PATH"] {
        if let Ok(path) = env::var(key) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }
    if let Ok(state_dir) = env::var("FARM_SETUP_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join("config.json");
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    threshold_hours: Option<f64>,
    #[serde(default)]
    evaluate_interval_secs: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "usage-alert-worker failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "usage-alert-worker failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    if env_value("USAGE_THRESHOLD_HOURS").is_none() {
        if let Some(value) = overrides
            .threshold_hours
            .filter(|v| v.is_finite() && *v > 0.0)
        {
            config.threshold_hours = value;
        }
    }
    if env_value("USAGE_EVALUATE_INTERVAL_SECS").is_none() {
        if let Some(value) = overrides.evaluate_interval_secs.filter(|v| *v != 0) {
            config.evaluate_interval_secs = value.max(MIN_EVALUATE_INTERVAL_SECS);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    /// Session owner; alerts and notifications are written on their behalf.
    pub owner_id: String,
    pub threshold_hours: f64,
    pub evaluate_interval_secs: u64,
    pub notify_queue: usize,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();
        let from_setup = |pick: fn(&SetupConfigOverrides) -> Option<&String>| {
            setup_overrides
                .as_ref()
                .and_then(pick)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        };

        let database_url = env_value("USAGE_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| from_setup(|ov| ov.database_url.as_ref()))
            .context(
                "USAGE_DATABASE_URL or DATABASE_URL is required \
                 (or present as database_url in the setup config)",
            )?;
        let database_url = normalize_database_url(database_url);

        let owner_id = env_value("USAGE_OWNER_ID")
            .or_else(|| from_setup(|ov| ov.owner_id.as_ref()))
            .context("USAGE_OWNER_ID is required (or present as owner_id in the setup config)")?;

        let db_pool_size = env::var("USAGE_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let threshold_hours = env::var("USAGE_THRESHOLD_HOURS")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_THRESHOLD_HOURS);
        let evaluate_interval_secs = env::var("USAGE_EVALUATE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_EVALUATE_INTERVAL_SECS)
            .max(MIN_EVALUATE_INTERVAL_SECS);
        let notify_queue = env::var("USAGE_NOTIFY_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(256);
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        let mut config = Self {
            database_url,
            db_pool_size,
            owner_id,
            threshold_hours,
            evaluate_interval_secs,
            notify_queue,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        Ok(config)
    }

    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_secs(self.evaluate_interval_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            owner_id: self.owner_id.clone(),
            threshold_hours: self.threshold_hours,
            evaluate_interval: self.evaluate_interval(),
            notify_queue: self.notify_queue,
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
