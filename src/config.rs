use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::info;

const DEFAULT_STORAGE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TEMP_PREFIX: &str = "temp/";
const PERMANENT_PREFIX: &str = "replays/";

/// Settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub object_store_url: String,
    pub object_store_token: Option<String>,
    pub engine: EngineConfig,
}

/// The settings the engine itself runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on each object store call.
    pub storage_timeout: Duration,
    /// Key prefix of ad hoc uploads that still have to be promoted.
    pub temp_prefix: String,
    /// Key prefix that permanent replay keys are created under.
    pub permanent_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(DEFAULT_STORAGE_TIMEOUT_SECS),
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
            permanent_prefix: PERMANENT_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from environment variables.
    ///
    /// In debug builds a `.env` file is read first.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        #[cfg(debug_assertions)]
        dotenv::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow!("Expected DATABASE_URL as an environment variable"))?;
        let object_store_url = std::env::var("OBJECT_STORE_URL")
            .map_err(|_| anyhow!("Expected OBJECT_STORE_URL as an environment variable"))?;
        let object_store_token = std::env::var("OBJECT_STORE_TOKEN").ok();

        let storage_timeout = match std::env::var("OBJECT_STORE_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("OBJECT_STORE_TIMEOUT_SECS is not a number: {}", secs))?,
            ),
            Err(_) => Duration::from_secs(DEFAULT_STORAGE_TIMEOUT_SECS),
        };
        let temp_prefix = normalize_prefix(
            std::env::var("REPLAY_TEMP_PREFIX").unwrap_or_else(|_| DEFAULT_TEMP_PREFIX.to_string()),
        );
        if temp_prefix == PERMANENT_PREFIX {
            return Err(anyhow!(
                "REPLAY_TEMP_PREFIX must differ from the permanent prefix {}",
                PERMANENT_PREFIX
            ));
        }
        info!("Successfully loaded configuration");

        Ok(Self {
            database_url,
            object_store_url,
            object_store_token,
            engine: EngineConfig {
                storage_timeout,
                temp_prefix,
                permanent_prefix: PERMANENT_PREFIX.to_string(),
            },
        })
    }
}

fn normalize_prefix(prefix: String) -> String {
    let trimmed = prefix.trim_matches('/');
    format!("{}/", trimmed)
}
