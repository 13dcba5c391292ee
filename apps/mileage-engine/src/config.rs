use anyhow::{Context, Result};
use chrono::Duration;
use mileage_db::models::redemption_code::CodeKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Retries of one atomic unit after a write conflict.
    pub conflict_retries: u32,
    pub coupon_ttl_secs: i64,
    pub mileage_ttl_secs: i64,
    pub payment_ttl_secs: i64,
    pub log_file: Option<PathBuf>,
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://mileage.db".to_string(),
            max_connections: 5,
            conflict_retries: 3,
            coupon_ttl_secs: 30 * 24 * 60 * 60,
            mileage_ttl_secs: 5 * 60,
            payment_ttl_secs: 5 * 60,
            log_file: None,
            loaded_from: None,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        let mut config_paths: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var("MILEAGE_CONFIG") {
            config_paths.push(path.into());
        }
        config_paths.push("/etc/mileage/engine.toml".into());
        config_paths.push("./mileage.toml".into());

        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(&path) {
                let mut config = Self::from_toml(&contents)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
                config.loaded_from = Some(path);
                return Ok(config);
            }
        }

        Self::from_env()
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Fallback when no config file exists. Unset or unparsable variables
    /// keep their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_parsed("MILEAGE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            conflict_retries: env_parsed("MILEAGE_CONFLICT_RETRIES")
                .unwrap_or(defaults.conflict_retries),
            coupon_ttl_secs: env_parsed("MILEAGE_COUPON_TTL_SECS")
                .unwrap_or(defaults.coupon_ttl_secs),
            mileage_ttl_secs: env_parsed("MILEAGE_MILEAGE_TTL_SECS")
                .unwrap_or(defaults.mileage_ttl_secs),
            payment_ttl_secs: env_parsed("MILEAGE_PAYMENT_TTL_SECS")
                .unwrap_or(defaults.payment_ttl_secs),
            log_file: std::env::var("MILEAGE_LOG_FILE").ok().map(PathBuf::from),
            loaded_from: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        for (name, secs) in [
            ("coupon_ttl_secs", self.coupon_ttl_secs),
            ("mileage_ttl_secs", self.mileage_ttl_secs),
            ("payment_ttl_secs", self.payment_ttl_secs),
        ] {
            if secs <= 0 {
                anyhow::bail!("{} must be positive, got {}", name, secs);
            }
            if Duration::try_seconds(secs).is_none() {
                anyhow::bail!("{} out of range: {}", name, secs);
            }
        }
        Ok(())
    }

    /// Lifetime of a freshly issued code when the issuer doesn't pick one.
    pub fn default_ttl(&self, kind: CodeKind) -> Duration {
        let secs = match kind {
            CodeKind::Coupon => self.coupon_ttl_secs,
            CodeKind::Mileage => self.mileage_ttl_secs,
            CodeKind::Payment => self.payment_ttl_secs,
        };
        Duration::try_seconds(secs).unwrap_or(Duration::MAX)
    }
}
