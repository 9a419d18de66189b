use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::ingest::ReconcileMode;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub reconcile_mode: ReconcileMode,
    pub log_filter: String,
    /// Marks-aware score at or above which `refresh-risk` raises an alert.
    pub high_risk_threshold: i32,
}

impl AppConfig {
    /// Defaults, then `early-warning.toml` if present, then `EARLY_WARNING_*`
    /// variables. A plain `DATABASE_URL` wins over everything else.
    pub fn load() -> Result<AppConfig, ConfigError> {
        Self::resolve(Self::builder()?, std::env::var("DATABASE_URL").ok())
    }

    fn resolve(
        builder: ConfigBuilder<DefaultState>,
        database_url: Option<String>,
    ) -> Result<AppConfig, ConfigError> {
        builder
            .set_override_option("database_url", database_url)?
            .build()?
            .try_deserialize::<AppConfig>()
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("max_connections", 5)?
            .set_default("reconcile_mode", "atomic")?
            .set_default("log_filter", "info")?
            .set_default("high_risk_threshold", 70)?
            .add_source(ConfigFile::with_name("early-warning").required(false))
            .add_source(Environment::with_prefix("EARLY_WARNING").try_parsing(true)))
    }
}
