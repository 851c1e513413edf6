use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

const CONFIG_DIR: &str = "config";
const ENV_PREFIX: &str = "APP";
const DEFAULT_ENV: &str = "development";

/// Which [`crate::store::QuantityStore`] implementation backs the service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    Database,
    InMemory,
}

/// Service configuration. Every key except `jwt_secret` has a default.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database_url: String,
    pub store_backend: StoreBackend,
    /// Create the `products` table at startup when missing
    pub auto_create_schema: bool,

    /// HS256 secret used to validate bearer tokens
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,
    /// Value of `X-Override-Key` granting admin access on management routes
    pub admin_override_key: Option<String>,

    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub environment: String,

    #[validate(custom = "validate_log_level")]
    pub log_level: String,
    pub log_json: bool,
    /// Comma-separated allowed origins
    pub cors_allowed_origins: Option<String>,

    #[validate(range(min = 1))]
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_connect_timeout_secs: u64,
    pub db_acquire_timeout_secs: u64,
    pub db_idle_timeout_secs: u64,

    /// Upper bound on waiting for a stock row lock; exceeding it fails with `Busy`
    #[validate(range(min = 1, max = 60000))]
    pub stock_lock_timeout_ms: u64,

    /// Shipping service endpoint; shipments are only logged when unset
    #[validate(url)]
    pub shipping_notifier_url: Option<String>,
    #[validate(range(min = 1))]
    pub shipping_notifier_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://inventory.db?mode=rwc".to_string(),
            store_backend: StoreBackend::Database,
            auto_create_schema: true,
            jwt_secret: String::new(),
            admin_override_key: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: DEFAULT_ENV.to_string(),
            log_level: "info".to_string(),
            log_json: false,
            cors_allowed_origins: None,
            db_max_connections: 16,
            db_min_connections: 1,
            db_connect_timeout_secs: 30,
            db_acquire_timeout_secs: 8,
            db_idle_timeout_secs: 600,
            stock_lock_timeout_ms: 5_000,
            shipping_notifier_url: None,
            shipping_notifier_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Defaults plus the given secret
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            ..Self::default()
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEFAULT_ENV)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .iter()
            .flat_map(|raw| raw.split(','))
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn stock_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.stock_lock_timeout_ms)
    }

    pub fn shipping_notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.shipping_notifier_timeout_secs)
    }

    /// Field-level validation plus the checks spanning several keys
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;

        let mut errors = ValidationErrors::new();
        if self.db_min_connections > self.db_max_connections {
            errors.add(
                "db_min_connections",
                invalid("pool_bounds", "db_min_connections must not exceed db_max_connections"),
            );
        }
        if matches!(&self.admin_override_key, Some(key) if key.trim().is_empty()) {
            errors.add(
                "admin_override_key",
                invalid("blank", "admin_override_key must not be blank when set"),
            );
        }
        if self.store_backend == StoreBackend::InMemory && !self.is_development() {
            warn!(environment = %self.environment, "in-memory store configured outside development");
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    tracing::Level::from_str(level)
        .map(|_| ())
        .map_err(|_| invalid("log_level", "Must be one of: trace, debug, info, warn, error"))
}

/// Rejects well-known placeholders and secrets with almost no entropy.
fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    const PLACEHOLDERS: [&str; 3] = ["changeme", "your-secret-key", "default-secret-key"];

    let trimmed = secret.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if PLACEHOLDERS.iter().any(|p| lowered.starts_with(p)) {
        return Err(invalid("jwt_secret", "JWT secret must be a random value, not a placeholder"));
    }

    let mut distinct: Vec<char> = trimmed.chars().collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < 8 {
        return Err(invalid("jwt_secret", "JWT secret has too few distinct characters"));
    }

    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("inventory_api={level},tower_http=info,sqlx=warn"))
    });

    let builder = fmt().with_env_filter(filter).with_target(true);
    // A second call (tests) keeps the first subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn sources(run_env: &str) -> ConfigBuilder<DefaultState> {
    let mut builder = Config::builder();
    for name in ["default", run_env] {
        let path = format!("{CONFIG_DIR}/{name}");
        builder = builder.add_source(File::with_name(&path).required(false));
    }
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    )
}

/// Loads configuration from `config/default.*`, `config/{RUN_ENV}.*` and
/// `APP__*` environment variables, later sources winning.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    if !Path::new(CONFIG_DIR).is_dir() {
        info!("no '{}' directory; using defaults and environment", CONFIG_DIR);
    }

    let config: AppConfig = sources(&run_env).build()?.try_deserialize()?;

    if config.jwt_secret.is_empty() {
        error!("jwt_secret is not configured; set APP__JWT_SECRET");
        return Err(ConfigError::NotFound("jwt_secret".into()).into());
    }
    config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    info!(environment = %run_env, store = ?config.store_backend, "configuration loaded");
    Ok(config)
}
