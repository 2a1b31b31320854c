//! Authentication plugins gating controller admission.
//!
//! Exactly one plugin is active per process, selected by name through
//! `AUTHENTICATION_PLUGIN`. A plugin initializes once at startup (any
//! failure there, including an unknown plugin name, is fatal) and then
//! answers key-validation probes on every controller admission, possibly
//! concurrently from different sessions.
//!
//! Admission treats a validation `Err` exactly like `Ok(false)`: the
//! controller is refused either way, but the error is logged.

pub mod environment;
pub mod mysql;

use crate::config::Config;
use environment::EnvironmentValidator;
use mysql::MysqlValidator;

/// Errors surfaced by plugin init or key validation.
pub type AuthError = Box<dyn std::error::Error + Send + Sync>;

/// The active key validator, one variant per compiled-in plugin.
#[derive(Debug)]
pub enum KeyValidator {
    /// Static allowlist from `DEVICE_KEYS`.
    Environment(EnvironmentValidator),
    /// Row-existence probe against a MySQL table.
    Mysql(MysqlValidator),
}

impl KeyValidator {
    /// Instantiate the plugin named in the configuration.
    pub async fn init(config: &Config) -> Result<Self, AuthError> {
        match config.authentication_plugin.as_str() {
            "environment" => Ok(Self::Environment(EnvironmentValidator::init(config)?)),
            "mysql" => Ok(Self::Mysql(MysqlValidator::init(config).await?)),
            other => Err(format!("unknown authentication plugin {other:?}").into()),
        }
    }

    /// Whether `device_key` may register a controller session.
    pub async fn validate_key(&self, device_key: &str) -> Result<bool, AuthError> {
        match self {
            Self::Environment(v) => Ok(v.validate_key(device_key)),
            Self::Mysql(v) => v.validate_key(device_key).await,
        }
    }

    /// Plugin name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Environment(_) => "environment",
            Self::Mysql(_) => "mysql",
        }
    }
}
