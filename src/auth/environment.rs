//! Allowlist plugin backed by the `DEVICE_KEYS` environment variable.

use std::collections::HashSet;

use super::AuthError;
use crate::config::Config;

/// Validates device keys against a fixed comma-separated allowlist.
#[derive(Debug)]
pub struct EnvironmentValidator {
    keys: HashSet<String>,
}

impl EnvironmentValidator {
    /// Parse `DEVICE_KEYS`. An absent or empty variable is a startup error.
    pub fn init(config: &Config) -> Result<Self, AuthError> {
        let raw = config.device_keys.as_deref().unwrap_or("");
        let keys: HashSet<String> = raw
            .split(',')
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
        if keys.is_empty() {
            return Err("environment plugin requires a non-empty DEVICE_KEYS list".into());
        }
        Ok(Self { keys })
    }

    /// Byte-wise membership test; keys are compared exactly as listed.
    pub fn validate_key(&self, device_key: &str) -> bool {
        self.keys.contains(device_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(device_keys: Option<&str>) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            http_port: 3000,
            websocket_port: 8080,
            authentication_plugin: "environment".to_string(),
            log_level: "info".to_string(),
            device_keys: device_keys.map(str::to_string),
            mysql_connection_url: None,
            mysql_table: None,
        }
    }

    #[test]
    fn splits_on_commas_and_matches_exactly() {
        let v = EnvironmentValidator::init(&config(Some("alpha,beta,gamma"))).unwrap();
        assert!(v.validate_key("alpha"));
        assert!(v.validate_key("gamma"));
        assert!(!v.validate_key("delta"));
        // No trimming: equality is byte-wise.
        assert!(!v.validate_key(" alpha"));
        assert!(!v.validate_key("ALPHA"));
    }

    #[test]
    fn stray_commas_do_not_admit_the_empty_key() {
        let v = EnvironmentValidator::init(&config(Some("alpha,,beta,"))).unwrap();
        assert!(!v.validate_key(""));
        assert!(v.validate_key("beta"));
    }

    #[test]
    fn missing_or_empty_list_fails_init() {
        assert!(EnvironmentValidator::init(&config(None)).is_err());
        assert!(EnvironmentValidator::init(&config(Some(""))).is_err());
        assert!(EnvironmentValidator::init(&config(Some(",,"))).is_err());
    }
}
