//! MySQL-backed plugin: the existence of a row with a matching `device_key`
//! column in the configured table grants admission.

use sqlx::mysql::MySqlPool;

use super::AuthError;
use crate::config::Config;

/// Validates device keys by probing the configured table.
#[derive(Debug)]
pub struct MysqlValidator {
    pool: MySqlPool,
    probe: String,
}

impl MysqlValidator {
    /// Connect the pool and prebuild the probe statement. Identifiers cannot
    /// be bound as parameters, so the table name is restricted to
    /// `[A-Za-z0-9_]+` before interpolation.
    pub async fn init(config: &Config) -> Result<Self, AuthError> {
        let url = config
            .mysql_connection_url
            .as_deref()
            .ok_or("mysql plugin requires MYSQL_CONNECTION_URL")?;
        let table = config
            .mysql_table
            .as_deref()
            .ok_or("mysql plugin requires MYSQL_TABLE")?;
        if !valid_table_name(table) {
            return Err(format!("MYSQL_TABLE must match [A-Za-z0-9_]+, got {table:?}").into());
        }

        let pool = MySqlPool::connect(url).await?;
        let probe = format!("SELECT 1 FROM `{table}` WHERE `device_key` = ? LIMIT 1");
        Ok(Self { pool, probe })
    }

    pub async fn validate_key(&self, device_key: &str) -> Result<bool, AuthError> {
        let row = sqlx::query(&self.probe)
            .bind(device_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn valid_table_name(table: &str) -> bool {
    !table.is_empty()
        && table
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_restricted_to_identifier_characters() {
        assert!(valid_table_name("device_keys"));
        assert!(valid_table_name("Keys2"));
        assert!(!valid_table_name(""));
        assert!(!valid_table_name("keys;drop table users"));
        assert!(!valid_table_name("keys`"));
        assert!(!valid_table_name("device keys"));
    }

    #[tokio::test]
    async fn missing_settings_fail_init_before_connecting() {
        let mut config = Config {
            host: "127.0.0.1".to_string(),
            http_port: 3000,
            websocket_port: 8080,
            authentication_plugin: "mysql".to_string(),
            log_level: "info".to_string(),
            device_keys: None,
            mysql_connection_url: None,
            mysql_table: None,
        };
        assert!(MysqlValidator::init(&config).await.is_err());

        config.mysql_connection_url = Some("mysql://gw@localhost/gw".to_string());
        assert!(MysqlValidator::init(&config).await.is_err());

        config.mysql_table = Some("bad table".to_string());
        assert!(MysqlValidator::init(&config).await.is_err());
    }
}
