//! Environment-driven configuration.
//!
//! All settings come from the process environment, read once at startup:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `HOST` | Bind address for both listeners (default `0.0.0.0`) |
//! | `HTTP_PORT` | HTTP listen port (default 3000) |
//! | `WEBSOCKET_PORT` | Controller-endpoint listen port (default 8080) |
//! | `AUTHENTICATION_PLUGIN` | Active auth plugin (default `environment`) |
//! | `LOG_LEVEL` | trace/debug/info/warn/error/fatal/silent (default `info`) |
//! | `DEVICE_KEYS` | Comma-separated allowlist for the `environment` plugin |
//! | `MYSQL_CONNECTION_URL` | Connection URL for the `mysql` plugin |
//! | `MYSQL_TABLE` | Table probed by the `mysql` plugin |
//!
//! Malformed values are fatal: the gateway refuses to start rather than run
//! with a configuration it cannot honor.

use std::fmt;

/// Gateway configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for both the HTTP and controller listeners.
    pub host: String,
    /// HTTP listen port.
    pub http_port: u16,
    /// Controller-endpoint listen port.
    pub websocket_port: u16,
    /// Name of the active authentication plugin. Unknown names are fatal.
    pub authentication_plugin: String,
    /// Requested log level, pino-style names.
    pub log_level: String,
    /// Raw `DEVICE_KEYS` value, consumed by the `environment` plugin.
    pub device_keys: Option<String>,
    /// Consumed by the `mysql` plugin.
    pub mysql_connection_url: Option<String>,
    /// Consumed by the `mysql` plugin.
    pub mysql_table: Option<String>,
}

/// A malformed configuration value. Fatal at startup.
#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or("HOST", "0.0.0.0"),
            http_port: port_from_env("HTTP_PORT", 3000)?,
            websocket_port: port_from_env("WEBSOCKET_PORT", 8080)?,
            authentication_plugin: env_or("AUTHENTICATION_PLUGIN", "environment"),
            log_level: env_or("LOG_LEVEL", "info"),
            device_keys: std::env::var("DEVICE_KEYS").ok(),
            mysql_connection_url: std::env::var("MYSQL_CONNECTION_URL").ok(),
            mysql_table: std::env::var("MYSQL_TABLE").ok(),
        })
    }

    /// tracing filter directive for this configuration. `RUST_LOG` wins when
    /// set, mirroring the usual tracing-subscriber convention.
    pub fn log_filter(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| tracing_level(&self.log_level).to_string())
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn port_from_env(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => parse_port(name, &raw),
        _ => Ok(default),
    }
}

fn parse_port(name: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError(format!("{name} must be a port number, got {raw:?}")))
}

/// Map the pino-style level names onto a tracing filter directive. `fatal`
/// folds into `error` and `silent` disables output entirely; unrecognized
/// names fall back to `info`.
fn tracing_level(level: &str) -> &'static str {
    match level {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" => "error",
        "silent" => "off",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_onto_tracing_directives() {
        assert_eq!(tracing_level("trace"), "trace");
        assert_eq!(tracing_level("debug"), "debug");
        assert_eq!(tracing_level("info"), "info");
        assert_eq!(tracing_level("warn"), "warn");
        assert_eq!(tracing_level("error"), "error");
        assert_eq!(tracing_level("fatal"), "error");
        assert_eq!(tracing_level("silent"), "off");
        assert_eq!(tracing_level("verbose"), "info");
    }

    #[test]
    fn ports_parse_strictly() {
        assert_eq!(parse_port("HTTP_PORT", "3000").unwrap(), 3000);
        assert_eq!(parse_port("HTTP_PORT", "1").unwrap(), 1);
        assert!(parse_port("HTTP_PORT", "http").is_err());
        assert!(parse_port("HTTP_PORT", "70000").is_err());
        assert!(parse_port("HTTP_PORT", "-1").is_err());
    }
}
