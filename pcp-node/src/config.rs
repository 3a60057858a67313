use config::{Config as ConfigBuilder, ConfigError, Environment, File, Map};
use pcp_core::RelaySettings;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
};

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelaySettings,
    pub logging: LoggingConfig,
    /// Channels relayed at startup, as `pcp://host:port/<channel id>`.
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub max_header_bytes: usize,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 7144,
            max_header_bytes: 4096,
            max_connections: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority:
    /// 1. Environment variables (`PCP_RELAY__MAX_RELAYS=4`)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_file, None)
    }

    /// Like [`Config::load`], reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        config_file: Option<&str>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(ConfigError::NotFound(path.to_string()));
            }
            builder = builder.add_source(File::with_name(path));
        }

        // a double underscore separates sections so field names keep theirs
        builder = builder.add_source(
            Environment::with_prefix("PCP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        builder.build()?.try_deserialize()
    }

    pub fn listen_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.server.listen_host.parse()?;
        Ok(SocketAddr::new(ip, self.server.listen_port))
    }

    /// Relay settings with the listener limits from the server section applied.
    #[must_use]
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            max_header_bytes: self.server.max_header_bytes,
            max_connections: self.server.max_connections,
            ..self.relay.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> Option<Map<String, String>> {
        Some(Map::new())
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_with_env(None, no_env()).unwrap();
        assert_eq!(config.server.listen_port, 7144);
        assert_eq!(config.relay.max_relays, 8);
        assert_eq!(config.relay.content_capacity, 100);
        assert_eq!(config.logging.level, "info");
        assert!(config.channels.is_empty());
        assert_eq!(
            config.listen_address().unwrap(),
            "0.0.0.0:7144".parse().unwrap()
        );
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
channels = ["pcp://192.0.2.1:7144/531DC8DFC7FB42928AC2C0A626517A87"]

[server]
listen_host = "127.0.0.1"
listen_port = 7145
max_header_bytes = 2048

[relay]
max_relays = 2
ignore_timeout_secs = 30

[logging]
format = "json"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = Config::load_with_env(Some(path), no_env()).unwrap();
        assert_eq!(config.server.listen_port, 7145);
        assert_eq!(config.relay.max_relays, 2);
        assert_eq!(config.relay.ignore_timeout_secs, 30);
        // untouched keys keep their defaults
        assert_eq!(config.relay.max_directs, 8);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.relay_settings().max_header_bytes, 2048);

        let env = Map::from([
            ("PCP_RELAY__MAX_RELAYS".to_string(), "5".to_string()),
            ("PCP_SERVER__LISTEN_PORT".to_string(), "7200".to_string()),
        ]);
        let config = Config::load_with_env(Some(path), Some(env)).unwrap();
        assert_eq!(config.relay.max_relays, 5);
        assert_eq!(config.server.listen_port, 7200);
        assert_eq!(config.server.listen_host, "127.0.0.1");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load_with_env(Some("/nonexistent/pcp-node.toml"), no_env()).is_err());
    }
}
