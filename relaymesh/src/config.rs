use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use relaymesh_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "RELAYMESH_CONFIG_PATH";

/// Configuration file picked up from the working directory when none is given
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (the given path, else `./config.yaml` if present)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::build(config_file, Self::environment())
    }

    /// Environment overrides, e.g. `RELAYMESH_SERVER__PORT=3000` or `RELAYMESH_SFU__NUM_WORKERS=4`
    fn environment() -> Environment {
        Environment::with_prefix("RELAYMESH")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn build(config_file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        match config_file {
            // An explicitly named file must exist
            Some(path) => builder = builder.add_source(File::with_name(path)),
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
                }
            }
        }

        builder = builder.add_source(env);

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Collect every problem with this configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if let Err(e) = crate::logging::parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let mut map = config::Map::new();
        for (key, value) in vars {
            map.insert((*key).to_string(), (*value).to_string());
        }
        Config::environment().source(Some(map))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:3000");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.sfu.default_room, "mediasoup");
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 4000\nlogging:\n  format: json\nsfu:\n  num_workers: 2\n  announced_ip: 10.0.0.5"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = Config::build(
            Some(&path),
            env(&[
                ("RELAYMESH_SERVER__PORT", "5000"),
                ("RELAYMESH_SFU__MAX_ROOMS", "8"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.sfu.num_workers, 2);
        assert_eq!(config.sfu.max_rooms, 8);
        assert_eq!(config.sfu.announced_ip.as_deref(), Some("10.0.0.5"));
        // untouched keys keep their defaults
        assert_eq!(config.sfu.rtc_min_port, 2000);
        assert_eq!(config.sfu.worker_death_grace_ms, 2000);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::build(Some("/nonexistent/relaymesh.yaml"), env(&[])).is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.server.host = String::new();
        config.logging.level = "loud".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.num_workers = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("num_workers")));
    }
}
