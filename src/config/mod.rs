//! Application configuration.
//!
//! Loads `BusSettings` from YAML files and environment variables.

mod messaging;

pub use messaging::{BackendType, BusSettings, DEFAULT_TOPIC};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";
/// Environment variable for OpenTelemetry service name.
pub const OTEL_SERVICE_NAME_ENV_VAR: &str = "OTEL_SERVICE_NAME";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl BusSettings {
    /// Load settings from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///    (`COURIER_KAFKA_BROKERS` sets `kafka_brokers`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_load_without_sources_gives_defaults() {
        let settings = BusSettings::load(None).unwrap();
        assert_eq!(settings, BusSettings::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "bus_backend: kafka\nkafka_brokers: k1:9092,k2:9092\nkafka_topic: orders").unwrap();

        let settings = BusSettings::load(file.path().to_str()).unwrap();
        assert_eq!(settings.bus_backend, BackendType::Kafka);
        assert_eq!(settings.default_topic(), "orders");
        assert_eq!(settings.broker_addresses().len(), 2);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "otel_enabled: false\nrabbitmq_auto_ack: true").unwrap();

        std::env::set_var("COURIER_OTEL_ENABLED", "true");
        std::env::set_var("COURIER_RABBITMQ_AUTO_ACK", "false");
        let result = BusSettings::load(file.path().to_str());
        std::env::remove_var("COURIER_OTEL_ENABLED");
        std::env::remove_var("COURIER_RABBITMQ_AUTO_ACK");

        let settings = result.unwrap();
        assert!(settings.otel_enabled);
        assert!(!settings.rabbitmq_auto_ack);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let result = BusSettings::load(Some("/nonexistent/courier-test.yaml"));
        assert!(result.is_err());
    }
}
