//! Centralized configuration for the virtual network.
//!
//! All tunable parameters of the simulator are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default number of bytes a socket may have in flight.
pub const DEFAULT_NETWORK_CAPACITY: u32 = 64 * 1024;

/// Smallest in-flight budget that fits a stream header plus one payload byte.
pub const MIN_NETWORK_CAPACITY: u32 = 41;

/// Default TCP send and receive buffer size.
pub const DEFAULT_TCP_BUFFER_SIZE: u32 = 32 * 1024;

/// Default resolution of the latency distribution table.
pub const DEFAULT_DELAY_SAMPLES: u32 = 1000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds a value the simulator cannot run with
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Virtual network parameters.
///
/// Bandwidth, capacities and latency parameters mirror the knobs of a real
/// link. Zero bandwidth means unlimited; zero standard deviation makes every
/// transit delay exactly the mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Seed for loss and latency sampling
    pub seed: u64,
    /// Aggregate bandwidth in bytes per second (0 = unlimited)
    pub bandwidth: u32,
    /// Bytes a single socket may have in flight
    pub network_capacity: u32,
    /// Stream send buffer size in bytes
    pub send_buffer_capacity: u32,
    /// Stream receive window size in bytes
    pub recv_buffer_capacity: u32,
    /// Independent per-datagram loss probability (0.0 to 1.0)
    pub drop_probability: f64,
    /// Mean transit delay in milliseconds
    pub delay_mean_ms: u32,
    /// Standard deviation of the transit delay in milliseconds
    pub delay_stddev_ms: u32,
    /// Resolution of the latency distribution table
    pub delay_samples: u32,
    /// Address the "any" IPv4 binding is reachable through
    pub default_route_v4: Option<Ipv4Addr>,
    /// Address the "any" IPv6 binding is reachable through
    pub default_route_v6: Option<Ipv6Addr>,
    /// First port handed out for port-0 binds
    pub first_ephemeral_port: Option<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            bandwidth: 0,
            network_capacity: DEFAULT_NETWORK_CAPACITY,
            send_buffer_capacity: DEFAULT_TCP_BUFFER_SIZE,
            recv_buffer_capacity: DEFAULT_TCP_BUFFER_SIZE,
            drop_probability: 0.0,
            delay_mean_ms: 0,
            delay_stddev_ms: 0,
            delay_samples: DEFAULT_DELAY_SAMPLES,
            default_route_v4: None,
            default_route_v6: None,
            first_ephemeral_port: None,
        }
    }
}

impl NetworkConfig {
    /// Creates a configuration for deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            seed: 42, // Fixed seed for reproducible tests
            ..Default::default()
        }
    }

    /// Creates a configuration resembling a congested wide-area link.
    pub fn lossy_wan() -> Self {
        Self {
            seed: 7,
            bandwidth: 256 * 1024, // 256 KB/s
            drop_probability: 0.02,
            delay_mean_ms: 80,
            delay_stddev_ms: 20,
            ..Default::default()
        }
    }

    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies `VNET_*` overrides read through `lookup` on top of defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(seed) = lookup("VNET_SEED") {
            if let Ok(value) = seed.parse::<u64>() {
                config.seed = value;
            }
        }

        if let Some(bandwidth) = lookup("VNET_BANDWIDTH") {
            if let Ok(value) = bandwidth.parse::<u32>() {
                config.bandwidth = value;
            }
        }

        if let Some(probability) = lookup("VNET_DROP_PROBABILITY") {
            if let Ok(value) = probability.parse::<f64>() {
                config.drop_probability = value;
            }
        }

        if let Some(mean) = lookup("VNET_DELAY_MEAN_MS") {
            if let Ok(value) = mean.parse::<u32>() {
                config.delay_mean_ms = value;
            }
        }

        if let Some(stddev) = lookup("VNET_DELAY_STDDEV_MS") {
            if let Ok(value) = stddev.parse::<u32>() {
                config.delay_stddev_ms = value;
            }
        }

        config
    }

    /// Loads and validates a JSON configuration file.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` - File cannot be read
    /// - `ConfigError::Parse` - File is not valid JSON for this schema
    /// - `ConfigError::InvalidValue` - A field is out of range
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is usable by the simulator.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidValue` - Probability outside [0, 1], capacity too small for a packet or too few delay samples
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(ConfigError::InvalidValue {
                field: "drop_probability",
                reason: format!("{} is outside [0, 1]", self.drop_probability),
            });
        }
        if self.network_capacity < MIN_NETWORK_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "network_capacity",
                reason: format!(
                    "{} cannot hold a header plus payload, minimum is {MIN_NETWORK_CAPACITY}",
                    self.network_capacity
                ),
            });
        }
        if self.send_buffer_capacity == 0 || self.recv_buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer_capacity",
                reason: "send and receive buffers must be greater than zero".to_string(),
            });
        }
        if self.delay_samples < 2 {
            return Err(ConfigError::InvalidValue {
                field: "delay_samples",
                reason: format!("{} is fewer than the 2 points a table needs", self.delay_samples),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = NetworkConfig::default();

        assert_eq!(config.bandwidth, 0);
        assert_eq!(config.network_capacity, 65536);
        assert_eq!(config.send_buffer_capacity, 32768);
        assert_eq!(config.recv_buffer_capacity, 32768);
        assert_eq!(config.delay_samples, 1000);
        assert_eq!(config.drop_probability, 0.0);
        assert!(config.default_route_v4.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let testing = NetworkConfig::deterministic_testing();
        assert_eq!(testing.seed, 42);
        assert_eq!(testing.delay_stddev_ms, 0);

        let wan = NetworkConfig::lossy_wan();
        assert!(wan.drop_probability > 0.0);
        assert!(wan.delay_mean_ms > 0);
        assert!(wan.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VNET_SEED", "99"),
            ("VNET_BANDWIDTH", "1024"),
            ("VNET_DROP_PROBABILITY", "0.5"),
            ("VNET_DELAY_MEAN_MS", "not-a-number"),
        ]);

        let config = NetworkConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.seed, 99);
        assert_eq!(config.bandwidth, 1024);
        assert_eq!(config.drop_probability, 0.5);
        assert_eq!(config.delay_mean_ms, 0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = NetworkConfig {
            drop_probability: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "drop_probability",
                ..
            })
        ));

        let config = NetworkConfig {
            delay_samples: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NetworkConfig {
            network_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capacity_must_fit_a_stream_header() {
        let config = NetworkConfig {
            network_capacity: 40,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "network_capacity",
                ..
            })
        ));

        let config = NetworkConfig {
            network_capacity: MIN_NETWORK_CAPACITY,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "bandwidth": 2048, "delay_mean_ms": 30, "default_route_v4": "1.2.3.4" }}"#
        )
        .unwrap();

        let config = NetworkConfig::from_json_file(file.path()).unwrap();

        assert_eq!(config.bandwidth, 2048);
        assert_eq!(config.delay_mean_ms, 30);
        assert_eq!(config.default_route_v4, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(config.network_capacity, DEFAULT_NETWORK_CAPACITY);
    }

    #[test]
    fn test_json_file_invalid_value_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "drop_probability": -0.1 }}"#).unwrap();

        let result = NetworkConfig::from_json_file(file.path());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
