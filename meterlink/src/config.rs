//! Configuration for the meterlink bridge.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use meterlink_common::{Format, LoggingConfig, ZenohConfig};

use crate::drivers::DriverRegistry;
use crate::scheduler::{IntervalRule, IntervalRules};

/// Highest unit id addressable on a Modbus line.
pub const MAX_UNIT_ID: u8 = 247;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] meterlink_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterlinkConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Publish settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Gateways, devices and per-driver defaults
    pub modbus: ModbusConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Publish bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Prepended to every topic; empty or ending with `/`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Payload encoding
    #[serde(default)]
    pub format: Format,

    /// Delay before reopening a failed bus session
    #[serde(default = "default_bus_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_prefix() -> String {
    "meterlink/".to_string()
}

fn default_bus_reconnect_delay() -> u64 {
    5
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            format: Format::default(),
            reconnect_delay_secs: default_bus_reconnect_delay(),
        }
    }
}

impl BusConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Free-form option map, merged between driver and unit level.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Modbus side of the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Delay before reconnecting a gateway
    #[serde(default = "default_gateway_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Connect and per-read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Options applied to every unit using a driver
    #[serde(default)]
    pub drivers: HashMap<String, Options>,

    /// Gateways by name
    #[serde(default)]
    pub gateways: BTreeMap<String, GatewayConfig>,
}

fn default_gateway_reconnect_delay() -> u64 {
    1
}

fn default_timeout_ms() -> u64 {
    3000
}

impl ModbusConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One Modbus TCP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Devices by unit id
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

fn default_modbus_port() -> u16 {
    502
}

/// One unit behind a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub driver: String,

    /// Everything else; overrides the driver-level options
    #[serde(flatten)]
    pub options: Options,
}

/// Typed view of the merged device options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    #[serde(default)]
    pub intervals: Vec<IntervalRuleConfig>,
}

/// A publish interval for topics matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalRuleConfig {
    pub pattern: String,
    pub secs: f64,
}

/// A validated device unit.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub unit: u8,
    pub driver: String,
    pub options: DeviceOptions,
    pub rules: IntervalRules,
}

/// A validated gateway with its units, ordered by unit id.
#[derive(Debug, Clone)]
pub struct GatewayDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub devices: Vec<DeviceDescriptor>,
}

impl MeterlinkConfig {
    /// Load configuration from a JSON5 file.
    ///
    /// Only parsing happens here; call [`validate`](Self::validate) or
    /// [`gateways`](Self::gateways) against a driver registry afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(meterlink_common::load_config(path)?)
    }

    /// Parse configuration from a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        Ok(meterlink_common::parse_config(content)?)
    }

    /// Validate the configuration.
    pub fn validate(&self, registry: &DriverRegistry) -> Result<(), ConfigError> {
        self.gateways(registry).map(|_| ())
    }

    /// Validate and build the gateway descriptors.
    pub fn gateways(&self, registry: &DriverRegistry) -> Result<Vec<GatewayDescriptor>, ConfigError> {
        if self.modbus.gateways.is_empty() {
            return Err(ConfigError::Validation(
                "At least one gateway must be configured".to_string(),
            ));
        }

        let prefix = &self.bus.prefix;
        if !prefix.is_empty() && (!prefix.ends_with('/') || prefix.starts_with('/')) {
            return Err(ConfigError::Validation(format!(
                "Bus prefix '{}' must end with '/' and must not start with one",
                prefix
            )));
        }

        if self.modbus.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Modbus timeout must be positive".to_string(),
            ));
        }

        self.modbus
            .gateways
            .iter()
            .map(|(name, gateway)| self.gateway(name, gateway, registry))
            .collect()
    }

    fn gateway(
        &self,
        name: &str,
        gateway: &GatewayConfig,
        registry: &DriverRegistry,
    ) -> Result<GatewayDescriptor, ConfigError> {
        if gateway.host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Gateway '{}': host cannot be empty",
                name
            )));
        }
        if gateway.port == 0 {
            return Err(ConfigError::Validation(format!(
                "Gateway '{}': port cannot be 0",
                name
            )));
        }

        let mut devices = gateway
            .devices
            .iter()
            .map(|(unit, device)| self.device(name, unit, device, registry))
            .collect::<Result<Vec<_>, _>>()?;
        devices.sort_by_key(|device| device.unit);

        if let Some(pair) = devices.windows(2).find(|pair| pair[0].unit == pair[1].unit) {
            return Err(ConfigError::Validation(format!(
                "Gateway '{}': unit {} configured twice",
                name, pair[0].unit
            )));
        }

        Ok(GatewayDescriptor {
            name: name.to_string(),
            host: gateway.host.clone(),
            port: gateway.port,
            devices,
        })
    }

    fn device(
        &self,
        gateway: &str,
        unit: &str,
        device: &DeviceConfig,
        registry: &DriverRegistry,
    ) -> Result<DeviceDescriptor, ConfigError> {
        let unit_id = unit
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|id| *id <= MAX_UNIT_ID)
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "Gateway '{}': unit id '{}' must be a number between 0 and {}",
                    gateway, unit, MAX_UNIT_ID
                ))
            })?;

        if let Err(e) = registry.get(&device.driver) {
            return Err(ConfigError::Validation(format!(
                "Gateway '{}', unit {}: {}",
                gateway, unit_id, e
            )));
        }

        let options = self.merged_options(device);
        let options: DeviceOptions = serde_json::from_value(serde_json::Value::Object(options))
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "Gateway '{}', unit {}: invalid options: {}",
                    gateway, unit_id, e
                ))
            })?;

        let rules = options
            .intervals
            .iter()
            .map(|rule| {
                if !(rule.secs.is_finite() && rule.secs > 0.0) {
                    return Err(ConfigError::Validation(format!(
                        "Gateway '{}', unit {}: interval for '{}' must be positive",
                        gateway, unit_id, rule.pattern
                    )));
                }
                IntervalRule::new(&rule.pattern, rule.secs).map_err(|e| {
                    ConfigError::Validation(format!(
                        "Gateway '{}', unit {}: invalid pattern '{}': {}",
                        gateway, unit_id, rule.pattern, e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DeviceDescriptor {
            unit: unit_id,
            driver: device.driver.clone(),
            options,
            rules: IntervalRules::new(rules),
        })
    }

    /// Driver-level options overlaid with the unit's own; the unit wins.
    pub fn merged_options(&self, device: &DeviceConfig) -> Options {
        let mut merged = self
            .modbus
            .drivers
            .get(&device.driver)
            .cloned()
            .unwrap_or_default();
        for (key, value) in &device.options {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
