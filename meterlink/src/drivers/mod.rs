//! Static device drivers.
//!
//! A driver names a device family and lists the register blocks to read from
//! it, together with the topic suffix under which each decoded field is
//! republished. Drivers are plain data; the registry maps configured driver
//! names to them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{DecodeError, Record, RegisterLayout, Value};

pub mod abb_meter;
pub mod growatt_inverter;
pub mod sdm120;

/// Modbus register table a block is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl RegisterKind {
    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Input => "input",
            RegisterKind::Holding => "holding",
        }
    }
}

/// A contiguous run of registers read in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub kind: RegisterKind,
    pub address: u16,
    pub layout: RegisterLayout,
    /// Fixed read size; `None` reads exactly what the layout needs.
    pub count: Option<u16>,
}

impl RegisterBlock {
    pub const fn new(kind: RegisterKind, address: u16, layout: RegisterLayout) -> Self {
        Self {
            kind,
            address,
            layout,
            count: None,
        }
    }

    pub const fn with_count(mut self, count: u16) -> Self {
        self.count = Some(count);
        self
    }

    /// Number of registers to request from the device.
    pub fn register_count(&self) -> Result<u16, DecodeError> {
        match self.count {
            Some(count) => Ok(count),
            None => self.layout.register_count(),
        }
    }
}

/// Field name to topic suffix, in publication order.
pub type TopicMap = &'static [(&'static str, &'static str)];

/// Static description of one device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Driver {
    pub name: &'static str,
    /// Block read once per session.
    pub identification: RegisterBlock,
    /// Field of the identification block that anchors every topic.
    pub serial_field: &'static str,
    /// Identification fields published once, retained.
    pub identity_topics: TopicMap,
    /// Blocks read every poll cycle.
    pub measurements: &'static [RegisterBlock],
    /// Measurement fields published subject to throttling.
    pub topics: TopicMap,
}

impl Driver {
    /// Topic suffixes for the fields of `record` that this driver publishes.
    ///
    /// Only fields present in the record are returned, in topic map order.
    pub fn measurement_topics<'r>(
        &self,
        record: &'r Record,
    ) -> impl Iterator<Item = (&'static str, &'r Value)> {
        self.topics
            .iter()
            .filter_map(move |(field, topic)| record.get(field).map(|value| (*topic, value)))
    }
}

/// Raised when a configuration references a driver nobody registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Driver '{0}' not supported")]
pub struct UnknownDriver(pub String);

/// Name to driver lookup table, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every driver shipped with meterlink.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(abb_meter::DRIVER);
        registry.register(sdm120::DRIVER);
        registry.register(growatt_inverter::DRIVER);
        registry
    }

    /// Register a driver under its own name, replacing any previous one.
    pub fn register(&mut self, driver: Driver) {
        self.drivers.insert(driver.name, driver);
    }

    pub fn get(&self, name: &str) -> Result<&Driver, UnknownDriver> {
        self.drivers
            .get(name)
            .ok_or_else(|| UnknownDriver(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.drivers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
