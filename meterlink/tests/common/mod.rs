//! Scripted transport and bus doubles for supervision tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use meterlink::bus::{Bus, BusConnector, BusError, Message};
use meterlink::codec::{FieldSpec, Item, RegisterLayout};
use meterlink::config::{DeviceDescriptor, GatewayDescriptor};
use meterlink::drivers::{Driver, DriverRegistry, RegisterBlock, RegisterKind};
use meterlink::scheduler::{IntervalRule, IntervalRules};
use meterlink::transport::{Connector, RegisterReader, TransportError};

pub const IDENT_ADDRESS: u16 = 0;
pub const MEASUREMENT_ADDRESS: u16 = 100;
pub const POWER_ADDRESS: u16 = 200;

const IDENTIFICATION: RegisterLayout =
    RegisterLayout::new(&[Item::Field(FieldSpec::u32("SerialNumber"))]);

const MEASUREMENTS: RegisterLayout = RegisterLayout::new(&[
    Item::Field(FieldSpec::u16("Energy").scaled(1, 10).with_sentinel()),
    Item::Field(FieldSpec::u16("Voltage").scaled(1, 10).with_sentinel()),
]);

const POWER: RegisterLayout = RegisterLayout::new(&[Item::Field(FieldSpec::u16("Power"))]);

/// A small meter: a 32-bit serial, two scaled measurements and a separate
/// power block.
pub const TEST_DRIVER: Driver = Driver {
    name: "test_meter",
    identification: RegisterBlock::new(RegisterKind::Holding, IDENT_ADDRESS, IDENTIFICATION),
    serial_field: "SerialNumber",
    identity_topics: &[("SerialNumber", "info/serial_number")],
    measurements: &[
        RegisterBlock::new(RegisterKind::Input, MEASUREMENT_ADDRESS, MEASUREMENTS),
        RegisterBlock::new(RegisterKind::Input, POWER_ADDRESS, POWER),
    ],
    topics: &[
        ("Energy", "energy/import"),
        ("Voltage", "voltage"),
        ("Power", "power"),
    ],
};

pub fn registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(TEST_DRIVER);
    registry
}

pub fn energy_rules() -> IntervalRules {
    IntervalRules::new(vec![IntervalRule::new("^energy/", 60.0).unwrap()])
}

pub fn device(unit: u8) -> DeviceDescriptor {
    DeviceDescriptor {
        unit,
        driver: TEST_DRIVER.name.to_string(),
        options: Default::default(),
        rules: energy_rules(),
    }
}

pub fn gateway(name: &str, units: &[u8]) -> GatewayDescriptor {
    GatewayDescriptor {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 502,
        devices: units.iter().copied().map(device).collect(),
    }
}

/// Time elapsed since `start`.
pub fn since(start: Instant, at: Instant) -> Duration {
    at.duration_since(start)
}

/// Register contents of every unit behind one fake gateway.
#[derive(Debug, Default)]
pub struct Plant {
    registers: Mutex<HashMap<(u8, u16), Vec<u16>>>,
    /// One-shot responses served before `registers`.
    scripted: Mutex<HashMap<(u8, u16), VecDeque<Vec<u16>>>>,
    /// Unit to 1-based read number that fails once with a connection error.
    fail_at: Mutex<HashMap<u8, usize>>,
    reads: Mutex<Vec<(u8, u16, Instant)>>,
}

impl Plant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install a working meter with `serial`, 123.4 kWh, 230.0 V and 1500 W.
    pub fn add_meter(&self, unit: u8, serial: u32) {
        self.set(unit, IDENT_ADDRESS, vec![(serial >> 16) as u16, serial as u16]);
        self.set(unit, MEASUREMENT_ADDRESS, vec![1234, 2300]);
        self.set(unit, POWER_ADDRESS, vec![1500]);
    }

    /// Answer the next reads of `address` with `responses`, one each, then
    /// fall back to the installed registers.
    pub fn script(&self, unit: u8, address: u16, responses: Vec<Vec<u16>>) {
        self.scripted
            .lock()
            .unwrap()
            .insert((unit, address), responses.into());
    }

    pub fn set(&self, unit: u8, address: u16, registers: Vec<u16>) {
        self.registers
            .lock()
            .unwrap()
            .insert((unit, address), registers);
    }

    pub fn fail_read_once(&self, unit: u8, read_number: usize) {
        self.fail_at.lock().unwrap().insert(unit, read_number);
    }

    pub fn reads(&self, unit: u8) -> Vec<(u16, Instant)> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _, _)| *u == unit)
            .map(|(_, address, at)| (*address, *at))
            .collect()
    }

    fn read(&self, unit: u8, address: u16) -> Result<Vec<u16>, TransportError> {
        let count = {
            let mut reads = self.reads.lock().unwrap();
            reads.push((unit, address, Instant::now()));
            reads.iter().filter(|(u, _, _)| *u == unit).count()
        };

        let mut fail_at = self.fail_at.lock().unwrap();
        if fail_at.get(&unit) == Some(&count) {
            fail_at.remove(&unit);
            return Err(TransportError::Connection("connection reset".to_string()));
        }
        drop(fail_at);

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&(unit, address))
            .and_then(VecDeque::pop_front);
        if let Some(registers) = scripted {
            return Ok(registers);
        }

        self.registers
            .lock()
            .unwrap()
            .get(&(unit, address))
            .cloned()
            .ok_or_else(|| TransportError::Protocol("illegal data address".to_string()))
    }
}

pub struct ScriptedReader {
    plant: Arc<Plant>,
}

impl RegisterReader for ScriptedReader {
    async fn read(
        &self,
        _kind: RegisterKind,
        address: u16,
        _count: u16,
        unit: u8,
    ) -> Result<Vec<u16>, TransportError> {
        self.plant.read(unit, address)
    }
}

/// Connector that fails the scripted number of attempts, then succeeds.
pub struct ScriptedConnector {
    plant: Arc<Plant>,
    failures: Mutex<VecDeque<TransportError>>,
    attempts: Mutex<Vec<Instant>>,
}

impl ScriptedConnector {
    pub fn new(plant: Arc<Plant>) -> Self {
        Self {
            plant,
            failures: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(plant: Arc<Plant>, failures: usize) -> Self {
        let connector = Self::new(plant);
        for _ in 0..failures {
            connector
                .failures
                .lock()
                .unwrap()
                .push_back(TransportError::Connection("connection refused".to_string()));
        }
        connector
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    type Reader = ScriptedReader;

    async fn connect(&self, _host: &str, _port: u16) -> Result<ScriptedReader, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(ScriptedReader {
            plant: self.plant.clone(),
        })
    }
}

/// Everything published on one or more recording buses.
#[derive(Debug, Default)]
pub struct Journal {
    messages: Mutex<Vec<(Instant, Message)>>,
    closes: Mutex<usize>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Publish times of `topic`.
    pub fn times(&self, topic: &str) -> Vec<Instant> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, message)| message.topic == topic)
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.times(topic).len()
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

pub struct RecordingBus {
    journal: Arc<Journal>,
    /// Publishes left before every further publish fails.
    budget: Option<Mutex<usize>>,
}

impl Bus for RecordingBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        if let Some(budget) = &self.budget {
            let mut left = budget.lock().unwrap();
            if *left == 0 {
                return Err(BusError::Transport {
                    key: message.topic.clone(),
                    message: "session closed".to_string(),
                });
            }
            *left -= 1;
        }
        self.journal
            .messages
            .lock()
            .unwrap()
            .push((Instant::now(), message.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        *self.journal.closes.lock().unwrap() += 1;
        Ok(())
    }
}

/// Opens recording buses. The n-th bus may be given a publish budget.
pub struct RecordingBusConnector {
    journal: Arc<Journal>,
    budgets: Mutex<VecDeque<Option<usize>>>,
    connects: Mutex<Vec<Instant>>,
}

impl RecordingBusConnector {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            budgets: Mutex::new(VecDeque::new()),
            connects: Mutex::new(Vec::new()),
        }
    }

    pub fn with_budgets(journal: Arc<Journal>, budgets: Vec<Option<usize>>) -> Self {
        let connector = Self::new(journal);
        *connector.budgets.lock().unwrap() = budgets.into();
        connector
    }

    /// A bus that records without failing.
    pub fn bus(journal: Arc<Journal>) -> RecordingBus {
        RecordingBus {
            journal,
            budget: None,
        }
    }
}

/// Shared view of a connector handed to a supervisor.
pub struct SharedBusConnector(pub Arc<RecordingBusConnector>);

impl SharedBusConnector {
    pub fn connects(&self) -> Vec<Instant> {
        self.0.connects.lock().unwrap().clone()
    }
}

impl BusConnector for SharedBusConnector {
    type Bus = RecordingBus;

    async fn connect(&self) -> Result<RecordingBus, BusError> {
        let inner = &self.0;
        inner.connects.lock().unwrap().push(Instant::now());
        let budget = inner.budgets.lock().unwrap().pop_front().flatten();
        Ok(RecordingBus {
            journal: inner.journal.clone(),
            budget: budget.map(Mutex::new),
        })
    }
}

/// Shared view of a connector handed to a supervisor.
pub struct SharedConnector(pub Arc<ScriptedConnector>);

impl Connector for SharedConnector {
    type Reader = ScriptedReader;

    async fn connect(&self, host: &str, port: u16) -> Result<ScriptedReader, TransportError> {
        self.0.connect(host, port).await
    }
}
