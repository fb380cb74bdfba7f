//! Polling of one device unit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::bus::{Bus, BusError, DeviceTopic, Message};
use crate::clock::EpochClock;
use crate::codec::{DecodeError, Record};
use crate::drivers::{Driver, RegisterBlock};
use crate::scheduler::{DEFAULT_INTERVAL_SECS, IntervalRules, TopicScheduler};
use crate::transport::{RegisterReader, TransportError};

/// Why a device session stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The identification block could not be decoded. Retrying will not help.
    #[error("Unit {unit}: identification failed: {source}")]
    Identification {
        unit: u8,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Identity of a device, read once at session start.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub serial: String,
    pub topic: DeviceTopic,
}

/// Poll, decode, throttle and emit loop for one unit behind a gateway.
pub struct DeviceSession<R, B> {
    unit: u8,
    driver: Driver,
    reader: Arc<R>,
    bus: Arc<B>,
    prefix: String,
    scheduler: TopicScheduler,
    clock: EpochClock,
}

impl<R: RegisterReader, B: Bus> DeviceSession<R, B> {
    pub fn new(unit: u8, driver: Driver, rules: IntervalRules, reader: Arc<R>, bus: Arc<B>) -> Self {
        Self {
            unit,
            driver,
            reader,
            bus,
            prefix: String::new(),
            scheduler: TopicScheduler::new(rules),
            clock: EpochClock::system(),
        }
    }

    /// Topic prefix prepended to `<driver>/<serial>/...`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: EpochClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Run until a transport or bus failure, or until cancelled.
    ///
    /// Never returns `Ok`. A driver without measurement blocks idles after
    /// publishing its identity.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let identity = self.identify().await?;
        info!(
            "Unit {}: {} '{}' identified",
            self.unit, self.driver.name, identity.serial
        );

        if self.driver.measurements.is_empty() {
            debug!("Unit {}: driver has no measurement blocks", self.unit);
            std::future::pending::<()>().await;
        }

        loop {
            self.poll_cycle(&identity.topic).await?;

            let sleep = match self.scheduler.next_wakeup() {
                Some(deadline) => self.clock.until(deadline),
                None => Duration::from_secs_f64(DEFAULT_INTERVAL_SECS),
            };
            trace!(
                "Unit {}: sleeping {:?}, {} topics throttled",
                self.unit,
                sleep,
                self.scheduler.len()
            );
            tokio::time::sleep(sleep).await;
        }
    }

    /// Read and decode the identification block, then publish it retained.
    pub async fn identify(&mut self) -> Result<Identity, SessionError> {
        let block = self.driver.identification;
        let record = match self.read_block(&block).await? {
            Ok(record) => record,
            Err(source) => {
                return Err(SessionError::Identification {
                    unit: self.unit,
                    source,
                });
            }
        };

        let serial = record
            .get(self.driver.serial_field)
            .filter(|value| !value.is_null())
            .map(ToString::to_string)
            .filter(|serial| !serial.is_empty());
        let Some(serial) = serial else {
            return Err(SessionError::Identification {
                unit: self.unit,
                source: DecodeError::MissingSerial {
                    field: self.driver.serial_field,
                },
            });
        };

        let topic = DeviceTopic::new(&self.prefix, self.driver.name, &serial);
        for (field, suffix) in self.driver.identity_topics {
            if let Some(value) = record.get(field) {
                let message = Message::retained(topic.topic(suffix), value.clone());
                trace!(topic = %message.topic, payload = %message.payload, "Emit retained");
                self.bus.publish(&message).await?;
            }
        }

        Ok(Identity { serial, topic })
    }

    /// One pass over every measurement block.
    ///
    /// A block that fails to decode is skipped for this cycle. Transport and
    /// bus failures end the cycle and are returned.
    pub async fn poll_cycle(&mut self, topic: &DeviceTopic) -> Result<usize, SessionError> {
        let driver = self.driver;
        let mut emitted = 0;

        for block in driver.measurements {
            let record = match self.read_block(block).await? {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        "Unit {}: skipping {} block @ {}: {}",
                        self.unit,
                        block.kind.as_str(),
                        block.address,
                        e
                    );
                    continue;
                }
            };

            let now = self.clock.now();
            for (suffix, value) in driver.measurement_topics(&record) {
                if !self.scheduler.poll(now, suffix) {
                    continue;
                }
                let message = Message::new(topic.topic(suffix), value.clone());
                trace!(topic = %message.topic, payload = %message.payload, "Emit");
                self.bus.publish(&message).await?;
                emitted += 1;
            }
        }

        self.scheduler.finish_cycle(self.clock.now());
        Ok(emitted)
    }

    /// Read a block. The outer error is the transport's, the inner one the
    /// codec's.
    async fn read_block(
        &self,
        block: &RegisterBlock,
    ) -> Result<Result<Record, DecodeError>, TransportError> {
        let count = match block.register_count() {
            Ok(count) => count,
            Err(e) => return Ok(Err(e)),
        };
        let registers = self
            .reader
            .read(block.kind, block.address, count, self.unit)
            .await?;
        Ok(block.layout.decode(&registers))
    }
}
