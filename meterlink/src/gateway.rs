//! Supervision of one Modbus gateway and the device sessions behind it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError};
use crate::clock::EpochClock;
use crate::config::{DeviceDescriptor, GatewayDescriptor};
use crate::device::{DeviceSession, SessionError};
use crate::drivers::{Driver, DriverRegistry, UnknownDriver};
use crate::transport::{Connector, RegisterReader, TransportError};

/// Lifecycle of a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Cancelled,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayState::Disconnected => "disconnected",
            GatewayState::Connecting => "connecting",
            GatewayState::Connected => "connected",
            GatewayState::Draining => "draining",
            GatewayState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Failures a gateway cannot recover from by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway '{gateway}': {source}")]
    Config {
        gateway: String,
        #[source]
        source: UnknownDriver,
    },
    #[error("Gateway '{gateway}': {source}")]
    Bus {
        gateway: String,
        #[source]
        source: BusError,
    },
}

/// How a connected period ended.
enum Outcome {
    Reconnect(TransportError),
    Bus(BusError),
    Finished,
    Cancelled,
}

/// Resolve once a shutdown was requested or the sender went away.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Owns the connection to one gateway and one session task per unit.
pub struct GatewaySupervisor<C, B> {
    descriptor: GatewayDescriptor,
    connector: Arc<C>,
    bus: Arc<B>,
    registry: Arc<DriverRegistry>,
    prefix: String,
    reconnect_delay: Duration,
    clock: EpochClock,
    state: GatewayState,
}

impl<C: Connector, B: Bus> GatewaySupervisor<C, B> {
    pub fn new(
        descriptor: GatewayDescriptor,
        connector: Arc<C>,
        bus: Arc<B>,
        registry: Arc<DriverRegistry>,
    ) -> Self {
        Self {
            descriptor,
            connector,
            bus,
            registry,
            prefix: String::new(),
            reconnect_delay: Duration::from_secs(1),
            clock: EpochClock::system(),
            state: GatewayState::Disconnected,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_clock(mut self, clock: EpochClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn transition(&mut self, next: GatewayState) {
        debug!(
            gateway = %self.descriptor.name,
            from = %self.state,
            to = %next,
            "Gateway state change"
        );
        self.state = next;
    }

    /// Connect, run the device sessions and reconnect until `shutdown`
    /// fires.
    ///
    /// A connection loss and a group whose sessions all ended (every unit
    /// failed identification) both back off and reconnect, which reruns
    /// identification. Returns `Ok` when cancelled or when no device is
    /// configured. Bus failures and unknown drivers are returned as errors.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        if self.descriptor.devices.is_empty() {
            info!("Gateway '{}': no devices configured", self.descriptor.name);
            return Ok(());
        }

        let units = self.resolve_drivers()?;

        loop {
            self.transition(GatewayState::Connecting);
            let connected = tokio::select! {
                result = self.connector.connect(&self.descriptor.host, self.descriptor.port) => {
                    Some(result)
                }
                _ = stopped(&mut shutdown) => None,
            };
            let Some(connected) = connected else {
                self.transition(GatewayState::Cancelled);
                return Ok(());
            };

            let outcome = match connected {
                Ok(reader) => {
                    self.transition(GatewayState::Connected);
                    info!(
                        "Gateway '{}': connected to {}:{}",
                        self.descriptor.name, self.descriptor.host, self.descriptor.port
                    );
                    self.serve(Arc::new(reader), &units, &mut shutdown).await
                }
                Err(e) => Outcome::Reconnect(e),
            };

            match outcome {
                Outcome::Reconnect(e) => {
                    self.transition(GatewayState::Disconnected);
                    warn!(
                        "Gateway '{}': {}, reconnecting in {:?}",
                        self.descriptor.name, e, self.reconnect_delay
                    );
                }
                Outcome::Bus(source) => {
                    self.transition(GatewayState::Disconnected);
                    return Err(GatewayError::Bus {
                        gateway: self.descriptor.name.clone(),
                        source,
                    });
                }
                Outcome::Finished => {
                    self.transition(GatewayState::Disconnected);
                    warn!(
                        "Gateway '{}': all device sessions ended, reconnecting in {:?}",
                        self.descriptor.name, self.reconnect_delay
                    );
                }
                Outcome::Cancelled => {
                    self.transition(GatewayState::Cancelled);
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = stopped(&mut shutdown) => {
                    self.transition(GatewayState::Cancelled);
                    return Ok(());
                }
            }
        }
    }

    fn resolve_drivers(&self) -> Result<Vec<(DeviceDescriptor, Driver)>, GatewayError> {
        self.descriptor
            .devices
            .iter()
            .map(|device| {
                let driver = self
                    .registry
                    .get(&device.driver)
                    .map_err(|source| GatewayError::Config {
                        gateway: self.descriptor.name.clone(),
                        source,
                    })?;
                Ok((device.clone(), *driver))
            })
            .collect()
    }

    /// Run one session per unit on a shared connection until one of them
    /// reports a shared failure, all of them end, or shutdown is requested.
    /// Sessions are drained before returning.
    async fn serve<R>(
        &mut self,
        reader: Arc<R>,
        units: &[(DeviceDescriptor, Driver)],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome
    where
        R: RegisterReader,
    {
        let mut sessions = JoinSet::new();
        for (device, driver) in units {
            let session = DeviceSession::new(
                device.unit,
                *driver,
                device.rules.clone(),
                reader.clone(),
                self.bus.clone(),
            )
            .with_prefix(self.prefix.clone())
            .with_clock(self.clock);
            let unit = device.unit;
            sessions.spawn(async move { (unit, session.run().await) });
        }
        drop(reader);

        let outcome = tokio::select! {
            outcome = self.watch_sessions(&mut sessions) => outcome,
            _ = stopped(shutdown) => Outcome::Cancelled,
        };

        self.transition(GatewayState::Draining);
        sessions.shutdown().await;
        outcome
    }

    async fn watch_sessions(&self, sessions: &mut JoinSet<(u8, Result<(), SessionError>)>) -> Outcome {
        let gateway = &self.descriptor.name;
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((unit, Ok(()))) => debug!("Gateway '{}': unit {} finished", gateway, unit),
                Ok((_, Err(e @ SessionError::Identification { .. }))) => {
                    error!("Gateway '{}': {}", gateway, e);
                }
                Ok((_, Err(SessionError::Transport(e)))) => return Outcome::Reconnect(e),
                Ok((_, Err(SessionError::Bus(e)))) => return Outcome::Bus(e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("Gateway '{}': device session panicked: {}", gateway, e),
            }
        }
        Outcome::Finished
    }
}
