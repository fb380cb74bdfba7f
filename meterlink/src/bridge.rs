//! Top-level supervision: the bus session and every gateway.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusConnector, BusError};
use crate::clock::EpochClock;
use crate::config::{ConfigError, GatewayDescriptor, MeterlinkConfig};
use crate::drivers::DriverRegistry;
use crate::gateway::{GatewayError, GatewaySupervisor, stopped};
use crate::transport::Connector;

/// Fatal bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

enum Outcome {
    Bus(BusError),
    Fatal(GatewayError),
    Finished,
    Cancelled,
}

type GatewayTasks = JoinSet<(String, Result<(), GatewayError>)>;

/// Owns the bus session and one [`GatewaySupervisor`] per gateway.
pub struct BridgeSupervisor<BC, C> {
    gateways: Vec<GatewayDescriptor>,
    bus_connector: BC,
    connector: Arc<C>,
    registry: Arc<DriverRegistry>,
    prefix: String,
    bus_reconnect_delay: Duration,
    gateway_reconnect_delay: Duration,
    clock: EpochClock,
}

impl<BC: BusConnector, C: Connector> BridgeSupervisor<BC, C> {
    pub fn new(
        gateways: Vec<GatewayDescriptor>,
        bus_connector: BC,
        connector: C,
        registry: DriverRegistry,
    ) -> Self {
        Self {
            gateways,
            bus_connector,
            connector: Arc::new(connector),
            registry: Arc::new(registry),
            prefix: String::new(),
            bus_reconnect_delay: Duration::from_secs(5),
            gateway_reconnect_delay: Duration::from_secs(1),
            clock: EpochClock::system(),
        }
    }

    /// Validate `config` and build a supervisor from it.
    ///
    /// Nothing is connected yet; configuration errors surface here.
    pub fn from_config(
        config: &MeterlinkConfig,
        registry: DriverRegistry,
        bus_connector: BC,
        connector: C,
    ) -> Result<Self, BridgeError> {
        let gateways = config.gateways(&registry)?;
        Ok(Self::new(gateways, bus_connector, connector, registry)
            .with_prefix(config.bus.prefix.clone())
            .with_bus_reconnect_delay(config.bus.reconnect_delay())
            .with_gateway_reconnect_delay(config.modbus.reconnect_delay()))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_bus_reconnect_delay(mut self, delay: Duration) -> Self {
        self.bus_reconnect_delay = delay;
        self
    }

    pub fn with_gateway_reconnect_delay(mut self, delay: Duration) -> Self {
        self.gateway_reconnect_delay = delay;
        self
    }

    pub fn with_clock(mut self, clock: EpochClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn gateways(&self) -> &[GatewayDescriptor] {
        &self.gateways
    }

    /// Run until `shutdown` fires or a gateway hits a configuration error.
    ///
    /// Gateways only finish on their own when they have no devices, so the
    /// bridge returns early only when no gateway has any.
    ///
    /// A bus failure stops all gateways, closes the session and reopens it
    /// after the bus reconnect delay. Gateways are always drained and the bus
    /// closed before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        loop {
            let connected = tokio::select! {
                result = self.bus_connector.connect() => Some(result),
                _ = stopped(&mut shutdown) => None,
            };
            let outcome = match connected {
                None => return Ok(()),
                Some(Ok(bus)) => self.serve(Arc::new(bus), &mut shutdown).await,
                Some(Err(e)) => Outcome::Bus(e),
            };

            match outcome {
                Outcome::Bus(e) => {
                    warn!("{}, reopening bus in {:?}", e, self.bus_reconnect_delay);
                }
                Outcome::Fatal(e) => return Err(e.into()),
                Outcome::Finished => {
                    info!("All gateways finished");
                    return Ok(());
                }
                Outcome::Cancelled => return Ok(()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.bus_reconnect_delay) => {}
                _ = stopped(&mut shutdown) => return Ok(()),
            }
        }
    }

    /// Run every gateway on one bus session, then drain them and close it.
    async fn serve(&self, bus: Arc<BC::Bus>, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut gateways = JoinSet::new();
        for descriptor in &self.gateways {
            let supervisor = GatewaySupervisor::new(
                descriptor.clone(),
                self.connector.clone(),
                bus.clone(),
                self.registry.clone(),
            )
            .with_prefix(self.prefix.clone())
            .with_reconnect_delay(self.gateway_reconnect_delay)
            .with_clock(self.clock);
            let name = supervisor.name().to_string();
            let stop = stop_rx.clone();
            gateways.spawn(async move { (name, supervisor.run(stop).await) });
        }
        info!("Bridge running with {} gateway(s)", self.gateways.len());

        let outcome = tokio::select! {
            outcome = watch_gateways(&mut gateways) => outcome,
            _ = stopped(shutdown) => Outcome::Cancelled,
        };

        let _ = stop_tx.send(true);
        while let Some(joined) = gateways.join_next().await {
            log_drained(joined);
        }

        if let Err(e) = bus.close().await {
            warn!("Failed to close bus session: {}", e);
        }
        debug!("Bus session closed");
        outcome
    }
}

async fn watch_gateways(gateways: &mut GatewayTasks) -> Outcome {
    while let Some(joined) = gateways.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!("Gateway '{}' stopped", name),
            Ok((_, Err(GatewayError::Bus { source, .. }))) => return Outcome::Bus(source),
            Ok((_, Err(e))) => return Outcome::Fatal(e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Gateway task panicked: {}", e),
        }
    }
    Outcome::Finished
}

fn log_drained(joined: Result<(String, Result<(), GatewayError>), tokio::task::JoinError>) {
    match joined {
        Ok((name, Ok(()))) => debug!("Gateway '{}' drained", name),
        Ok((name, Err(e))) => debug!("Gateway '{}' stopped while draining: {}", name, e),
        Err(e) => error!("Gateway task failed while draining: {}", e),
    }
}
