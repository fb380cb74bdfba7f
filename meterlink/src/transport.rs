//! Register-read transport.
//!
//! Sessions only need "read N registers at address A from unit U". The
//! [`RegisterReader`] and [`Connector`] traits capture that; the Modbus TCP
//! implementation below backs them with `tokio-modbus`.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::drivers::RegisterKind;

/// Errors from the register transport.
///
/// Both variants mean the shared connection can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Reads blocks of 16-bit registers from units behind one gateway.
pub trait RegisterReader: Send + Sync + 'static {
    fn read(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
        unit: u8,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;
}

/// Opens register transports to gateways.
pub trait Connector: Send + Sync + 'static {
    type Reader: RegisterReader;

    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Reader, TransportError>> + Send;
}

/// Modbus TCP connector.
#[derive(Debug, Clone)]
pub struct ModbusTcpConnector {
    timeout: Duration,
}

impl ModbusTcpConnector {
    /// `timeout` bounds both connecting and every single read.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connector for ModbusTcpConnector {
    type Reader = ModbusTcpReader;

    async fn connect(&self, host: &str, port: u16) -> Result<ModbusTcpReader, TransportError> {
        let addr: SocketAddr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
            .next()
            .ok_or_else(|| {
                TransportError::Connection(format!("No address found for {}:{}", host, port))
            })?;

        let ctx = tokio::time::timeout(self.timeout, tcp::connect(addr))
            .await
            .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!("Connected to Modbus gateway at {}", addr);

        Ok(ModbusTcpReader {
            ctx: Mutex::new(ctx),
            timeout: self.timeout,
        })
    }
}

/// A Modbus TCP connection shared by all sessions of one gateway.
///
/// Requests are serialized; each one selects its unit before reading.
pub struct ModbusTcpReader {
    ctx: Mutex<Context>,
    timeout: Duration,
}

impl std::fmt::Debug for ModbusTcpReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpReader")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RegisterReader for ModbusTcpReader {
    async fn read(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
        unit: u8,
    ) -> Result<Vec<u16>, TransportError> {
        let mut ctx = self.ctx.lock().await;
        ctx.set_slave(Slave(unit));

        let response = match kind {
            RegisterKind::Holding => {
                tokio::time::timeout(self.timeout, ctx.read_holding_registers(address, count))
                    .await
            }
            RegisterKind::Input => {
                tokio::time::timeout(self.timeout, ctx.read_input_registers(address, count)).await
            }
        };

        response
            .map_err(|_| TransportError::Connection("Read timeout".to_string()))?
            .map_err(|e| TransportError::Protocol(e.to_string()))?
            .map_err(|e| TransportError::Protocol(format!("Exception: {:?}", e)))
    }
}
