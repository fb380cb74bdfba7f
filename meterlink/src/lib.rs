//! Modbus register telemetry to Zenoh bridge.
//!
//! Meterlink reads fixed-layout register blocks from energy meters and
//! inverters behind Modbus TCP gateways, decodes them into named quantities
//! and republishes each quantity on its own key at a configurable rate.
//!
//! # Key Expressions
//!
//! ```text
//! <prefix><driver>/<serial>/<topic>
//! ```
//!
//! Where:
//! - `<prefix>` - Bus prefix from configuration (default `meterlink/`)
//! - `<driver>` - Driver name, e.g. `abb_meter`
//! - `<serial>` - Serial number read from the device at session start
//! - `<topic>` - Driver topic such as `energy/import` or `voltage/L1`
//!
//! Identification topics (`info/...`) are published once and retained;
//! measurement topics are throttled per topic by the configured intervals.
//!
//! # Supervision
//!
//! - [`bridge::BridgeSupervisor`] owns the bus session and every gateway
//! - [`gateway::GatewaySupervisor`] owns one gateway connection and reconnects it
//! - [`device::DeviceSession`] polls one unit through the shared connection

pub mod bridge;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod drivers;
pub mod gateway;
pub mod scheduler;
pub mod transport;
