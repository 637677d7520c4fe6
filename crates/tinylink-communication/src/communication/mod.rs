//! Serial transport layer
//!
//! The transport owns the physical connection. It is opened through a
//! [`TransportConnector`], accepts raw bytes through [`Transport::write`] and
//! reports framed lines, errors and closure on an event channel.

pub mod framing;
pub mod reconnect;
pub mod serial;

use async_trait::async_trait;
use std::time::Duration;
use tinylink_core::ConnectionError;
use tinylink_settings::{ConnectionSettings, Parity};
use tokio::sync::mpsc;

pub use framing::LineFramer;
pub use reconnect::{ReconnectPolicy, ReconnectTicket};
pub use serial::{list_ports, SerialConnector, SerialPortInfo, SerialTransport};

/// Parameters used to open a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Port path or name
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
    /// RTS/CTS hardware flow control
    pub hardware_flow_control: bool,
    /// XON/XOFF software flow control
    pub software_flow_control: bool,
    /// Poll timeout for the reader
    pub read_timeout: Duration,
    /// Retry after an unexpected close
    pub auto_reconnect: bool,
    /// Delay before a retry
    pub reconnect_delay: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectionParams {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            port: settings.port.clone(),
            baud_rate: settings.baud_rate,
            data_bits: settings.data_bits,
            stop_bits: settings.stop_bits,
            parity: settings.parity,
            hardware_flow_control: settings.rts_cts,
            software_flow_control: settings.xon_xoff,
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            auto_reconnect: settings.auto_reconnect,
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
        }
    }
}

/// Event reported by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A complete line, terminator removed
    Line(String),
    /// Read or write failure. A `Closed` event follows.
    Error(ConnectionError),
    /// The connection is gone
    Closed,
}

/// Write half of an open connection
pub trait Transport: Send {
    /// Queue bytes for transmission
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Close the connection. No further events are delivered.
    fn close(&mut self);

    /// Human-readable name of the connection
    fn name(&self) -> String;
}

/// An open connection and its event stream
pub struct TransportLink {
    /// Write half
    pub transport: Box<dyn Transport>,
    /// Lines and lifecycle events from the read half
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Opens transports
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a connection with the given parameters
    async fn open(&self, params: &ConnectionParams) -> Result<TransportLink, ConnectionError>;
}
