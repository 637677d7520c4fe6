//! Serial port transport
//!
//! Provides port discovery and a [`Transport`] backed by the `serialport`
//! crate. Reads run on a dedicated thread that frames lines and forwards them
//! to the async side; writes go through a second thread so a stalled port
//! (RTS/CTS) never blocks the caller.

use super::{ConnectionParams, LineFramer, Transport, TransportConnector, TransportEvent, TransportLink};
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tinylink_core::{ConnectionError, Error, Result};
use tinylink_settings::Parity;
use tokio::sync::mpsc;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }
}

impl std::fmt::Display for SerialPortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.port_name, self.description)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{:04x}:{:04x}]", vid, pid)?;
        }
        Ok(())
    }
}

/// List serial ports that look like CNC controllers
///
/// Matches:
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| {
            let mut info = SerialPortInfo::new(&port.port_name, port_description(port));
            if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.manufacturer = usb.manufacturer.clone();
                info.serial_number = usb.serial_number.clone();
            }
            info
        })
        .collect())
}

fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

fn invalid(reason: String) -> ConnectionError {
    ConnectionError::InvalidParameters { reason }
}

fn open_port(
    params: &ConnectionParams,
) -> std::result::Result<Box<dyn serialport::SerialPort>, ConnectionError> {
    let data_bits = match params.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        other => return Err(invalid(format!("Invalid data bits: {}", other))),
    };
    let stop_bits = match params.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        other => return Err(invalid(format!("Invalid stop bits: {}", other))),
    };
    let flow_control = if params.hardware_flow_control {
        serialport::FlowControl::Hardware
    } else if params.software_flow_control {
        serialport::FlowControl::Software
    } else {
        serialport::FlowControl::None
    };

    serialport::new(&params.port, params.baud_rate)
        .timeout(params.read_timeout)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(to_serialport_parity(params.parity))
        .flow_control(flow_control)
        .open()
        .map_err(|e| {
            tracing::warn!("Failed to open serial port {}: {}", params.port, e);
            match e.kind() {
                serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                    port: params.port.clone(),
                },
                _ => ConnectionError::FailedToOpen {
                    port: params.port.clone(),
                    reason: e.to_string(),
                },
            }
        })
}

/// Serial port transport
pub struct SerialTransport {
    port_name: String,
    writer: Option<std_mpsc::Sender<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open a port and start its reader and writer threads
    pub fn open(params: &ConnectionParams) -> std::result::Result<TransportLink, ConnectionError> {
        let port = open_port(params)?;
        let reader = port.try_clone().map_err(|e| ConnectionError::FailedToOpen {
            port: params.port.clone(),
            reason: e.to_string(),
        })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = std_mpsc::channel::<Vec<u8>>();
        let shutdown = Arc::new(AtomicBool::new(false));

        spawn_reader(reader, event_tx.clone(), shutdown.clone(), &params.port)?;
        spawn_writer(port, write_rx, event_tx, shutdown.clone(), &params.port)?;

        tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);

        Ok(TransportLink {
            transport: Box::new(SerialTransport {
                port_name: params.port.clone(),
                writer: Some(write_tx),
                shutdown,
            }),
            events: event_rx,
        })
    }
}

fn spawn_reader(
    mut port: Box<dyn serialport::SerialPort>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
    name: &str,
) -> std::result::Result<(), ConnectionError> {
    thread::Builder::new()
        .name(format!("serial-read {}", name))
        .spawn(move || {
            let mut framer = LineFramer::new();
            let mut buf = [0u8; 1024];
            while !shutdown.load(Ordering::Acquire) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            tracing::trace!("<< {}", line);
                            if events.send(TransportEvent::Line(line)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if !shutdown.swap(true, Ordering::AcqRel) {
                            tracing::error!("Serial read failed: {}", e);
                            let _ = events.send(TransportEvent::Error(ConnectionError::IoError {
                                reason: e.to_string(),
                            }));
                            let _ = events.send(TransportEvent::Closed);
                        }
                        return;
                    }
                }
            }
        })
        .map(|_| ())
        .map_err(|e| ConnectionError::IoError {
            reason: e.to_string(),
        })
}

fn spawn_writer(
    mut port: Box<dyn serialport::SerialPort>,
    queue: std_mpsc::Receiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
    name: &str,
) -> std::result::Result<(), ConnectionError> {
    thread::Builder::new()
        .name(format!("serial-write {}", name))
        .spawn(move || {
            while let Ok(data) = queue.recv() {
                if let Err(e) = port.write_all(&data).and_then(|_| port.flush()) {
                    if !shutdown.swap(true, Ordering::AcqRel) {
                        tracing::error!("Serial write failed: {}", e);
                        let _ = events.send(TransportEvent::Error(ConnectionError::IoError {
                            reason: e.to_string(),
                        }));
                        let _ = events.send(TransportEvent::Closed);
                    }
                    return;
                }
            }
        })
        .map(|_| ())
        .map_err(|e| ConnectionError::IoError {
            reason: e.to_string(),
        })
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> std::result::Result<(), ConnectionError> {
        let writer = self.writer.as_ref().ok_or_else(|| ConnectionError::ConnectionLost {
            reason: "port closed".to_string(),
        })?;
        writer
            .send(data.to_vec())
            .map_err(|_| ConnectionError::ConnectionLost {
                reason: "writer thread stopped".to_string(),
            })
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if self.writer.take().is_some() {
            tracing::info!("Closed {}", self.port_name);
        }
    }

    fn name(&self) -> String {
        self.port_name.clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connector that opens real serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

#[async_trait]
impl TransportConnector for SerialConnector {
    async fn open(
        &self,
        params: &ConnectionParams,
    ) -> std::result::Result<TransportLink, ConnectionError> {
        let params = params.clone();
        tokio::task::spawn_blocking(move || SerialTransport::open(&params))
            .await
            .map_err(|e| ConnectionError::IoError {
                reason: e.to_string(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cnc_port_patterns() {
        assert!(is_valid_cnc_port("COM3"));
        assert!(is_valid_cnc_port("/dev/ttyUSB0"));
        assert!(is_valid_cnc_port("/dev/ttyACM1"));
        assert!(is_valid_cnc_port("/dev/cu.usbmodem1421"));
        assert!(!is_valid_cnc_port("COM"));
        assert!(!is_valid_cnc_port("COMX"));
        assert!(!is_valid_cnc_port("/dev/ttyS0"));
    }

    #[test]
    fn test_port_info_display() {
        let mut info = SerialPortInfo::new("/dev/ttyUSB0", "USB FTDI Serial Port");
        info.vid = Some(0x0403);
        info.pid = Some(0x6015);
        assert_eq!(
            info.to_string(),
            "/dev/ttyUSB0 (USB FTDI Serial Port) [0403:6015]"
        );
    }

    #[test]
    fn test_invalid_data_bits_rejected() {
        let params = ConnectionParams {
            data_bits: 9,
            ..ConnectionParams::default()
        };
        assert!(matches!(
            open_port(&params),
            Err(ConnectionError::InvalidParameters { .. })
        ));
    }
}
