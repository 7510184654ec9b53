//! Serial port backend using the `serialport` crate
//!
//! Works for RS-232, USB-serial adapters and Bluetooth SPP links. The
//! `serialport` API is blocking, so every call runs on tokio's blocking pool.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, instrument};

use super::{
    Channel, ChannelProvider, DataBits, DeviceIdentity, FlowControl, Parity, SerialConfig,
    StopBits,
};
use crate::error::{ChannelError, ChannelResult};

/// Slack on top of the port timeout before the async side gives up
const READ_GRACE: Duration = Duration::from_millis(100);
const READ_BUFFER: usize = 256;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Serial port provider
#[derive(Debug, Clone, Default)]
pub struct SerialChannelProvider;

impl SerialChannelProvider {
    pub fn new() -> Self {
        Self
    }

    /// Find the port path currently assigned to a device
    fn resolve_port(identity: &DeviceIdentity) -> ChannelResult<String> {
        let (vid, pid, serial) = match identity {
            DeviceIdentity::Port { path } => return Ok(path.clone()),
            DeviceIdentity::Usb {
                vendor_id,
                product_id,
                serial_number,
            } => (*vendor_id, *product_id, serial_number.as_deref()),
        };

        let ports = serialport::available_ports().map_err(map_serial_error)?;
        ports
            .into_iter()
            .find(|p| match &p.port_type {
                SerialPortType::UsbPort(usb) => {
                    usb.vid == vid
                        && usb.pid == pid
                        && (serial.is_none() || usb.serial_number.as_deref() == serial)
                }
                _ => false,
            })
            .map(|p| p.port_name)
            .ok_or_else(|| ChannelError::NotFound(identity.to_string()))
    }
}

#[async_trait]
impl ChannelProvider for SerialChannelProvider {
    async fn list_devices(&self) -> ChannelResult<Vec<DeviceIdentity>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(join_error)?
            .map_err(map_serial_error)?;

        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => DeviceIdentity::Usb {
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                    serial_number: usb.serial_number,
                },
                _ => DeviceIdentity::port(p.port_name),
            })
            .collect())
    }

    #[instrument(skip(self, config), fields(identity = %identity, baud = config.baud_rate))]
    async fn open(
        &self,
        identity: &DeviceIdentity,
        config: &SerialConfig,
    ) -> ChannelResult<Box<dyn Channel>> {
        let identity = identity.clone();
        let config = *config;

        let (path, port) = tokio::task::spawn_blocking(move || {
            let path = Self::resolve_port(&identity)?;
            let port = serialport::new(&path, config.baud_rate)
                .data_bits(match config.data_bits {
                    DataBits::Seven => serialport::DataBits::Seven,
                    DataBits::Eight => serialport::DataBits::Eight,
                })
                .stop_bits(match config.stop_bits {
                    StopBits::One => serialport::StopBits::One,
                    StopBits::Two => serialport::StopBits::Two,
                })
                .parity(match config.parity {
                    Parity::None => serialport::Parity::None,
                    Parity::Even => serialport::Parity::Even,
                    Parity::Odd => serialport::Parity::Odd,
                })
                .flow_control(match config.flow_control {
                    FlowControl::None => serialport::FlowControl::None,
                    FlowControl::Hardware => serialport::FlowControl::Hardware,
                })
                .timeout(Duration::from_secs(1))
                .open()
                .map_err(map_serial_error)?;
            Ok::<_, ChannelError>((path, port))
        })
        .await
        .map_err(join_error)??;

        info!(path = %path, "Serial port opened");
        Ok(Box::new(SerialChannel {
            path,
            port: Some(Arc::new(Mutex::new(port))),
        }))
    }
}

/// An open serial port
pub struct SerialChannel {
    path: String,
    port: Option<SharedPort>,
}

impl SerialChannel {
    fn port(&self) -> ChannelResult<SharedPort> {
        self.port.clone().ok_or(ChannelError::Closed)
    }
}

#[async_trait]
impl Channel for SerialChannel {
    async fn write(&mut self, data: &[u8]) -> ChannelResult<()> {
        let port = self.port()?;
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> ChannelResult<()> {
            let mut port = port.lock();
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn read(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        let port = self.port()?;

        let task = tokio::task::spawn_blocking(move || -> ChannelResult<Vec<u8>> {
            let mut port = port.lock();
            port.set_timeout(timeout).map_err(map_serial_error)?;

            let mut buf = vec![0u8; READ_BUFFER];
            match port.read(&mut buf) {
                Ok(0) => Err(ChannelError::Timeout),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(ChannelError::Timeout),
                Err(e) => Err(ChannelError::Io(e)),
            }
        });

        // A detached read keeps the port lock until the port timeout set
        // above expires, so a following write waits at most `timeout`.
        match tokio::time::timeout(timeout + READ_GRACE, task).await {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    async fn close(&mut self) -> ChannelResult<()> {
        if self.port.take().is_some() {
            debug!(path = %self.path, "Serial port closed");
        }
        Ok(())
    }
}

fn map_serial_error(err: serialport::Error) -> ChannelError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => ChannelError::NotFound(err.description),
        serialport::ErrorKind::InvalidInput => ChannelError::ConfigRejected(err.description),
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            ChannelError::AccessDenied(err.description)
        }
        serialport::ErrorKind::Io(kind) => {
            ChannelError::Io(std::io::Error::new(kind, err.description))
        }
        _ => {
            ChannelError::Io(std::io::Error::other(err.description))
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> ChannelError {
    ChannelError::Io(std::io::Error::other(format!("Task join failed: {}", err)))
}
