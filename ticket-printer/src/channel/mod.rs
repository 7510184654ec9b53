//! Byte-duplex channels to physical printers
//!
//! The core only depends on the [`Channel`] / [`ChannelProvider`] traits.
//! Backends:
//! - [`serial::SerialChannelProvider`] - serial ports (RS-232, USB-serial, Bluetooth SPP)
//! - [`memory::MemoryChannelProvider`] - scripted in-memory device for tests and demos

pub mod memory;
pub mod serial;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelResult;

/// Stable identifier of a physical printer
///
/// USB devices are identified by their descriptors so the identity survives
/// the port being renamed between reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceIdentity {
    Usb {
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
    },
    Port {
        path: String,
    },
}

impl DeviceIdentity {
    pub fn usb(vendor_id: u16, product_id: u16) -> Self {
        DeviceIdentity::Usb {
            vendor_id,
            product_id,
            serial_number: None,
        }
    }

    pub fn port(path: impl Into<String>) -> Self {
        DeviceIdentity::Port { path: path.into() }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentity::Usb {
                vendor_id,
                product_id,
                serial_number,
            } => {
                write!(f, "usb:{:04x}:{:04x}", vendor_id, product_id)?;
                if let Some(serial) = serial_number {
                    write!(f, ":{}", serial)?;
                }
                Ok(())
            }
            DeviceIdentity::Port { path } => write!(f, "port:{}", path),
        }
    }
}

impl FromStr for DeviceIdentity {
    type Err = String;

    /// Parses `usb:VID:PID[:SERIAL]` (hex ids) or `port:PATH`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("port:") {
            if path.is_empty() {
                return Err("Empty port path".to_string());
            }
            return Ok(DeviceIdentity::port(path));
        }

        let rest = s
            .strip_prefix("usb:")
            .ok_or_else(|| format!("Invalid device identity: {}", s))?;
        let mut parts = rest.splitn(3, ':');
        let parse_id = |part: Option<&str>| {
            part.and_then(|p| u16::from_str_radix(p, 16).ok())
                .ok_or_else(|| format!("Invalid USB id in: {}", s))
        };
        let vendor_id = parse_id(parts.next())?;
        let product_id = parse_id(parts.next())?;
        let serial_number = parts.next().filter(|p| !p.is_empty()).map(str::to_string);

        Ok(DeviceIdentity::Usb {
            vendor_id,
            product_id,
            serial_number,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Line settings for a serial link
///
/// Fixed for the lifetime of an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub stop_bits: StopBits,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
}

impl SerialConfig {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }
}

impl Default for SerialConfig {
    /// 9600 8N1, no flow control
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// An open byte-duplex connection
#[async_trait]
pub trait Channel: Send {
    /// Write all bytes and flush
    async fn write(&mut self, data: &[u8]) -> ChannelResult<()>;

    /// Read whatever arrives first, waiting at most `timeout`
    ///
    /// Returns `ChannelError::Timeout` when nothing arrived in time.
    async fn read(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>>;

    /// Release the underlying device
    async fn close(&mut self) -> ChannelResult<()>;
}

/// Opens channels to devices the host exposes
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Devices currently visible to the host, without opening them
    async fn list_devices(&self) -> ChannelResult<Vec<DeviceIdentity>>;

    async fn open(
        &self,
        identity: &DeviceIdentity,
        config: &SerialConfig,
    ) -> ChannelResult<Box<dyn Channel>>;
}
