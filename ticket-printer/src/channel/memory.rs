//! In-memory channel backend
//!
//! Simulates printers without hardware: records every write, replays queued
//! responses, and can answer fiscal frames with a configurable status block.
//! Opening a device that is already open fails with `Busy`, like an
//! exclusively locked serial port.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Channel, ChannelProvider, DeviceIdentity, SerialConfig};
use crate::error::{ChannelError, ChannelResult};
use crate::fiscal::{self, POSTAMBLE, PREAMBLE, SEPARATOR, TERMINATOR};

#[derive(Debug, Default)]
struct DeviceState {
    open: bool,
    opens: usize,
    closes: usize,
    last_config: Option<SerialConfig>,
    writes: Vec<(Instant, Vec<u8>)>,
    responses: VecDeque<Vec<u8>>,
    reject_opens: bool,
    fail_writes: bool,
    auto_status: Option<[u8; 6]>,
}

/// Scriptable fake device host
#[derive(Debug, Clone, Default)]
pub struct MemoryChannelProvider {
    devices: Arc<Mutex<HashMap<DeviceIdentity, DeviceState>>>,
}

impl MemoryChannelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a device visible to the host
    pub fn add_device(&self, identity: DeviceIdentity) {
        self.devices.lock().entry(identity).or_default();
    }

    /// Simulate unplugging: the device disappears and its channel breaks
    pub fn remove_device(&self, identity: &DeviceIdentity) {
        self.devices.lock().remove(identity);
    }

    /// Refuse future opens with `AccessDenied`
    pub fn reject_opens(&self, identity: &DeviceIdentity, reject: bool) {
        self.with_device(identity, |d| d.reject_opens = reject);
    }

    /// Fail future writes with a broken-pipe error
    pub fn fail_writes(&self, identity: &DeviceIdentity, fail: bool) {
        self.with_device(identity, |d| d.fail_writes = fail);
    }

    /// Queue raw bytes returned by the next read
    pub fn push_response(&self, identity: &DeviceIdentity, bytes: Vec<u8>) {
        self.with_device(identity, |d| d.responses.push_back(bytes));
    }

    /// Answer every well-formed fiscal frame with a response carrying `status`
    pub fn auto_respond(&self, identity: &DeviceIdentity, status: Option<[u8; 6]>) {
        self.with_device(identity, |d| d.auto_status = status);
    }

    /// All bytes written to the device, in order
    pub fn written(&self, identity: &DeviceIdentity) -> Vec<u8> {
        self.writes(identity).concat()
    }

    /// Individual write calls
    pub fn writes(&self, identity: &DeviceIdentity) -> Vec<Vec<u8>> {
        self.write_log(identity)
            .into_iter()
            .map(|(_, bytes)| bytes)
            .collect()
    }

    /// Individual write calls with the instant they happened
    pub fn write_log(&self, identity: &DeviceIdentity) -> Vec<(Instant, Vec<u8>)> {
        self.devices
            .lock()
            .get(identity)
            .map(|d| d.writes.clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self, identity: &DeviceIdentity) -> bool {
        self.devices.lock().get(identity).is_some_and(|d| d.open)
    }

    /// Number of successful opens so far
    pub fn open_count(&self, identity: &DeviceIdentity) -> usize {
        self.devices.lock().get(identity).map_or(0, |d| d.opens)
    }

    /// Number of closes so far
    pub fn close_count(&self, identity: &DeviceIdentity) -> usize {
        self.devices.lock().get(identity).map_or(0, |d| d.closes)
    }

    /// Configuration used by the most recent open
    pub fn last_config(&self, identity: &DeviceIdentity) -> Option<SerialConfig> {
        self.devices.lock().get(identity).and_then(|d| d.last_config)
    }

    fn with_device(&self, identity: &DeviceIdentity, f: impl FnOnce(&mut DeviceState)) {
        let mut devices = self.devices.lock();
        f(devices.entry(identity.clone()).or_default());
    }
}

#[async_trait]
impl ChannelProvider for MemoryChannelProvider {
    async fn list_devices(&self) -> ChannelResult<Vec<DeviceIdentity>> {
        let mut ids: Vec<_> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn open(
        &self,
        identity: &DeviceIdentity,
        config: &SerialConfig,
    ) -> ChannelResult<Box<dyn Channel>> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(identity)
            .ok_or_else(|| ChannelError::NotFound(identity.to_string()))?;

        if device.reject_opens {
            return Err(ChannelError::AccessDenied(identity.to_string()));
        }
        if device.open {
            return Err(ChannelError::Busy(identity.to_string()));
        }

        device.open = true;
        device.opens += 1;
        device.last_config = Some(*config);

        Ok(Box::new(MemoryChannel {
            identity: identity.clone(),
            devices: self.devices.clone(),
            closed: false,
        }))
    }
}

/// Channel handed out by [`MemoryChannelProvider`]
pub struct MemoryChannel {
    identity: DeviceIdentity,
    devices: Arc<Mutex<HashMap<DeviceIdentity, DeviceState>>>,
    closed: bool,
}

impl MemoryChannel {
    fn check_open(&self) -> ChannelResult<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn write(&mut self, data: &[u8]) -> ChannelResult<()> {
        self.check_open()?;

        let mut devices = self.devices.lock();
        let device = devices.get_mut(&self.identity).ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device unplugged",
            ))
        })?;

        if device.fail_writes {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write failed",
            )));
        }

        device.writes.push((Instant::now(), data.to_vec()));

        if let Some(status) = device.auto_status
            && let Some(reply) = device_reply(data, status)
        {
            device.responses.push_back(reply);
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        self.check_open()?;

        let queued = self
            .devices
            .lock()
            .get_mut(&self.identity)
            .and_then(|d| d.responses.pop_front());

        match queued {
            Some(bytes) => Ok(bytes),
            None => {
                tokio::time::sleep(timeout).await;
                Err(ChannelError::Timeout)
            }
        }
    }

    async fn close(&mut self) -> ChannelResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(device) = self.devices.lock().get_mut(&self.identity) {
            device.open = false;
            device.closes += 1;
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed
            && let Some(device) = self.devices.lock().get_mut(&self.identity)
        {
            device.open = false;
        }
    }
}

/// Device-side answer to a command frame: same SEQ/CMD, status attached
///
/// Returns `None` when `frame` is not a well-formed command frame.
pub fn device_reply(frame: &[u8], status: [u8; 6]) -> Option<Vec<u8>> {
    if frame.first() != Some(&PREAMBLE) || !fiscal::parse_response(frame).valid {
        return None;
    }

    let mut body = vec![0u8, frame[2], frame[3], SEPARATOR];
    body.extend_from_slice(&status);
    body.push(POSTAMBLE);
    body[0] = 0x20 + (body.len() - 1) as u8;

    let mut reply = vec![PREAMBLE];
    reply.extend_from_slice(&body);
    reply.extend_from_slice(&fiscal::encode_bcc(fiscal::checksum(&body)));
    reply.push(TERMINATOR);
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::FiscalCodec;

    #[tokio::test]
    async fn test_open_write_close() {
        let provider = MemoryChannelProvider::new();
        let id = DeviceIdentity::port("mem0");
        provider.add_device(id.clone());

        let mut channel = provider.open(&id, &SerialConfig::default()).await.unwrap();
        assert!(provider.is_open(&id));

        channel.write(b"hello").await.unwrap();
        channel.write(b" world").await.unwrap();
        assert_eq!(provider.written(&id), b"hello world");

        channel.close().await.unwrap();
        assert!(!provider.is_open(&id));
        assert!(matches!(
            channel.write(b"x").await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_exclusive_open() {
        let provider = MemoryChannelProvider::new();
        let id = DeviceIdentity::port("mem0");
        provider.add_device(id.clone());

        let _first = provider.open(&id, &SerialConfig::default()).await.unwrap();
        let second = provider.open(&id, &SerialConfig::default()).await;
        assert!(matches!(second, Err(ChannelError::Busy(_))));
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let provider = MemoryChannelProvider::new();
        let result = provider
            .open(&DeviceIdentity::port("nope"), &SerialConfig::default())
            .await;
        assert!(matches!(result, Err(ChannelError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let provider = MemoryChannelProvider::new();
        let id = DeviceIdentity::port("mem0");
        provider.add_device(id.clone());
        let mut channel = provider.open(&id, &SerialConfig::default()).await.unwrap();

        let result = channel.read(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
    }

    #[tokio::test]
    async fn test_auto_respond() {
        let provider = MemoryChannelProvider::new();
        let id = DeviceIdentity::port("mem0");
        provider.add_device(id.clone());
        provider.auto_respond(&id, Some([0x80, 0x80, 0x81, 0x80, 0x80, 0x80]));
        let mut channel = provider.open(&id, &SerialConfig::default()).await.unwrap();

        let frame = FiscalCodec::new().cut().unwrap();
        channel.write(&frame).await.unwrap();

        let reply = channel.read(Duration::from_millis(10)).await.unwrap();
        let parsed = fiscal::parse_response(&reply);
        assert!(parsed.valid, "{:?}", parsed.error);
        assert_eq!(parsed.seq, Some(frame[2]));
        assert!(parsed.device_status().unwrap().paper_out);
    }
}
