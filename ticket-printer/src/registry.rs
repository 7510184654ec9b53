//! Printer session registry
//!
//! Owns every open channel, keyed by [`DeviceIdentity`]. At most one channel
//! is open per identity; connecting again closes the previous one first.
//! Callers get [`ConnectedPrinter`] snapshots and go through
//! [`PrinterRegistry::write`] / [`PrinterRegistry::read`] for I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{Channel, ChannelProvider, DeviceIdentity, SerialConfig};
use crate::error::{ChannelError, ConnectError, ReadError, StoreResult, WriteError};
use crate::storage::{KnownPrinter, KnownPrinterStore};

/// Registry-assigned handle of an open channel
pub type ChannelId = u64;

/// Snapshot of an open printer connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectedPrinter {
    pub identity: DeviceIdentity,
    pub handle: ChannelId,
    pub display_name: String,
    pub config: SerialConfig,
    pub connected_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Outcome of [`PrinterRegistry::reconnect_known`]
#[derive(Debug, Default)]
pub struct ReconnectReport {
    pub connected: Vec<ConnectedPrinter>,
    pub failed: Vec<(DeviceIdentity, ConnectError)>,
}

type SharedChannel = Arc<Mutex<Box<dyn Channel>>>;

struct OpenChannel {
    info: ConnectedPrinter,
    channel: SharedChannel,
}

/// Owner of all open printer channels
pub struct PrinterRegistry {
    provider: Arc<dyn ChannelProvider>,
    store: Arc<dyn KnownPrinterStore>,
    connections: DashMap<DeviceIdentity, OpenChannel>,
    job_locks: DashMap<DeviceIdentity, Arc<Mutex<()>>>,
    /// Serializes connect / disconnect so the close-then-open sequence is atomic
    admin: Mutex<()>,
    /// Serializes load-modify-save on the known-printer store
    store_lock: parking_lot::Mutex<()>,
    next_handle: AtomicU64,
}

impl PrinterRegistry {
    pub fn new(provider: Arc<dyn ChannelProvider>, store: Arc<dyn KnownPrinterStore>) -> Self {
        Self {
            provider,
            store,
            connections: DashMap::new(),
            job_locks: DashMap::new(),
            admin: Mutex::new(()),
            store_lock: parking_lot::Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Devices the host currently exposes, without opening any of them
    pub async fn list_known_devices(&self) -> Result<Vec<DeviceIdentity>, ConnectError> {
        Ok(self.provider.list_devices().await?)
    }

    /// Open a printer and remember it
    ///
    /// Any channel already open for `identity` is closed first. When the open
    /// fails nothing is registered or persisted.
    #[instrument(skip(self, name, config), fields(identity = %identity, baud = config.baud_rate))]
    pub async fn connect(
        &self,
        identity: &DeviceIdentity,
        name: &str,
        config: SerialConfig,
    ) -> Result<ConnectedPrinter, ConnectError> {
        let printer = self.open_and_register(identity, name, config).await?;

        let known = KnownPrinter {
            identity: identity.clone(),
            display_name: name.to_string(),
            config,
            last_connected_at: printer.connected_at,
        };
        if let Err(e) = self.remember(known) {
            warn!(error = %e, "Printer connected but could not be persisted");
        }

        Ok(printer)
    }

    async fn open_and_register(
        &self,
        identity: &DeviceIdentity,
        name: &str,
        config: SerialConfig,
    ) -> Result<ConnectedPrinter, ConnectError> {
        if config.baud_rate == 0 {
            return Err(ConnectError::ConfigRejected(
                "baud rate must be positive".to_string(),
            ));
        }

        let _admin = self.admin.lock().await;

        if let Some((_, stale)) = self.connections.remove(identity) {
            debug!(handle = stale.info.handle, "Closing stale channel before reopening");
            close_channel(&stale).await;
        }

        let channel = match self.provider.open(identity, &config).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Failed to open printer");
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let info = ConnectedPrinter {
            identity: identity.clone(),
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
            display_name: name.to_string(),
            config,
            connected_at: now,
            last_used_at: now,
        };
        self.connections.insert(
            identity.clone(),
            OpenChannel {
                info: info.clone(),
                channel: Arc::new(Mutex::new(channel)),
            },
        );

        info!(handle = info.handle, name = %name, "Printer connected");
        Ok(info)
    }

    /// Close and forget the open channel for `identity`
    ///
    /// Returns false when nothing was open.
    pub async fn disconnect(&self, identity: &DeviceIdentity) -> bool {
        let _admin = self.admin.lock().await;

        match self.connections.remove(identity) {
            Some((_, open)) => {
                close_channel(&open).await;
                info!(identity = %identity, handle = open.info.handle, "Printer disconnected");
                true
            }
            None => false,
        }
    }

    /// Close every open channel
    pub async fn disconnect_all(&self) {
        let _admin = self.admin.lock().await;

        let identities: Vec<_> = self.connections.iter().map(|e| e.key().clone()).collect();
        for identity in identities {
            if let Some((_, open)) = self.connections.remove(&identity) {
                close_channel(&open).await;
            }
        }
        info!("All printers disconnected");
    }

    pub fn get(&self, identity: &DeviceIdentity) -> Option<ConnectedPrinter> {
        self.connections.get(identity).map(|e| e.info.clone())
    }

    pub fn is_connected(&self, identity: &DeviceIdentity) -> bool {
        self.connections.contains_key(identity)
    }

    /// All open printers, sorted by display name
    pub fn list_connected(&self) -> Vec<ConnectedPrinter> {
        let mut printers: Vec<_> = self.connections.iter().map(|e| e.info.clone()).collect();
        printers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        printers
    }

    /// Persisted printers, most recently connected first
    pub fn known_printers(&self) -> StoreResult<Vec<KnownPrinter>> {
        let mut printers = self.store.load()?;
        printers.sort_by(|a, b| b.last_connected_at.cmp(&a.last_connected_at));
        Ok(printers)
    }

    /// The most recently connected known printer
    pub fn default_printer(&self) -> StoreResult<Option<KnownPrinter>> {
        Ok(self.known_printers()?.into_iter().next())
    }

    /// Disconnect a printer and drop its persisted record
    ///
    /// Returns whether a record was removed.
    pub async fn forget(&self, identity: &DeviceIdentity) -> StoreResult<bool> {
        self.disconnect(identity).await;

        let _store = self.store_lock.lock();
        let mut printers = self.store.load()?;
        let before = printers.len();
        printers.retain(|p| &p.identity != identity);
        if printers.len() == before {
            return Ok(false);
        }
        self.store.save(&printers)?;
        info!(identity = %identity, "Printer forgotten");
        Ok(true)
    }

    /// Reopen every persisted printer, best effort
    ///
    /// Failures are collected, never abort the loop. Stored connection times
    /// are left untouched so the default printer does not change.
    pub async fn reconnect_known(&self) -> ReconnectReport {
        let mut report = ReconnectReport::default();

        let known = match self.known_printers() {
            Ok(known) => known,
            Err(e) => {
                error!(error = %e, "Failed to load known printers");
                return report;
            }
        };

        for printer in known {
            match self
                .open_and_register(&printer.identity, &printer.display_name, printer.config)
                .await
            {
                Ok(connected) => report.connected.push(connected),
                Err(e) => {
                    warn!(identity = %printer.identity, error = %e, "Reconnect failed");
                    report.failed.push((printer.identity, e));
                }
            }
        }

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "Known printers reconnected"
        );
        report
    }

    /// Per-device job lock
    ///
    /// Jobs holding the guard for the same identity run one after another.
    pub async fn lock_device(&self, identity: &DeviceIdentity) -> OwnedMutexGuard<()> {
        let lock = self
            .job_locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Write bytes to an open printer
    pub async fn write(&self, identity: &DeviceIdentity, data: &[u8]) -> Result<(), WriteError> {
        let channel = self
            .channel(identity)
            .ok_or_else(|| WriteError::NotOpen(identity.clone()))?;

        channel
            .lock()
            .await
            .write(data)
            .await
            .map_err(|e| WriteError::Failed {
                identity: identity.clone(),
                reason: e.to_string(),
            })?;

        self.touch(identity);
        debug!(identity = %identity, bytes = data.len(), "Bytes written");
        Ok(())
    }

    /// Read one chunk from an open printer, waiting at most `timeout`
    pub async fn read(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Vec<u8>, ReadError> {
        let channel = self
            .channel(identity)
            .ok_or_else(|| ReadError::NotOpen(identity.clone()))?;

        let result = channel.lock().await.read(timeout).await;
        match result {
            Ok(bytes) => {
                self.touch(identity);
                debug!(identity = %identity, bytes = bytes.len(), "Bytes read");
                Ok(bytes)
            }
            Err(ChannelError::Timeout) => Err(ReadError::Timeout),
            Err(ChannelError::Closed) => Err(ReadError::NotOpen(identity.clone())),
            Err(e) => Err(ReadError::Failed {
                identity: identity.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn channel(&self, identity: &DeviceIdentity) -> Option<SharedChannel> {
        self.connections.get(identity).map(|e| e.channel.clone())
    }

    fn touch(&self, identity: &DeviceIdentity) {
        if let Some(mut entry) = self.connections.get_mut(identity) {
            entry.info.last_used_at = Utc::now();
        }
    }

    fn remember(&self, printer: KnownPrinter) -> StoreResult<()> {
        let _store = self.store_lock.lock();
        let mut printers = self.store.load()?;
        printers.retain(|p| p.identity != printer.identity);
        printers.push(printer);
        self.store.save(&printers)
    }
}

async fn close_channel(open: &OpenChannel) {
    if let Err(e) = open.channel.lock().await.close().await {
        warn!(identity = %open.info.identity, error = %e, "Failed to close channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryChannelProvider;
    use crate::error::StoreError;
    use crate::storage::MemoryKnownPrinterStore;

    fn setup() -> (MemoryChannelProvider, Arc<MemoryKnownPrinterStore>, PrinterRegistry) {
        let provider = MemoryChannelProvider::new();
        let store = Arc::new(MemoryKnownPrinterStore::new());
        let registry = PrinterRegistry::new(Arc::new(provider.clone()), store.clone());
        (provider, store, registry)
    }

    struct FailingStore;

    impl KnownPrinterStore for FailingStore {
        fn load(&self) -> StoreResult<Vec<KnownPrinter>> {
            Ok(Vec::new())
        }

        fn save(&self, _printers: &[KnownPrinter]) -> StoreResult<()> {
            Err(StoreError::Serialization(
                serde_json::from_str::<()>("not json").unwrap_err(),
            ))
        }
    }

    #[tokio::test]
    async fn test_connect_registers_and_persists() {
        let (provider, store, registry) = setup();
        let id = DeviceIdentity::usb(0x0416, 0x5011);
        provider.add_device(id.clone());

        let printer = registry
            .connect(&id, "Kitchen", SerialConfig::new(19200))
            .await
            .unwrap();

        assert_eq!(printer.display_name, "Kitchen");
        assert_eq!(registry.get(&id), Some(printer.clone()));
        assert_eq!(provider.last_config(&id), Some(SerialConfig::new(19200)));

        let known = store.load().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].identity, id);
        assert_eq!(known[0].last_connected_at, printer.connected_at);
    }

    #[tokio::test]
    async fn test_double_connect_keeps_one_channel() {
        let (provider, store, registry) = setup();
        let id = DeviceIdentity::port("/dev/ttyUSB0");
        provider.add_device(id.clone());

        let first = registry
            .connect(&id, "Front", SerialConfig::default())
            .await
            .unwrap();
        let second = registry
            .connect(&id, "Front", SerialConfig::new(38400))
            .await
            .unwrap();

        assert_ne!(first.handle, second.handle);
        assert_eq!(registry.list_connected().len(), 1);
        assert_eq!(registry.get(&id).unwrap().handle, second.handle);
        assert_eq!(provider.open_count(&id), 2);
        assert_eq!(provider.close_count(&id), 1);
        assert!(provider.is_open(&id));
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_registers_nothing() {
        let (provider, store, registry) = setup();
        let id = DeviceIdentity::port("COM4");
        provider.add_device(id.clone());
        provider.reject_opens(&id, true);

        let err = registry
            .connect(&id, "Bar", SerialConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::AccessDenied(_)));
        assert!(registry.get(&id).is_none());
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reopen_drops_stale_entry() {
        let (provider, _store, registry) = setup();
        let id = DeviceIdentity::port("COM4");
        provider.add_device(id.clone());

        registry
            .connect(&id, "Bar", SerialConfig::default())
            .await
            .unwrap();
        provider.reject_opens(&id, true);

        assert!(
            registry
                .connect(&id, "Bar", SerialConfig::default())
                .await
                .is_err()
        );
        assert!(registry.get(&id).is_none());
        assert!(!provider.is_open(&id));
    }

    #[tokio::test]
    async fn test_zero_baud_rejected_before_open() {
        let (provider, _store, registry) = setup();
        let id = DeviceIdentity::port("COM1");
        provider.add_device(id.clone());

        let err = registry
            .connect(&id, "X", SerialConfig::new(0))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::ConfigRejected(_)));
        assert_eq!(provider.open_count(&id), 0);
    }

    #[tokio::test]
    async fn test_unknown_device_not_found() {
        let (_provider, _store, registry) = setup();
        let err = registry
            .connect(&DeviceIdentity::port("COM9"), "X", SerialConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_fail_connect() {
        let provider = MemoryChannelProvider::new();
        let id = DeviceIdentity::port("COM1");
        provider.add_device(id.clone());
        let registry = PrinterRegistry::new(Arc::new(provider), Arc::new(FailingStore));

        assert!(
            registry
                .connect(&id, "Front", SerialConfig::default())
                .await
                .is_ok()
        );
        assert!(registry.is_connected(&id));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (provider, _store, registry) = setup();
        let id = DeviceIdentity::port("COM1");
        provider.add_device(id.clone());

        assert!(!registry.disconnect(&id).await);

        registry
            .connect(&id, "Front", SerialConfig::default())
            .await
            .unwrap();
        assert!(registry.disconnect(&id).await);
        assert!(registry.get(&id).is_none());
        assert!(!provider.is_open(&id));
        assert!(!registry.disconnect(&id).await);
    }

    #[tokio::test]
    async fn test_list_connected_sorted_by_name() {
        let (provider, _store, registry) = setup();
        for (path, name) in [("COM1", "Kitchen"), ("COM2", "Bar"), ("COM3", "Counter")] {
            let id = DeviceIdentity::port(path);
            provider.add_device(id.clone());
            registry
                .connect(&id, name, SerialConfig::default())
                .await
                .unwrap();
        }

        let names: Vec<_> = registry
            .list_connected()
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, ["Bar", "Counter", "Kitchen"]);

        registry.disconnect_all().await;
        assert!(registry.list_connected().is_empty());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (provider, _store, registry) = setup();
        let id = DeviceIdentity::port("COM1");
        provider.add_device(id.clone());

        assert!(matches!(
            registry.write(&id, b"x").await,
            Err(WriteError::NotOpen(_))
        ));

        registry
            .connect(&id, "Front", SerialConfig::default())
            .await
            .unwrap();
        registry.write(&id, b"hello").await.unwrap();
        assert_eq!(provider.written(&id), b"hello");

        provider.push_response(&id, vec![0x16]);
        assert_eq!(
            registry.read(&id, Duration::from_millis(10)).await.unwrap(),
            vec![0x16]
        );
        assert!(matches!(
            registry.read(&id, Duration::from_millis(10)).await,
            Err(ReadError::Timeout)
        ));

        provider.fail_writes(&id, true);
        assert!(matches!(
            registry.write(&id, b"x").await,
            Err(WriteError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_after_unplug_fails() {
        let (provider, _store, registry) = setup();
        let id = DeviceIdentity::usb(0x0416, 0x5011);
        provider.add_device(id.clone());
        registry
            .connect(&id, "Kitchen", SerialConfig::default())
            .await
            .unwrap();
        registry.write(&id, b"first").await.unwrap();

        provider.remove_device(&id);

        match registry.write(&id, b"second").await {
            Err(WriteError::Failed { identity, reason }) => {
                assert_eq!(identity, id);
                assert!(reason.contains("unplugged"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // the channel stays registered until disconnected
        assert!(registry.is_connected(&id));
        assert!(registry.disconnect(&id).await);
    }

    #[tokio::test]
    async fn test_reconnect_known_is_best_effort() {
        let (provider, store, registry) = setup();
        let present = DeviceIdentity::port("COM1");
        let missing = DeviceIdentity::port("COM2");
        provider.add_device(present.clone());

        let then = Utc::now() - chrono::Duration::days(1);
        store
            .save(&[
                KnownPrinter {
                    identity: present.clone(),
                    display_name: "Front".to_string(),
                    config: SerialConfig::default(),
                    last_connected_at: then,
                },
                KnownPrinter {
                    identity: missing.clone(),
                    display_name: "Back".to_string(),
                    config: SerialConfig::default(),
                    last_connected_at: then,
                },
            ])
            .unwrap();

        let report = registry.reconnect_known().await;
        assert_eq!(report.connected.len(), 1);
        assert_eq!(report.connected[0].identity, present);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, missing);

        // timestamps untouched
        assert!(store.load().unwrap().iter().all(|p| p.last_connected_at == then));
    }

    #[tokio::test]
    async fn test_default_printer_is_most_recent() {
        let (provider, _store, registry) = setup();
        assert!(registry.default_printer().unwrap().is_none());

        let a = DeviceIdentity::port("COM1");
        let b = DeviceIdentity::port("COM2");
        provider.add_device(a.clone());
        provider.add_device(b.clone());

        registry
            .connect(&a, "A", SerialConfig::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry
            .connect(&b, "B", SerialConfig::default())
            .await
            .unwrap();

        assert_eq!(registry.default_printer().unwrap().unwrap().identity, b);
    }

    #[tokio::test]
    async fn test_forget() {
        let (provider, store, registry) = setup();
        let id = DeviceIdentity::port("COM1");
        provider.add_device(id.clone());
        registry
            .connect(&id, "Front", SerialConfig::default())
            .await
            .unwrap();

        assert!(registry.forget(&id).await.unwrap());
        assert!(!registry.is_connected(&id));
        assert!(store.load().unwrap().is_empty());
        assert!(!registry.forget(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_device_lock_serializes_jobs() {
        let (_provider, _store, registry) = setup();
        let a = DeviceIdentity::port("COM1");
        let b = DeviceIdentity::port("COM2");

        let guard = registry.lock_device(&a).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), registry.lock_device(&a)).await;
        assert!(blocked.is_err());

        // other devices are independent
        let _other = registry.lock_device(&b).await;

        drop(guard);
        let _again = registry.lock_device(&a).await;
    }
}
