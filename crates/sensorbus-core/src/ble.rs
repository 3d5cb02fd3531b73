//! Bluetooth LE transport on top of btleplug.
//!
//! [`BleTransport`] owns one adapter handle shared by every device of a
//! session. It runs two kinds of background tasks on the caller's runtime:
//!
//! - one adapter event pump, turning `DeviceDisconnected` events into the
//!   per-address disconnect signal,
//! - one notification pump per connected peripheral, routing each
//!   notification into the mailbox of its characteristic path.
//!
//! Characteristic paths are synthesized as
//! `{adapter}/dev_AA_BB_CC_DD_EE_FF/service{uuid}/char{uuid}`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use sensorbus_types::DeviceAddress;

use crate::error::{TransportError, TransportResult};
use crate::mailbox::Mailboxes;
use crate::transport::{CharacteristicPath, DisconnectSignals, Transport};

/// How long to scan for a device that the adapter does not know yet.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type Routes = HashMap<DeviceAddress, HashMap<Uuid, CharacteristicPath>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Format a peripheral ID as a string.
///
/// On macOS peripheral IDs are UUIDs; elsewhere they wrap the address.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Address of a peripheral.
///
/// CoreBluetooth reports a zero address, in which case the peripheral ID
/// stands in for it.
fn peripheral_address(address: BDAddr, id: &PeripheralId) -> DeviceAddress {
    let address = address.to_string();
    if address == "00:00:00:00:00:00" {
        DeviceAddress::new(&format_peripheral_id(id))
    } else {
        DeviceAddress::new(&address)
    }
}

/// Record the path of a characteristic UUID. The first service exposing
/// the UUID keeps it; returns false for later duplicates.
fn insert_route(
    routes: &mut HashMap<Uuid, CharacteristicPath>,
    uuid: Uuid,
    path: CharacteristicPath,
) -> bool {
    match routes.entry(uuid) {
        Entry::Vacant(entry) => {
            entry.insert(path);
            true
        }
        Entry::Occupied(_) => false,
    }
}

/// Adapter scan shared by every concurrent device lookup.
///
/// The first finder starts the scan and the last one stops it. Start and
/// stop run under the lock so they cannot interleave.
#[derive(Debug, Default)]
struct SharedScan {
    finders: tokio::sync::Mutex<usize>,
}

impl SharedScan {
    async fn join<F, Fut>(&self, start: F) -> TransportResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TransportResult<()>>,
    {
        let mut finders = self.finders.lock().await;
        if *finders == 0 {
            start().await?;
        }
        *finders += 1;
        Ok(())
    }

    async fn leave<F, Fut>(&self, stop: F) -> TransportResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TransportResult<()>>,
    {
        let mut finders = self.finders.lock().await;
        *finders = finders.saturating_sub(1);
        if *finders == 0 {
            stop().await?;
        }
        Ok(())
    }
}

fn characteristic_path(
    adapter: &str,
    address: &DeviceAddress,
    service: Uuid,
    characteristic: Uuid,
) -> CharacteristicPath {
    CharacteristicPath::new(format!(
        "{adapter}/{}/service{}/char{}",
        address.path_component(),
        service.simple(),
        characteristic.simple()
    ))
}

/// Transport backed by a btleplug adapter.
pub struct BleTransport {
    adapter: Adapter,
    adapter_name: String,
    scan_timeout: Duration,
    scan: SharedScan,
    peripherals: Mutex<HashMap<DeviceAddress, Peripheral>>,
    characteristics: Mutex<HashMap<CharacteristicPath, (DeviceAddress, Characteristic)>>,
    routes: Arc<Mutex<Routes>>,
    ids: Arc<Mutex<HashMap<PeripheralId, DeviceAddress>>>,
    mailboxes: Arc<Mailboxes>,
    disconnects: Arc<DisconnectSignals>,
    pumps: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    adapter_pump: JoinHandle<()>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("adapter", &self.adapter_name)
            .field("connected", &lock(&self.peripherals).len())
            .finish()
    }
}

impl BleTransport {
    /// Open the first Bluetooth adapter.
    pub async fn new() -> TransportResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterUnavailable)?;
        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> TransportResult<Self> {
        let info = adapter.adapter_info().await?;
        let adapter_name = info
            .split_whitespace()
            .next()
            .unwrap_or("hci0")
            .to_string();
        info!(adapter = %info, "using Bluetooth adapter");

        let ids = Arc::new(Mutex::new(HashMap::new()));
        let disconnects = Arc::new(DisconnectSignals::new());
        let events = adapter.events().await?;
        let adapter_pump = tokio::spawn(pump_adapter_events(
            events,
            Arc::clone(&ids),
            Arc::clone(&disconnects),
        ));

        Ok(Self {
            adapter,
            adapter_name,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            scan: SharedScan::default(),
            peripherals: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
            routes: Arc::new(Mutex::new(HashMap::new())),
            ids,
            mailboxes: Arc::new(Mailboxes::new()),
            disconnects,
            pumps: Mutex::new(HashMap::new()),
            adapter_pump,
        })
    }

    /// Set how long to scan for unknown devices.
    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    async fn known_peripheral(&self, address: &DeviceAddress) -> TransportResult<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if peripheral_address(properties.address, &peripheral.id()) == *address {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> TransportResult<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(address).await? {
            return Ok(peripheral);
        }

        info!(address = %address, timeout = ?self.scan_timeout, "scanning for device");
        self.scan
            .join(move || async move {
                self.adapter
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(TransportError::from)
            })
            .await?;
        let deadline = Instant::now() + self.scan_timeout;
        let found = loop {
            match self.known_peripheral(address).await {
                Ok(Some(peripheral)) => break Ok(Some(peripheral)),
                Ok(None) if Instant::now() >= deadline => break Ok(None),
                Ok(None) => sleep(SCAN_POLL_INTERVAL).await,
                Err(e) => break Err(e),
            }
        };
        let stopped = self
            .scan
            .leave(move || async move {
                self.adapter.stop_scan().await.map_err(TransportError::from)
            })
            .await;
        if let Err(e) = stopped {
            debug!(error = %e, "failed to stop scan");
        }
        found?.ok_or_else(|| TransportError::DeviceNotFound(address.clone()))
    }

    fn connected(&self, address: &DeviceAddress) -> TransportResult<Peripheral> {
        lock(&self.peripherals)
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(address.clone()))
    }

    fn characteristic(&self, path: &CharacteristicPath) -> TransportResult<(Peripheral, Characteristic)> {
        let (address, characteristic) = lock(&self.characteristics)
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::failed(format!("unknown path {path}")))?;
        Ok((self.connected(&address)?, characteristic))
    }

    fn forget_paths(&self, address: &DeviceAddress) {
        lock(&self.characteristics).retain(|_, (owner, _)| owner != address);
        if let Some(paths) = lock(&self.routes).remove(address) {
            for path in paths.values() {
                self.mailboxes.clear(path);
            }
        }
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.adapter_pump.abort();
        for (_, pump) in lock(&self.pumps).drain() {
            pump.abort();
        }
    }
}

async fn pump_adapter_events(
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ids: Arc<Mutex<HashMap<PeripheralId, DeviceAddress>>>,
    disconnects: Arc<DisconnectSignals>,
) {
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(id) = event {
            let address = lock(&ids).get(&id).cloned();
            if let Some(address) = address {
                debug!(address = %address, "adapter reported disconnect");
                disconnects.fire(&address);
            }
        }
    }
    debug!("adapter event stream ended");
}

async fn pump_notifications(
    address: DeviceAddress,
    peripheral: Peripheral,
    routes: Arc<Mutex<Routes>>,
    mailboxes: Arc<Mailboxes>,
    disconnects: Arc<DisconnectSignals>,
) {
    let mut stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(address = %address, error = %e, "notification stream unavailable");
            return;
        }
    };
    while let Some(notification) = stream.next().await {
        let path = lock(&routes)
            .get(&address)
            .and_then(|paths| paths.get(&notification.uuid))
            .cloned();
        match path {
            Some(path) => {
                if mailboxes.deliver(&path, Bytes::from(notification.value)) {
                    trace!(path = %path, "undelivered notification replaced");
                }
            }
            None => trace!(address = %address, uuid = %notification.uuid, "unrouted notification"),
        }
    }
    debug!(address = %address, "notification stream ended");
    disconnects.fire(&address);
}

#[async_trait]
impl Transport for BleTransport {
    #[tracing::instrument(level = "info", skip_all, fields(address = %address))]
    async fn connect(&self, address: &DeviceAddress) -> TransportResult<()> {
        let peripheral = self.find_peripheral(address).await?;
        self.disconnects.arm(address);
        lock(&self.ids).insert(peripheral.id(), address.clone());

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let pump = tokio::spawn(pump_notifications(
            address.clone(),
            peripheral.clone(),
            Arc::clone(&self.routes),
            Arc::clone(&self.mailboxes),
            Arc::clone(&self.disconnects),
        ));
        if let Some(stale) = lock(&self.pumps).insert(address.clone(), pump) {
            stale.abort();
        }
        lock(&self.peripherals).insert(address.clone(), peripheral);
        info!("connected");
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress) -> TransportResult<()> {
        if let Some(pump) = lock(&self.pumps).remove(address) {
            pump.abort();
        }
        self.forget_paths(address);
        let peripheral = lock(&self.peripherals).remove(address);
        match peripheral {
            Some(peripheral) => {
                peripheral.disconnect().await?;
                debug!(address = %address, "disconnected");
            }
            None => debug!(address = %address, "disconnect of unconnected device"),
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        address: &DeviceAddress,
    ) -> TransportResult<HashMap<Uuid, CharacteristicPath>> {
        let peripheral = self.connected(address)?;
        peripheral.discover_services().await?;

        let mut discovered = HashMap::new();
        let mut by_path = Vec::new();
        for characteristic in peripheral.characteristics() {
            let path = characteristic_path(
                &self.adapter_name,
                address,
                characteristic.service_uuid,
                characteristic.uuid,
            );
            if !insert_route(&mut discovered, characteristic.uuid, path.clone()) {
                debug!(
                    address = %address,
                    uuid = %characteristic.uuid,
                    service = %characteristic.service_uuid,
                    "characteristic also exposed by an earlier service, keeping the first"
                );
            }
            by_path.push((path, characteristic));
        }

        self.forget_paths(address);
        lock(&self.characteristics).extend(
            by_path
                .into_iter()
                .map(|(path, characteristic)| (path, (address.clone(), characteristic))),
        );
        lock(&self.routes).insert(address.clone(), discovered.clone());
        debug!(address = %address, count = discovered.len(), "characteristics discovered");
        Ok(discovered)
    }

    async fn read_characteristic(&self, path: &CharacteristicPath) -> TransportResult<Bytes> {
        let (peripheral, characteristic) = self.characteristic(path)?;
        let value = peripheral.read(&characteristic).await?;
        trace!(path = %path, len = value.len(), "read");
        Ok(Bytes::from(value))
    }

    async fn write_characteristic(
        &self,
        path: &CharacteristicPath,
        data: &[u8],
    ) -> TransportResult<()> {
        let (peripheral, characteristic) = self.characteristic(path)?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;
        trace!(path = %path, len = data.len(), "written");
        Ok(())
    }

    async fn subscribe(&self, path: &CharacteristicPath) -> TransportResult<()> {
        let (peripheral, characteristic) = self.characteristic(path)?;
        self.mailboxes.clear(path);
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, path: &CharacteristicPath) -> TransportResult<()> {
        let (peripheral, characteristic) = self.characteristic(path)?;
        let result = peripheral.unsubscribe(&characteristic).await;
        self.mailboxes.clear(path);
        result.map_err(TransportError::from)
    }

    async fn next_notification(&self, path: &CharacteristicPath) -> TransportResult<Bytes> {
        self.characteristic(path)?;
        let mailbox = self.mailboxes.get(path);
        Ok(mailbox.take().await)
    }

    async fn wait_disconnected(&self, address: &DeviceAddress) {
        self.disconnects.wait(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sensorbus_types::uuids::{BATTERY_LEVEL, BATTERY_SERVICE, DEVICE_INFO_SERVICE};

    #[test]
    fn test_characteristic_path_layout() {
        let address = DeviceAddress::new("a0:e6:f8:00:11:22");
        let path = characteristic_path("hci0", &address, BATTERY_SERVICE, BATTERY_LEVEL);
        assert_eq!(
            path.as_str(),
            "hci0/dev_A0_E6_F8_00_11_22/service0000180f00001000800000805f9b34fb/char00002a1900001000800000805f9b34fb"
        );
    }

    #[test]
    fn test_paths_differ_per_device() {
        let a = characteristic_path("hci0", &DeviceAddress::new("aa:aa:aa:aa:aa:01"), BATTERY_SERVICE, BATTERY_LEVEL);
        let b = characteristic_path("hci0", &DeviceAddress::new("aa:aa:aa:aa:aa:02"), BATTERY_SERVICE, BATTERY_LEVEL);
        assert_ne!(a, b);
    }

    #[test]
    fn test_duplicate_characteristic_keeps_first_service() {
        let address = DeviceAddress::new("a0:e6:f8:00:11:22");
        let first = characteristic_path("hci0", &address, BATTERY_SERVICE, BATTERY_LEVEL);
        let second = characteristic_path("hci0", &address, DEVICE_INFO_SERVICE, BATTERY_LEVEL);

        let mut routes = HashMap::new();
        assert!(insert_route(&mut routes, BATTERY_LEVEL, first.clone()));
        assert!(!insert_route(&mut routes, BATTERY_LEVEL, second));
        assert_eq!(routes.get(&BATTERY_LEVEL), Some(&first));
    }

    #[tokio::test]
    async fn test_shared_scan_runs_until_last_finder_leaves() {
        let scan = SharedScan::default();
        let (starts, stops) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (started, stopped) = (&starts, &stops);
        let start = move || async move {
            started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let stop = move || async move {
            stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        scan.join(start).await.unwrap();
        scan.join(start).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        scan.leave(stop).await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 0, "scan stopped under a running finder");

        scan.leave(stop).await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        scan.join(start).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shared_scan_failed_start_is_not_counted() {
        let scan = SharedScan::default();
        let result = scan
            .join(|| async { Err(TransportError::AdapterUnavailable) })
            .await;
        assert!(result.is_err());

        let starts = AtomicUsize::new(0);
        let started = &starts;
        scan.join(move || async move {
            started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }
}
