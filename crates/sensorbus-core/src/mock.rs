//! In-memory transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without any Bluetooth
//! hardware. It records every call it receives, so tests can assert the
//! exact sequence of writes, reads and subscriptions a session performs.
//!
//! # Features
//!
//! - **Call log**: every transport call in order, see [`MockTransport::calls`]
//! - **Failure injection**: transient or fatal connect failures, failing
//!   reads, writes and subscriptions per path
//! - **Notifications and disconnects** pushed from the test
//! - **Latency simulation** for every bus call
//!
//! # Example
//!
//! ```
//! use sensorbus_core::mock::MockTransport;
//! use sensorbus_types::{DeviceAddress, uuids::BATTERY_LEVEL};
//!
//! let address = DeviceAddress::new("AA:BB:CC:DD:EE:FF");
//! let mock = MockTransport::builder()
//!     .device(&address, [BATTERY_LEVEL])
//!     .value(&address, BATTERY_LEVEL, vec![87])
//!     .build();
//! assert!(mock.path(&address, BATTERY_LEVEL).is_some());
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use sensorbus_types::DeviceAddress;

use crate::error::{TransportError, TransportResult};
use crate::mailbox::Mailboxes;
use crate::transport::{CharacteristicPath, DisconnectSignals, Transport};

/// A call received by the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `connect`
    Connect(DeviceAddress),
    /// `disconnect`
    Disconnect(DeviceAddress),
    /// `discover_characteristics`
    Discover(DeviceAddress),
    /// `read_characteristic`
    Read(CharacteristicPath),
    /// `write_characteristic` with the written payload
    Write(CharacteristicPath, Bytes),
    /// `subscribe`
    Subscribe(CharacteristicPath),
    /// `unsubscribe`
    Unsubscribe(CharacteristicPath),
}

#[derive(Debug, Default)]
struct MockPeripheral {
    characteristics: HashMap<Uuid, CharacteristicPath>,
    values: HashMap<Uuid, Bytes>,
    connected: bool,
}

#[derive(Debug, Default)]
struct State {
    devices: HashMap<DeviceAddress, MockPeripheral>,
    owners: HashMap<CharacteristicPath, (DeviceAddress, Uuid)>,
    subscribed: HashSet<CharacteristicPath>,
    calls: Vec<TransportCall>,
    connect_failures: HashMap<DeviceAddress, u32>,
    fatal_connect: HashMap<DeviceAddress, String>,
    failing_reads: HashSet<CharacteristicPath>,
    failing_writes: HashSet<CharacteristicPath>,
    failing_subscribe: HashSet<CharacteristicPath>,
    failing_unsubscribe: HashSet<CharacteristicPath>,
}

impl State {
    fn rebuild_owners(&mut self) {
        self.owners = self
            .devices
            .iter()
            .flat_map(|(address, peripheral)| {
                peripheral
                    .characteristics
                    .iter()
                    .map(|(uuid, path)| (path.clone(), (address.clone(), *uuid)))
            })
            .collect();
    }

    fn connected_owner(&self, path: &CharacteristicPath) -> TransportResult<(DeviceAddress, Uuid)> {
        let (address, uuid) = self
            .owners
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::failed(format!("unknown path {path}")))?;
        match self.devices.get(&address) {
            Some(peripheral) if peripheral.connected => Ok((address, uuid)),
            _ => Err(TransportError::NotConnected(address)),
        }
    }
}

/// A transport backed by in-memory peripherals.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<State>,
    mailboxes: Mailboxes,
    disconnects: DisconnectSignals,
    /// Simulated latency of every bus call in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
}

impl MockTransport {
    /// Create a transport without devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a transport with devices.
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: TransportCall) {
        self.state().calls.push(call);
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Path of a characteristic.
    pub fn path(&self, address: &DeviceAddress, uuid: Uuid) -> Option<CharacteristicPath> {
        self.state()
            .devices
            .get(address)
            .and_then(|p| p.characteristics.get(&uuid))
            .cloned()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Payloads written to a path, in order.
    pub fn writes_to(&self, path: &CharacteristicPath) -> Vec<Bytes> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write(p, data) if p == path => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of reads of a path.
    pub fn reads_of(&self, path: &CharacteristicPath) -> usize {
        self.count(|call| matches!(call, TransportCall::Read(p) if p == path))
    }

    /// Number of connect attempts to a device.
    pub fn connects_to(&self, address: &DeviceAddress) -> usize {
        self.count(|call| matches!(call, TransportCall::Connect(a) if a == address))
    }

    fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Set the value returned by reads of a characteristic.
    pub fn set_value(&self, address: &DeviceAddress, uuid: Uuid, value: impl Into<Bytes>) {
        if let Some(peripheral) = self.state().devices.get_mut(address) {
            peripheral.values.insert(uuid, value.into());
        }
    }

    /// Set the simulated latency of every bus call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Fail the next `count` connect attempts with a timeout.
    pub fn fail_connect(&self, address: &DeviceAddress, count: u32) {
        self.state().connect_failures.insert(address.clone(), count);
    }

    /// Fail every connect attempt with a non-recoverable error.
    pub fn fail_connect_fatal(&self, address: &DeviceAddress, message: impl Into<String>) {
        self.state()
            .fatal_connect
            .insert(address.clone(), message.into());
    }

    /// Make reads of a path fail, or succeed again.
    pub fn fail_reads(&self, path: &CharacteristicPath, fail: bool) {
        toggle(&mut self.state().failing_reads, path, fail);
    }

    /// Make writes to a path fail, or succeed again.
    pub fn fail_writes(&self, path: &CharacteristicPath, fail: bool) {
        toggle(&mut self.state().failing_writes, path, fail);
    }

    /// Make subscribing to a path fail, or succeed again.
    pub fn fail_subscribe(&self, path: &CharacteristicPath, fail: bool) {
        toggle(&mut self.state().failing_subscribe, path, fail);
    }

    /// Make unsubscribing from a path fail, or succeed again.
    pub fn fail_unsubscribe(&self, path: &CharacteristicPath, fail: bool) {
        toggle(&mut self.state().failing_unsubscribe, path, fail);
    }

    /// Push a notification. Dropped unless the path is subscribed.
    ///
    /// Returns whether the notification was delivered.
    pub fn push_notification(&self, path: &CharacteristicPath, payload: impl Into<Bytes>) -> bool {
        if !self.state().subscribed.contains(path) {
            return false;
        }
        self.mailboxes.deliver(path, payload.into());
        true
    }

    /// Simulate the device dropping the connection.
    pub fn trigger_disconnect(&self, address: &DeviceAddress) {
        {
            let mut state = self.state();
            let Some(peripheral) = state.devices.get_mut(address) else {
                return;
            };
            peripheral.connected = false;
            let paths: Vec<_> = peripheral.characteristics.values().cloned().collect();
            for path in &paths {
                state.subscribed.remove(path);
                self.mailboxes.clear(path);
            }
        }
        self.disconnects.fire(address);
    }

    /// Whether the device is connected.
    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.state()
            .devices
            .get(address)
            .is_some_and(|p| p.connected)
    }

    /// Whether a path is subscribed.
    pub fn is_subscribed(&self, path: &CharacteristicPath) -> bool {
        self.state().subscribed.contains(path)
    }
}

fn toggle(set: &mut HashSet<CharacteristicPath>, path: &CharacteristicPath, on: bool) {
    if on {
        set.insert(path.clone());
    } else {
        set.remove(path);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &DeviceAddress) -> TransportResult<()> {
        self.record(TransportCall::Connect(address.clone()));
        self.delay().await;

        let mut state = self.state();
        if let Some(message) = state.fatal_connect.get(address) {
            return Err(TransportError::failed(message.clone()));
        }
        if let Some(remaining) = state.connect_failures.get_mut(address)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TransportError::timeout(
                format!("connect {address}"),
                Duration::ZERO,
            ));
        }
        let peripheral = state
            .devices
            .get_mut(address)
            .ok_or_else(|| TransportError::DeviceNotFound(address.clone()))?;
        peripheral.connected = true;
        self.disconnects.arm(address);
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress) -> TransportResult<()> {
        self.record(TransportCall::Disconnect(address.clone()));
        self.delay().await;

        let mut state = self.state();
        let peripheral = state
            .devices
            .get_mut(address)
            .ok_or_else(|| TransportError::DeviceNotFound(address.clone()))?;
        let was_connected = std::mem::replace(&mut peripheral.connected, false);
        let paths: Vec<_> = peripheral.characteristics.values().cloned().collect();
        for path in &paths {
            state.subscribed.remove(path);
            self.mailboxes.clear(path);
        }
        drop(state);
        if was_connected {
            self.disconnects.fire(address);
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        address: &DeviceAddress,
    ) -> TransportResult<HashMap<Uuid, CharacteristicPath>> {
        self.record(TransportCall::Discover(address.clone()));
        self.delay().await;

        let state = self.state();
        match state.devices.get(address) {
            Some(peripheral) if peripheral.connected => Ok(peripheral.characteristics.clone()),
            Some(_) => Err(TransportError::NotConnected(address.clone())),
            None => Err(TransportError::DeviceNotFound(address.clone())),
        }
    }

    async fn read_characteristic(&self, path: &CharacteristicPath) -> TransportResult<Bytes> {
        self.record(TransportCall::Read(path.clone()));
        self.delay().await;

        let state = self.state();
        let (address, uuid) = state.connected_owner(path)?;
        if state.failing_reads.contains(path) {
            return Err(TransportError::failed(format!("read of {path} rejected")));
        }
        Ok(state
            .devices
            .get(&address)
            .and_then(|p| p.values.get(&uuid))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_characteristic(
        &self,
        path: &CharacteristicPath,
        data: &[u8],
    ) -> TransportResult<()> {
        self.record(TransportCall::Write(path.clone(), Bytes::copy_from_slice(data)));
        self.delay().await;

        let mut state = self.state();
        let (address, uuid) = state.connected_owner(path)?;
        if state.failing_writes.contains(path) {
            return Err(TransportError::failed(format!("write to {path} rejected")));
        }
        if let Some(peripheral) = state.devices.get_mut(&address) {
            peripheral.values.insert(uuid, Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn subscribe(&self, path: &CharacteristicPath) -> TransportResult<()> {
        self.record(TransportCall::Subscribe(path.clone()));
        self.delay().await;

        let mut state = self.state();
        state.connected_owner(path)?;
        if state.failing_subscribe.contains(path) {
            return Err(TransportError::failed(format!("subscribe to {path} rejected")));
        }
        state.subscribed.insert(path.clone());
        Ok(())
    }

    async fn unsubscribe(&self, path: &CharacteristicPath) -> TransportResult<()> {
        self.record(TransportCall::Unsubscribe(path.clone()));
        self.delay().await;

        let mut state = self.state();
        state.connected_owner(path)?;
        if state.failing_unsubscribe.contains(path) {
            return Err(TransportError::failed(format!(
                "unsubscribe from {path} rejected"
            )));
        }
        state.subscribed.remove(path);
        self.mailboxes.clear(path);
        Ok(())
    }

    async fn next_notification(&self, path: &CharacteristicPath) -> TransportResult<Bytes> {
        if !self.state().subscribed.contains(path) {
            return Err(TransportError::failed(format!("{path} is not subscribed")));
        }
        let mailbox = self.mailboxes.get(path);
        Ok(mailbox.take().await)
    }

    async fn wait_disconnected(&self, address: &DeviceAddress) {
        self.disconnects.wait(address).await
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    state: State,
    latency: Duration,
}

impl MockTransportBuilder {
    /// Add a device exposing the given characteristics.
    ///
    /// Paths are assigned in the BlueZ layout unless overridden.
    #[must_use]
    pub fn device(mut self, address: &DeviceAddress, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        let peripheral = self.state.devices.entry(address.clone()).or_default();
        for uuid in uuids {
            let index = peripheral.characteristics.len() + 1;
            peripheral.characteristics.entry(uuid).or_insert_with(|| {
                CharacteristicPath::new(format!(
                    "/org/bluez/hci0/{}/char{index:04x}",
                    address.path_component()
                ))
            });
        }
        self
    }

    /// Set the initial value of a characteristic.
    #[must_use]
    pub fn value(mut self, address: &DeviceAddress, uuid: Uuid, value: impl Into<Bytes>) -> Self {
        self.state
            .devices
            .entry(address.clone())
            .or_default()
            .values
            .insert(uuid, value.into());
        self
    }

    /// Force the path of a characteristic.
    #[must_use]
    pub fn path_override(
        mut self,
        address: &DeviceAddress,
        uuid: Uuid,
        path: CharacteristicPath,
    ) -> Self {
        self.state
            .devices
            .entry(address.clone())
            .or_default()
            .characteristics
            .insert(uuid, path);
        self
    }

    /// Delay every bus call.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Build the transport.
    pub fn build(mut self) -> MockTransport {
        self.state.rebuild_owners();
        MockTransport {
            state: Mutex::new(self.state),
            mailboxes: Mailboxes::new(),
            disconnects: DisconnectSignals::new(),
            latency_ms: AtomicU64::new(self.latency.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorbus_types::uuids::{BATTERY_LEVEL, DEVICE_NAME};

    fn addr() -> DeviceAddress {
        DeviceAddress::new("aa:bb:cc:dd:ee:01")
    }

    #[tokio::test]
    async fn test_calls_are_recorded_in_order() {
        let a = addr();
        let mock = MockTransport::builder()
            .device(&a, [BATTERY_LEVEL])
            .value(&a, BATTERY_LEVEL, vec![90])
            .build();
        let path = mock.path(&a, BATTERY_LEVEL).unwrap();

        mock.connect(&a).await.unwrap();
        assert_eq!(mock.read_characteristic(&path).await.unwrap().as_ref(), &[90]);
        mock.write_characteristic(&path, &[1]).await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                TransportCall::Connect(a.clone()),
                TransportCall::Read(path.clone()),
                TransportCall::Write(path.clone(), Bytes::from_static(&[1])),
            ]
        );
        assert_eq!(mock.reads_of(&path), 1);
        assert_eq!(mock.writes_to(&path), vec![Bytes::from_static(&[1])]);
    }

    #[tokio::test]
    async fn test_default_paths_are_distinct() {
        let a = addr();
        let mock = MockTransport::builder()
            .device(&a, [BATTERY_LEVEL, DEVICE_NAME])
            .build();
        let battery = mock.path(&a, BATTERY_LEVEL).unwrap();
        let name = mock.path(&a, DEVICE_NAME).unwrap();
        assert_ne!(battery, name);
        assert!(battery.as_str().starts_with("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01/char"));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let a = addr();
        let mock = MockTransport::builder().device(&a, [BATTERY_LEVEL]).build();
        let path = mock.path(&a, BATTERY_LEVEL).unwrap();

        assert!(matches!(
            mock.read_characteristic(&path).await,
            Err(TransportError::NotConnected(_))
        ));
        assert!(matches!(
            mock.connect(&DeviceAddress::new("00:00:00:00:00:09")).await,
            Err(TransportError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_connect_failures() {
        let a = addr();
        let mock = MockTransport::builder().device(&a, [BATTERY_LEVEL]).build();
        mock.fail_connect(&a, 2);

        assert!(mock.connect(&a).await.unwrap_err().is_recoverable());
        assert!(mock.connect(&a).await.is_err());
        mock.connect(&a).await.unwrap();
        assert_eq!(mock.connects_to(&a), 3);
    }

    #[tokio::test]
    async fn test_notifications_need_subscription() {
        let a = addr();
        let mock = MockTransport::builder().device(&a, [BATTERY_LEVEL]).build();
        let path = mock.path(&a, BATTERY_LEVEL).unwrap();
        mock.connect(&a).await.unwrap();

        assert!(!mock.push_notification(&path, vec![1]));
        mock.subscribe(&path).await.unwrap();
        assert!(mock.push_notification(&path, vec![2]));
        assert_eq!(mock.next_notification(&path).await.unwrap().as_ref(), &[2]);

        mock.unsubscribe(&path).await.unwrap();
        assert!(mock.next_notification(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_disconnect_wakes_waiter() {
        let a = addr();
        let mock = MockTransport::builder().device(&a, [BATTERY_LEVEL]).build();
        mock.connect(&a).await.unwrap();
        mock.trigger_disconnect(&a);
        assert!(!mock.is_connected(&a));

        tokio::time::timeout(Duration::from_secs(1), mock.wait_disconnected(&a))
            .await
            .unwrap();
    }
}
