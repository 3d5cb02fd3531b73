//! The boundary to the Bluetooth stack.
//!
//! A [`Transport`] owns the single underlying connection to the system's
//! Bluetooth stack and exposes raw, path-keyed characteristic primitives.
//! Anything that pumps events (notification streams, adapter events) is run
//! by the transport itself as tasks on the caller's runtime.
//!
//! Timeouts are not applied here; the [`Bus`](crate::bus::Bus) wraps every
//! call with the configured timeout.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use uuid::Uuid;

use sensorbus_types::DeviceAddress;

use crate::error::TransportResult;

/// Transport-specific locator of a characteristic on a connected device.
///
/// Valid only while the device stays connected; re-resolved after every
/// reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicPath(String);

impl CharacteristicPath {
    /// Wrap a transport path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacteristicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw asynchronous access to peripherals.
///
/// Implemented by [`BleTransport`](crate::ble::BleTransport) for real
/// hardware and [`MockTransport`](crate::mock::MockTransport) for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a bus-level connection to the device.
    async fn connect(&self, address: &DeviceAddress) -> TransportResult<()>;

    /// Tear the connection down.
    async fn disconnect(&self, address: &DeviceAddress) -> TransportResult<()>;

    /// Discover the characteristics of a connected device.
    ///
    /// Returns one path per characteristic UUID.
    async fn discover_characteristics(
        &self,
        address: &DeviceAddress,
    ) -> TransportResult<HashMap<Uuid, CharacteristicPath>>;

    /// Read the current value of a characteristic.
    async fn read_characteristic(&self, path: &CharacteristicPath) -> TransportResult<Bytes>;

    /// Write a value to a characteristic, with response.
    async fn write_characteristic(
        &self,
        path: &CharacteristicPath,
        data: &[u8],
    ) -> TransportResult<()>;

    /// Arm push delivery for a characteristic.
    async fn subscribe(&self, path: &CharacteristicPath) -> TransportResult<()>;

    /// Disarm push delivery and drop any undelivered payload.
    async fn unsubscribe(&self, path: &CharacteristicPath) -> TransportResult<()>;

    /// Wait for the next notification of a subscribed characteristic.
    ///
    /// At most one undelivered payload is buffered per characteristic; a
    /// newer payload replaces an older one.
    async fn next_notification(&self, path: &CharacteristicPath) -> TransportResult<Bytes>;

    /// Resolve once the transport observes the device disconnecting.
    ///
    /// A disconnect observed while nobody waits is remembered until the
    /// next call, and forgotten on the next `connect`.
    async fn wait_disconnected(&self, address: &DeviceAddress);
}

/// Per-address disconnect signals shared by transport implementations.
#[derive(Debug, Default)]
pub struct DisconnectSignals {
    signals: Mutex<HashMap<DeviceAddress, Arc<Notify>>>,
}

impl DisconnectSignals {
    /// Create an empty signal table.
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, address: &DeviceAddress) -> Arc<Notify> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(signals.entry(address.clone()).or_default())
    }

    /// Forget any stale disconnect for the address.
    pub fn arm(&self, address: &DeviceAddress) {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        signals.insert(address.clone(), Arc::new(Notify::new()));
    }

    /// Report that the address disconnected.
    pub fn fire(&self, address: &DeviceAddress) {
        self.signal(address).notify_one();
    }

    /// Wait until the address disconnects.
    pub async fn wait(&self, address: &DeviceAddress) {
        self.signal(address).notified().await;
    }
}
