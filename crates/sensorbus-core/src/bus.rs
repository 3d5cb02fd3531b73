//! Bus adapter: path resolution and timeouts.
//!
//! The [`Bus`] sits between the session and the [`Transport`]. It keeps the
//! table of resolved characteristic paths per device (written on connect,
//! cleared on disconnect, read by every operation) and wraps every
//! transport call in the configured timeout.
//!
//! A path is owned by exactly one device. Discovery results that would
//! alias a path already owned by another device are rejected, so the
//! transport's event pumps can never deliver a completion or notification
//! to the wrong device.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use sensorbus_types::DeviceAddress;

use crate::config::SessionConfig;
use crate::error::{TransportError, TransportResult};
use crate::transport::{CharacteristicPath, Transport};

#[derive(Debug, Default)]
struct PathTable {
    by_device: HashMap<DeviceAddress, HashMap<Uuid, CharacteristicPath>>,
    owners: HashMap<CharacteristicPath, DeviceAddress>,
}

/// Shared transport plus the read-mostly path table.
pub struct Bus {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    paths: RwLock<PathTable>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths = self.paths.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Bus")
            .field("config", &self.config)
            .field("resolved_devices", &paths.by_device.len())
            .finish()
    }
}

async fn timed<T>(
    duration: Duration,
    operation: impl FnOnce() -> String,
    call: impl Future<Output = TransportResult<T>>,
) -> TransportResult<T> {
    timeout(duration, call)
        .await
        .map_err(|_| TransportError::timeout(operation(), duration))?
}

impl Bus {
    /// Create a bus over a transport.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            paths: RwLock::new(PathTable::default()),
        }
    }

    /// The timeouts in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Connect to a device.
    pub async fn connect(&self, address: &DeviceAddress) -> TransportResult<()> {
        timed(
            self.config.connect_timeout,
            || format!("connect {address}"),
            self.transport.connect(address),
        )
        .await
    }

    /// Disconnect from a device.
    pub async fn disconnect(&self, address: &DeviceAddress) -> TransportResult<()> {
        timed(
            self.config.disconnect_timeout,
            || format!("disconnect {address}"),
            self.transport.disconnect(address),
        )
        .await
    }

    /// Discover and record the characteristic paths of a connected device.
    ///
    /// Returns the number of resolved characteristics.
    pub async fn resolve(&self, address: &DeviceAddress) -> TransportResult<usize> {
        let discovered = timed(
            self.config.discovery_timeout,
            || format!("discover characteristics of {address}"),
            self.transport.discover_characteristics(address),
        )
        .await?;

        let mut table = self.paths.write().unwrap_or_else(PoisonError::into_inner);
        for path in discovered.values() {
            if let Some(owner) = table.owners.get(path)
                && owner != address
            {
                return Err(TransportError::PathAliased {
                    path: path.clone(),
                    address: address.clone(),
                    owner: owner.clone(),
                });
            }
        }

        if let Some(stale) = table.by_device.remove(address) {
            for path in stale.values() {
                table.owners.remove(path);
            }
        }
        for path in discovered.values() {
            table.owners.insert(path.clone(), address.clone());
        }
        let count = discovered.len();
        table.by_device.insert(address.clone(), discovered);
        debug!(address = %address, count, "characteristic paths resolved");
        Ok(count)
    }

    /// Drop the resolved paths of a device.
    pub fn forget(&self, address: &DeviceAddress) {
        let mut table = self.paths.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(paths) = table.by_device.remove(address) {
            for path in paths.values() {
                table.owners.remove(path);
            }
            debug!(address = %address, "characteristic paths forgotten");
        }
    }

    /// Whether the device currently has resolved paths.
    pub fn is_resolved(&self, address: &DeviceAddress) -> bool {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_device
            .contains_key(address)
    }

    /// Path of a characteristic on a resolved device.
    pub fn path(&self, address: &DeviceAddress, uuid: Uuid) -> TransportResult<CharacteristicPath> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_device
            .get(address)
            .and_then(|paths| paths.get(&uuid))
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                address: address.clone(),
                uuid,
            })
    }

    /// Read a characteristic.
    pub async fn read(&self, path: &CharacteristicPath) -> TransportResult<Bytes> {
        timed(
            self.config.read_timeout,
            || format!("read {path}"),
            self.transport.read_characteristic(path),
        )
        .await
    }

    /// Write a characteristic.
    pub async fn write(&self, path: &CharacteristicPath, data: &[u8]) -> TransportResult<()> {
        timed(
            self.config.write_timeout,
            || format!("write {path}"),
            self.transport.write_characteristic(path, data),
        )
        .await
    }

    /// Arm notifications.
    pub async fn subscribe(&self, path: &CharacteristicPath) -> TransportResult<()> {
        timed(
            self.config.write_timeout,
            || format!("subscribe {path}"),
            self.transport.subscribe(path),
        )
        .await
    }

    /// Disarm notifications.
    pub async fn unsubscribe(&self, path: &CharacteristicPath) -> TransportResult<()> {
        timed(
            self.config.write_timeout,
            || format!("unsubscribe {path}"),
            self.transport.unsubscribe(path),
        )
        .await
    }

    /// Wait for the next notification, bounded by the notification timeout
    /// if one is configured.
    pub async fn next_notification(&self, path: &CharacteristicPath) -> TransportResult<Bytes> {
        match self.config.notification_timeout {
            Some(duration) => {
                timed(
                    duration,
                    || format!("notification on {path}"),
                    self.transport.next_notification(path),
                )
                .await
            }
            None => self.transport.next_notification(path).await,
        }
    }

    /// Wait until the transport reports the device disconnected.
    pub async fn wait_disconnected(&self, address: &DeviceAddress) {
        self.transport.wait_disconnected(address).await
    }
}
