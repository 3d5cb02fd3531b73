//! Device operations dispatched by capability.
//!
//! Every operation follows the same shape: check the session is active,
//! wait for the device to be ready, then run the bus calls as a submitted
//! operation so that a disconnect or a session stop cancels it.
//!
//! `disable` is teardown and never returns an error. Each of its steps is
//! attempted on its own and logged.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sensorbus_types::DeviceAddress;

use crate::bus::Bus;
use crate::capability::Capability;
use crate::error::{Error, Result, TransportResult};
use crate::registration::{DeviceRegistration, DeviceSpec};
use crate::session::Session;

impl Session {
    /// Read one value from a device.
    ///
    /// Poll devices are read directly; notifying devices yield their next
    /// notification, which requires the device to be enabled.
    pub async fn read<T: Send + 'static>(&self, registration: &DeviceRegistration<T>) -> Result<T> {
        self.ensure_active()?;
        self.wait_connected(registration.address()).await?;

        let bus = Arc::clone(self.bus());
        let spec = Arc::clone(registration.spec());
        let decode = registration.decoder();
        self.submit_operation(registration.spec(), async move {
            let address = spec.address();
            let payload = read_payload(&bus, &spec)
                .await
                .map_err(|e| Error::read(address, e))?;
            decode(&payload).map_err(|e| Error::read(address, e))
        })?
        .await
    }

    /// Read values for as long as the session is active.
    ///
    /// Cancellations caused by the device disconnecting are skipped, so the
    /// stream resumes once the device is back. The stream ends when the
    /// session stops. Other errors are yielded and reading continues.
    pub fn read_stream<T: Send + 'static>(
        &self,
        registration: &DeviceRegistration<T>,
    ) -> impl Stream<Item = Result<T>> + Send + 'static {
        let state = (self.clone(), registration.clone());
        futures::stream::unfold(state, |(session, registration)| async move {
            loop {
                if !session.is_active() {
                    return None;
                }
                match session.read(&registration).await {
                    Err(e) if e.is_cancelled() => {
                        debug!(device = %registration, error = %e, "read cancelled");
                    }
                    result => return Some((result, (session, registration))),
                }
            }
        })
    }

    /// Switch a device on.
    ///
    /// Writes the config "on" payload (the notification variant for
    /// notifying devices), then the registered interval if any, then arms
    /// notifications for notifying devices.
    pub async fn enable<T>(&self, registration: &DeviceRegistration<T>) -> Result<()> {
        self.ensure_active()?;
        self.wait_connected(registration.address()).await?;

        let bus = Arc::clone(self.bus());
        let spec = Arc::clone(registration.spec());
        self.submit_operation(registration.spec(), async move { enable_device(&bus, &spec).await })?
            .await
    }

    /// Switch a device off. Never fails.
    ///
    /// Does nothing if the session is not active or the device is not
    /// connected. Otherwise disarms notifications, then writes the config
    /// "off" payload; each step is attempted even if the previous one
    /// failed.
    pub async fn disable<T>(&self, registration: &DeviceRegistration<T>) {
        if !self.is_active() || !self.is_connected(registration.address()) {
            debug!(device = %registration, "device not connected, nothing to disable");
            return;
        }

        let bus = Arc::clone(self.bus());
        let spec = Arc::clone(registration.spec());
        let submitted = self.submit_operation(registration.spec(), async move {
            disable_device(&bus, &spec).await;
            Ok(())
        });
        match submitted {
            Ok(handle) => {
                if let Err(e) = handle.await {
                    debug!(device = %registration, error = %e, "disable interrupted");
                }
            }
            Err(e) => debug!(device = %registration, error = %e, "disable skipped"),
        }
    }

    /// Set the sampling interval of a device, in seconds.
    ///
    /// Fails with [`Error::Configuration`] before touching the bus if the
    /// device has no period characteristic or the interval is out of range.
    pub async fn set_interval<T>(
        &self,
        registration: &DeviceRegistration<T>,
        seconds: f64,
    ) -> Result<()> {
        let address = registration.address();
        let period = registration.capability().period().ok_or_else(|| {
            Error::configuration(address, "device has no sampling period characteristic")
        })?;
        let native = period
            .encode(seconds)
            .map_err(|message| Error::configuration(address, message))?;
        let uuid = period.uuid;

        self.ensure_active()?;
        self.wait_connected(address).await?;

        let bus = Arc::clone(self.bus());
        let spec = Arc::clone(registration.spec());
        self.submit_operation(registration.spec(), async move {
            write_period(&bus, spec.address(), uuid, native).await
        })?
        .await
    }

    /// Write raw bytes to the data characteristic of a device.
    pub async fn write<T>(&self, registration: &DeviceRegistration<T>, data: impl Into<Bytes>) -> Result<()> {
        self.ensure_active()?;
        self.wait_connected(registration.address()).await?;

        let data = data.into();
        let bus = Arc::clone(self.bus());
        let spec = Arc::clone(registration.spec());
        self.submit_operation(registration.spec(), async move {
            let path = bus.path(spec.address(), spec.capability().data())?;
            bus.write(&path, &data).await?;
            Ok::<_, Error>(())
        })?
        .await
    }
}

async fn read_payload(bus: &Bus, spec: &DeviceSpec) -> TransportResult<Bytes> {
    let path = bus.path(spec.address(), spec.capability().data())?;
    if spec.capability().is_notifying() {
        bus.next_notification(&path).await
    } else {
        bus.read(&path).await
    }
}

async fn write_period(bus: &Bus, address: &DeviceAddress, uuid: Uuid, native: u8) -> Result<()> {
    let path = bus
        .path(address, uuid)
        .map_err(|e| Error::configuration_write(address, "period characteristic unavailable", e))?;
    bus.write(&path, &[native])
        .await
        .map_err(|e| Error::configuration_write(address, format!("writing period {native} failed"), e))?;
    debug!(address = %address, native, "period written");
    Ok(())
}

/// Run the enable steps of a device on a connected bus.
pub(crate) async fn enable_device(bus: &Bus, spec: &DeviceSpec) -> Result<()> {
    let address = spec.address();
    let capability = spec.capability();

    if let Some(config) = capability.config() {
        let path = bus
            .path(address, config.uuid)
            .map_err(|e| Error::configuration_write(address, "config characteristic unavailable", e))?;
        bus.write(&path, config.on_payload(capability.is_notifying()))
            .await
            .map_err(|e| Error::configuration_write(address, "writing config on payload failed", e))?;
    }

    if let (Some(period), Some(seconds)) = (capability.period(), spec.interval()) {
        let native = period
            .encode(seconds)
            .map_err(|message| Error::configuration(address, message))?;
        write_period(bus, address, period.uuid, native).await?;
    }

    if capability.is_notifying() {
        let path = bus.path(address, capability.data())?;
        bus.subscribe(&path)
            .await
            .map_err(|e| Error::configuration_write(address, "arming notifications failed", e))?;
    }

    info!(device = %spec, "device enabled");
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum TeardownStep {
    Unsubscribe(Uuid),
    WriteOff(Uuid, Bytes),
}

impl TeardownStep {
    fn plan(capability: &Capability) -> Vec<Self> {
        let mut steps = Vec::with_capacity(2);
        if capability.is_notifying() {
            steps.push(Self::Unsubscribe(capability.data()));
        }
        if let Some(config) = capability.config() {
            steps.push(Self::WriteOff(config.uuid, config.off.clone()));
        }
        steps
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Unsubscribe(_) => "disarm notifications",
            Self::WriteOff(..) => "write config off payload",
        }
    }

    async fn run(&self, bus: &Bus, address: &DeviceAddress) -> TransportResult<()> {
        match self {
            Self::Unsubscribe(uuid) => bus.unsubscribe(&bus.path(address, *uuid)?).await,
            Self::WriteOff(uuid, payload) => bus.write(&bus.path(address, *uuid)?, payload).await,
        }
    }
}

/// Run the disable steps of a device, logging each failure.
pub(crate) async fn disable_device(bus: &Bus, spec: &DeviceSpec) {
    for step in TeardownStep::plan(spec.capability()) {
        match step.run(bus, spec.address()).await {
            Ok(()) => debug!(device = %spec, step = step.name(), "teardown step done"),
            Err(e) => warn!(device = %spec, step = step.name(), error = %e, "teardown step failed"),
        }
    }
    info!(device = %spec, "device disabled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ConfigCharacteristic, NotifyingCharacteristic, PollCharacteristic};
    use sensorbus_types::uuids::uuid16;

    #[test]
    fn test_teardown_order() {
        let config = ConfigCharacteristic::new(uuid16(0xaa02), vec![0x01], vec![0x00]);
        let notifying = Capability::from(NotifyingCharacteristic::new(uuid16(0xffe1)).config(config.clone()));
        assert_eq!(
            TeardownStep::plan(&notifying),
            vec![
                TeardownStep::Unsubscribe(uuid16(0xffe1)),
                TeardownStep::WriteOff(uuid16(0xaa02), Bytes::from_static(&[0x00])),
            ]
        );

        let poll = Capability::from(PollCharacteristic::new(uuid16(0xaa01)).config(config));
        assert_eq!(
            TeardownStep::plan(&poll),
            vec![TeardownStep::WriteOff(uuid16(0xaa02), Bytes::from_static(&[0x00]))]
        );

        let bare = Capability::from(PollCharacteristic::new(uuid16(0xaa01)));
        assert!(TeardownStep::plan(&bare).is_empty());
    }
}
