//! Device registrations.
//!
//! A [`DeviceRegistration`] is what a caller creates for every logical
//! sensor it wants managed: the device address, its capability variant
//! and a decode function turning payloads into values. Several
//! registrations may share one address (the sensors of a multi-sensor
//! tag); the session runs one connection manager per address.
//!
//! # Example
//!
//! ```
//! use sensorbus_core::capability::{ConfigCharacteristic, PollCharacteristic};
//! use sensorbus_core::registration::register_device;
//! use sensorbus_types::{decode, uuids::uuid16};
//!
//! let temperature = register_device(
//!     "A0:E6:F8:00:11:22",
//!     PollCharacteristic::new(uuid16(0xaa01))
//!         .config(ConfigCharacteristic::new(uuid16(0xaa02), vec![0x01], vec![0x00])),
//!     decode::i16_le,
//! );
//! assert_eq!(temperature.address().as_str(), "A0:E6:F8:00:11:22");
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sensorbus_types::{DecodeResult, DeviceAddress};

use crate::capability::Capability;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registration, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl RegistrationId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The type-independent part of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    id: RegistrationId,
    address: DeviceAddress,
    capability: Capability,
    name: Option<String>,
    interval: Option<f64>,
}

impl DeviceSpec {
    /// Registration identity.
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Device address.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Capability variant.
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Human-readable name, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sampling interval in seconds written on enable.
    pub fn interval(&self) -> Option<f64> {
        self.interval
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.address, name),
            None => write!(f, "{}/{}{}", self.address, self.capability.kind(), self.id),
        }
    }
}

type Decoder<T> = Arc<dyn Fn(&[u8]) -> DecodeResult<T> + Send + Sync>;

/// A device the caller wants managed, producing values of type `T`.
///
/// Immutable after creation. Clones share the same identity.
pub struct DeviceRegistration<T> {
    spec: Arc<DeviceSpec>,
    decode: Decoder<T>,
}

impl<T> Clone for DeviceRegistration<T> {
    fn clone(&self) -> Self {
        Self {
            spec: Arc::clone(&self.spec),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> fmt::Debug for DeviceRegistration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistration")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<T> DeviceRegistration<T> {
    /// Start building a registration.
    pub fn builder(
        address: impl Into<DeviceAddress>,
        capability: impl Into<Capability>,
        decode: impl Fn(&[u8]) -> DecodeResult<T> + Send + Sync + 'static,
    ) -> DeviceRegistrationBuilder<T> {
        DeviceRegistrationBuilder {
            address: address.into(),
            capability: capability.into(),
            decode: Arc::new(decode),
            name: None,
            interval: None,
        }
    }

    /// The type-independent part.
    pub fn spec(&self) -> &Arc<DeviceSpec> {
        &self.spec
    }

    /// Registration identity.
    pub fn id(&self) -> RegistrationId {
        self.spec.id
    }

    /// Device address.
    pub fn address(&self) -> &DeviceAddress {
        &self.spec.address
    }

    /// Capability variant.
    pub fn capability(&self) -> &Capability {
        &self.spec.capability
    }

    /// Decode a payload with the registered decode function.
    pub fn decode(&self, data: &[u8]) -> DecodeResult<T> {
        (self.decode)(data)
    }

    pub(crate) fn decoder(&self) -> Decoder<T> {
        Arc::clone(&self.decode)
    }
}

impl<T> fmt::Display for DeviceRegistration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.spec.fmt(f)
    }
}

/// Builder for [`DeviceRegistration`].
pub struct DeviceRegistrationBuilder<T> {
    address: DeviceAddress,
    capability: Capability,
    decode: Decoder<T>,
    name: Option<String>,
    interval: Option<f64>,
}

impl<T> DeviceRegistrationBuilder<T> {
    /// Set a human-readable name used in logs.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Write this sampling interval (seconds) whenever the device is enabled.
    #[must_use]
    pub fn interval(mut self, seconds: f64) -> Self {
        self.interval = Some(seconds);
        self
    }

    /// Finish the registration.
    pub fn build(self) -> DeviceRegistration<T> {
        DeviceRegistration {
            spec: Arc::new(DeviceSpec {
                id: RegistrationId::next(),
                address: self.address,
                capability: self.capability,
                name: self.name,
                interval: self.interval,
            }),
            decode: self.decode,
        }
    }
}

/// Register a device with default options.
pub fn register_device<T>(
    address: impl Into<DeviceAddress>,
    capability: impl Into<Capability>,
    decode: impl Fn(&[u8]) -> DecodeResult<T> + Send + Sync + 'static,
) -> DeviceRegistration<T> {
    DeviceRegistration::builder(address, capability, decode).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{NotifyingCharacteristic, PollCharacteristic};
    use sensorbus_types::decode;
    use sensorbus_types::uuids::uuid16;

    #[test]
    fn test_registrations_have_distinct_ids() {
        let a = register_device("aa:bb:cc:dd:ee:ff", PollCharacteristic::new(uuid16(1)), decode::u8);
        let b = register_device("aa:bb:cc:dd:ee:ff", PollCharacteristic::new(uuid16(1)), decode::u8);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.address(), b.address());

        let a2 = a.clone();
        assert_eq!(a.id(), a2.id());
    }

    #[test]
    fn test_builder_options_and_decode() {
        let reg = DeviceRegistration::builder(
            "aa-bb-cc-dd-ee-ff",
            NotifyingCharacteristic::new(uuid16(0xffe1)),
            decode::u16_le,
        )
        .name("button")
        .interval(0.5)
        .build();

        assert_eq!(reg.address().as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(reg.spec().name(), Some("button"));
        assert_eq!(reg.spec().interval(), Some(0.5));
        assert!(reg.capability().is_notifying());
        assert_eq!(reg.decode(&[0x34, 0x12]).unwrap(), 0x1234);
        assert_eq!(reg.to_string(), "AA:BB:CC:DD:EE:FF/button");
    }
}
