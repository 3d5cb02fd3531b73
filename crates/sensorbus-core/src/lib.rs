//! Session and device-lifecycle layer for multi-device Bluetooth LE sensors.
//!
//! This crate lets a caller treat every physical sensor as an independent
//! asynchronous resource (connect, configure, read, reconfigure,
//! disconnect) while one transport connection and one runtime are shared
//! by all of them.
//!
//! # Features
//!
//! - **Sessions**: explicit, cloneable handle with a start/stop lifecycle
//! - **Connection managers**: one task per device address with readiness
//!   signals, backoff and optional reconnection
//! - **Capability dispatch**: poll, notifying and composite-notifying
//!   sensors behind the same `read`/`enable`/`disable`/`set_interval` calls
//! - **Cancellation**: in-flight operations of a device are cancelled when
//!   it disconnects, all of them when the session stops
//! - **Failure isolation**: per-operation errors stay local; a failing
//!   connection task stops the session instead of hanging it
//! - **Transports**: [`BleTransport`] over btleplug and [`MockTransport`]
//!   for tests
//!
//! # Capability variants
//!
//! | Variant | Data arrives by | Typical sensor |
//! |---------|-----------------|----------------|
//! | [`Capability::Poll`] | reading the data characteristic | temperature, humidity |
//! | [`Capability::Notifying`] | notifications | buttons |
//! | [`Capability::CompositeNotifying`] | notifications after switching a poll sensor to notify mode | accelerometers |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorbus_core::{BleTransport, Session, register_device};
//! use sensorbus_core::capability::{ConfigCharacteristic, PollCharacteristic};
//! use sensorbus_types::{decode, uuids::uuid16};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(Arc::new(BleTransport::new().await?));
//!
//!     let temperature = register_device(
//!         "A0:E6:F8:00:11:22",
//!         PollCharacteristic::new(uuid16(0xaa01))
//!             .config(ConfigCharacteristic::new(uuid16(0xaa02), vec![0x01], vec![0x00])),
//!         decode::i16_le,
//!     );
//!     session.connect(&temperature)?;
//!     session.start()?;
//!
//!     session.enable(&temperature).await?;
//!     println!("raw temperature: {}", session.read(&temperature).await?);
//!     session.disable(&temperature).await;
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod bus;
pub mod capability;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod mailbox;
pub mod manager;
pub mod mock;
pub mod registration;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use ble::BleTransport;
pub use bus::Bus;
pub use capability::{
    Capability, ConfigCharacteristic, NotifyingCharacteristic, PeriodCharacteristic,
    PollCharacteristic,
};
pub use config::{BackoffPolicy, ConnectionOptions, SessionConfig};
pub use error::{Error, ReadFailure, Result, TransportError, TransportResult};
pub use events::{EventDispatcher, EventReceiver, EventSender, SessionEvent};
pub use manager::{ConnectionManager, DEVICE_DISCONNECTED};
pub use mock::{MockTransport, MockTransportBuilder, TransportCall};
pub use registration::{
    DeviceRegistration, DeviceRegistrationBuilder, DeviceSpec, RegistrationId, register_device,
};
pub use session::{
    Cancellation, ConnectionTask, OperationHandle, SESSION_STOPPED, Session, SessionState,
    WeakSession,
};
pub use transport::{CharacteristicPath, DisconnectSignals, Transport};

// Re-export from sensorbus-types
pub use sensorbus_types::uuid as uuids;
pub use sensorbus_types::{DecodeError, DecodeResult, DeviceAddress, decode};
