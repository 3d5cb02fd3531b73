//! Platform-agnostic types for Bluetooth LE sensor sessions.
//!
//! This crate holds the pieces of `sensorbus` that do not depend on a
//! Bluetooth stack or an async runtime:
//!
//! - [`DeviceAddress`], the normalized identifier of a peripheral
//! - UUID helpers and standard characteristic UUIDs
//! - Generic payload decoders and the [`DecodeError`] they return
//!
//! # Example
//!
//! ```
//! use sensorbus_types::{DeviceAddress, decode};
//!
//! let addr: DeviceAddress = "aa-bb-cc-dd-ee-ff".parse().unwrap();
//! assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:FF");
//!
//! assert_eq!(decode::u16_le(&[0x20, 0x03]).unwrap(), 800);
//! ```

pub mod address;
pub mod decode;
pub mod error;
pub mod uuid;

pub use address::DeviceAddress;
pub use error::{DecodeError, DecodeResult};
pub use self::uuid as uuids;
