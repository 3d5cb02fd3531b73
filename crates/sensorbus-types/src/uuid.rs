//! Bluetooth UUID helpers.
//!
//! Standard characteristics are assigned 16-bit identifiers that expand into
//! the Bluetooth base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::{Uuid, uuid};

/// The Bluetooth base UUID.
pub const BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub const fn uuid16(short: u16) -> Uuid {
    let base = BASE_UUID.as_u128();
    Uuid::from_u128(base | ((short as u128) << 96))
}

/// Return the 16-bit assigned number if `uuid` lies in the base range.
pub fn as_uuid16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xffff_u128 << 96);
    if value & mask == BASE_UUID.as_u128() {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

// --- Standard BLE Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid16(0x1800);

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid16(0x180a);

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid16(0x180f);

/// Environmental Sensing service.
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = uuid16(0x181a);

// --- Standard Characteristic UUIDs ---

/// Device name characteristic.
pub const DEVICE_NAME: Uuid = uuid16(0x2a00);

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid16(0x2a19);

/// Manufacturer name string characteristic.
pub const MANUFACTURER_NAME: Uuid = uuid16(0x2a29);

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid16(0x2a26);

/// Temperature characteristic (0.01 degC, i16).
pub const TEMPERATURE: Uuid = uuid16(0x2a6e);

/// Humidity characteristic (0.01 %, u16).
pub const HUMIDITY: Uuid = uuid16(0x2a6f);

/// Pressure characteristic (0.1 Pa, u32).
pub const PRESSURE: Uuid = uuid16(0x2a6d);
