//! Normalized peripheral addresses.
//!
//! Bluetooth stacks spell the same link-layer address in many ways:
//! `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF`, `AA_BB_CC_DD_EE_FF` (the form
//! used in BlueZ object paths) or a bare `aabbccddeeff`. [`DeviceAddress`]
//! folds all of them into `AA:BB:CC:DD:EE:FF`.
//!
//! Identifiers that are not MAC addresses (CoreBluetooth assigns UUIDs on
//! macOS) are kept as trimmed, uppercased text so that normalization stays
//! total.

use std::fmt;
use std::str::FromStr;

/// Normalized identifier of a physical peripheral.
///
/// Normalization is idempotent: `DeviceAddress::new(a.as_str()) == a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "String", into = "String"))]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Normalize any textual spelling of an address.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        let digits: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '_'))
            .collect();

        if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            let upper = digits.to_ascii_uppercase();
            let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
            Self(octets.join(":"))
        } else {
            Self(trimmed.to_ascii_uppercase())
        }
    }

    /// The normalized text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the address is a 48-bit MAC rather than a platform identifier.
    pub fn is_mac(&self) -> bool {
        self.0.len() == 17 && self.0.split(':').count() == 6
    }

    /// Object-path component for this address, e.g. `dev_AA_BB_CC_DD_EE_FF`.
    pub fn path_component(&self) -> String {
        format!("dev_{}", self.0.replace([':', '-'], "_"))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceAddress {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

impl AsRef<str> for DeviceAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
