//! Capability variants.
//!
//! A device registration carries exactly one [`Capability`], fixed for its
//! lifetime. The variant decides how `read`, `enable`, `disable` and
//! `set_interval` are carried out:
//!
//! | Variant | read | enable | disable |
//! |---------|------|--------|---------|
//! | `Poll` | transport read | config on | config off |
//! | `Notifying` | next notification | config on (notify), subscribe | unsubscribe, config off |
//! | `CompositeNotifying` | next notification | inner enable (notify), subscribe | unsubscribe, inner disable |

use bytes::Bytes;
use uuid::Uuid;

/// A configuration characteristic with its on/off payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Payload that switches the sensor on.
    pub on: Bytes,
    /// Payload that switches the sensor on in notification mode, if it
    /// differs from `on`.
    pub on_notify: Option<Bytes>,
    /// Payload that switches the sensor off.
    pub off: Bytes,
}

impl ConfigCharacteristic {
    /// Create a config characteristic.
    pub fn new(uuid: Uuid, on: impl Into<Bytes>, off: impl Into<Bytes>) -> Self {
        Self {
            uuid,
            on: on.into(),
            on_notify: None,
            off: off.into(),
        }
    }

    /// Set the notification-mode "on" payload.
    #[must_use]
    pub fn on_notify(mut self, payload: impl Into<Bytes>) -> Self {
        self.on_notify = Some(payload.into());
        self
    }

    /// The "on" payload for the given mode.
    pub fn on_payload(&self, notifying: bool) -> &Bytes {
        match (&self.on_notify, notifying) {
            (Some(payload), true) => payload,
            _ => &self.on,
        }
    }
}

/// Default number of native period units per second (hundredths).
pub const DEFAULT_PERIOD_SCALE: f64 = 100.0;

/// A sampling-period characteristic.
///
/// The period is written as a single byte counting `scale` units per
/// second, so with the default scale a byte of `100` means one second.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Native units per second.
    pub scale: f64,
    /// Largest native value the device accepts.
    pub max: u8,
}

impl PeriodCharacteristic {
    /// Create a period characteristic counting hundredths of a second.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            scale: DEFAULT_PERIOD_SCALE,
            max: u8::MAX,
        }
    }

    /// Set the native units per second.
    #[must_use]
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Set the largest native value.
    #[must_use]
    pub fn max(mut self, max: u8) -> Self {
        self.max = max;
        self
    }

    /// Largest interval in seconds this characteristic can express.
    pub fn max_seconds(&self) -> f64 {
        f64::from(self.max) / self.scale
    }

    /// Encode an interval in seconds into the native byte.
    ///
    /// Fails with a description if the interval is not finite, negative,
    /// or above [`max_seconds`](Self::max_seconds).
    pub fn encode(&self, seconds: f64) -> Result<u8, String> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("interval {seconds}s is not a valid duration"));
        }
        let native = (seconds * self.scale).round();
        if native > f64::from(self.max) {
            return Err(format!(
                "interval {seconds}s exceeds the maximum of {}s",
                self.max_seconds()
            ));
        }
        Ok(native as u8)
    }
}

/// A sensor read by polling its data characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct PollCharacteristic {
    /// Data characteristic UUID.
    pub data: Uuid,
    /// Optional configuration characteristic.
    pub config: Option<ConfigCharacteristic>,
    /// Optional sampling-period characteristic.
    pub period: Option<PeriodCharacteristic>,
}

impl PollCharacteristic {
    /// Create a poll characteristic without configuration.
    pub fn new(data: Uuid) -> Self {
        Self {
            data,
            config: None,
            period: None,
        }
    }

    /// Set the configuration characteristic.
    #[must_use]
    pub fn config(mut self, config: ConfigCharacteristic) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the sampling-period characteristic.
    #[must_use]
    pub fn period(mut self, period: PeriodCharacteristic) -> Self {
        self.period = Some(period);
        self
    }
}

/// A sensor that pushes its data as notifications, such as a button.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyingCharacteristic {
    /// Data characteristic UUID.
    pub data: Uuid,
    /// Optional configuration characteristic.
    pub config: Option<ConfigCharacteristic>,
}

impl NotifyingCharacteristic {
    /// Create a notifying characteristic without configuration.
    pub fn new(data: Uuid) -> Self {
        Self { data, config: None }
    }

    /// Set the configuration characteristic.
    #[must_use]
    pub fn config(mut self, config: ConfigCharacteristic) -> Self {
        self.config = Some(config);
        self
    }
}

/// How a device is read, enabled and disabled.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    /// Poll the data characteristic.
    Poll(PollCharacteristic),
    /// Receive the data characteristic as notifications.
    Notifying(NotifyingCharacteristic),
    /// A poll-style sensor switched into notification mode.
    CompositeNotifying(PollCharacteristic),
}

impl Capability {
    /// The data characteristic.
    pub fn data(&self) -> Uuid {
        match self {
            Self::Poll(c) | Self::CompositeNotifying(c) => c.data,
            Self::Notifying(c) => c.data,
        }
    }

    /// The configuration characteristic, if any.
    pub fn config(&self) -> Option<&ConfigCharacteristic> {
        match self {
            Self::Poll(c) | Self::CompositeNotifying(c) => c.config.as_ref(),
            Self::Notifying(c) => c.config.as_ref(),
        }
    }

    /// The sampling-period characteristic, if any.
    pub fn period(&self) -> Option<&PeriodCharacteristic> {
        match self {
            Self::Poll(c) | Self::CompositeNotifying(c) => c.period.as_ref(),
            Self::Notifying(_) => None,
        }
    }

    /// Whether data arrives as notifications.
    pub fn is_notifying(&self) -> bool {
        matches!(self, Self::Notifying(_) | Self::CompositeNotifying(_))
    }

    /// Short name of the variant for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Poll(_) => "poll",
            Self::Notifying(_) => "notifying",
            Self::CompositeNotifying(_) => "composite-notifying",
        }
    }
}

impl From<PollCharacteristic> for Capability {
    fn from(value: PollCharacteristic) -> Self {
        Self::Poll(value)
    }
}

impl From<NotifyingCharacteristic> for Capability {
    fn from(value: NotifyingCharacteristic) -> Self {
        Self::Notifying(value)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use sensorbus_types::uuids::uuid16;

    proptest! {
        /// Encoding accepts exactly the intervals within range.
        #[test]
        fn encode_respects_bounds(seconds in -10.0f64..10.0) {
            let period = PeriodCharacteristic::new(uuid16(0xaa03));
            let result = period.encode(seconds);
            if seconds < 0.0 || (seconds * 100.0).round() > 255.0 {
                prop_assert!(result.is_err());
            } else {
                let native = result.unwrap();
                prop_assert!((f64::from(native) / 100.0 - seconds).abs() <= 0.005 + 1e-9);
            }
        }
    }
}
