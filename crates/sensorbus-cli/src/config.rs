//! Session configuration file.
//!
//! ```toml
//! [session]
//! read_timeout_secs = 5
//! reconnect = true
//!
//! [[devices]]
//! name = "temperature"
//! address = "A0:E6:F8:00:11:22"
//! kind = "poll"
//! data = "0xaa01"
//! decode = "i16_le"
//! interval = 1.0
//!
//! [devices.config]
//! uuid = "0xaa02"
//! on = [1]
//! off = [0]
//!
//! [devices.period]
//! uuid = "0xaa03"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sensorbus_core::capability::DEFAULT_PERIOD_SCALE;
use sensorbus_core::{
    BackoffPolicy, Capability, ConfigCharacteristic, ConnectionOptions, NotifyingCharacteristic,
    PeriodCharacteristic, PollCharacteristic, SessionConfig,
};
use sensorbus_types::uuids::uuid16;

/// Configuration of a `read` run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Timeouts and connection policy shared by all devices.
    pub session: SessionSection,
    /// Devices to manage.
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Timeouts are non-zero and the backoff delays are ordered
    /// - At least one device is configured
    /// - Device addresses and names are not empty, names are unique
    /// - UUIDs parse and intervals fit the period characteristic
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.session.validate();

        if self.devices.is_empty() {
            errors.push(ValidationError::new("devices", "no devices configured"));
        }

        let mut seen_names = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{i}]");
            errors.extend(device.validate(&prefix));

            if !seen_names.insert(device.label()) {
                errors.push(ValidationError::new(
                    format!("{prefix}.name"),
                    format!("duplicate device name '{}'", device.label()),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// `[session]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub connect_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Unset waits for notifications indefinitely.
    pub notification_timeout_secs: Option<u64>,
    /// Reconnect devices after they disconnect.
    pub reconnect: bool,
    /// Enable devices as soon as they connect.
    pub enable_on_connect: bool,
    /// Connection retries before giving up. Unset retries forever.
    pub max_retries: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let timeouts = SessionConfig::default();
        Self {
            connect_timeout_secs: timeouts.connect_timeout.as_secs(),
            disconnect_timeout_secs: timeouts.disconnect_timeout.as_secs(),
            discovery_timeout_secs: timeouts.discovery_timeout.as_secs(),
            read_timeout_secs: timeouts.read_timeout.as_secs(),
            write_timeout_secs: timeouts.write_timeout.as_secs(),
            notification_timeout_secs: None,
            reconnect: false,
            enable_on_connect: false,
            max_retries: Some(3),
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl SessionSection {
    /// Validate the session table.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let timeouts = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("disconnect_timeout_secs", self.disconnect_timeout_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                errors.push(ValidationError::new(
                    format!("session.{field}"),
                    "timeout must be greater than zero",
                ));
            }
        }
        if self.notification_timeout_secs == Some(0) {
            errors.push(ValidationError::new(
                "session.notification_timeout_secs",
                "timeout must be greater than zero (omit it to wait indefinitely)",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            errors.push(ValidationError::new(
                "session.max_delay_ms",
                format!(
                    "max delay {}ms is shorter than the initial delay {}ms",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            ));
        }
        errors
    }

    /// Per-call timeouts for the session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .disconnect_timeout(Duration::from_secs(self.disconnect_timeout_secs))
            .discovery_timeout(Duration::from_secs(self.discovery_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .write_timeout(Duration::from_secs(self.write_timeout_secs))
            .notification_timeout(self.notification_timeout_secs.map(Duration::from_secs))
    }

    /// Connection policy shared by every device address.
    pub fn connection_options(&self) -> ConnectionOptions {
        let mut backoff = BackoffPolicy::exponential()
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms));
        backoff.max_retries = self.max_retries;
        ConnectionOptions::new()
            .reconnect(self.reconnect)
            .enable_on_connect(self.enable_on_connect)
            .backoff(backoff)
    }
}

/// How a device delivers its data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Poll,
    Notifying,
    /// A poll sensor switched into notification mode.
    Composite,
}

/// Generic decoder applied to every payload of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    U8,
    U16Le,
    I16Le,
    U32Le,
    #[default]
    Raw,
    Utf8,
}

/// `[[devices]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// MAC address or platform identifier.
    pub address: String,
    /// Name used in output; defaults to the address.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: DeviceKind,
    /// Data characteristic, as `0x2a19` or a full UUID.
    pub data: String,
    #[serde(default)]
    pub decode: DecodeKind,
    /// Sampling interval in seconds, written on enable.
    #[serde(default)]
    pub interval: Option<f64>,
    #[serde(default)]
    pub config: Option<ConfigSection>,
    #[serde(default)]
    pub period: Option<PeriodSection>,
}

/// `[devices.config]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSection {
    pub uuid: String,
    pub on: Vec<u8>,
    pub off: Vec<u8>,
    /// "On" payload used when the device is read by notification.
    #[serde(default)]
    pub on_notify: Option<Vec<u8>>,
}

/// `[devices.period]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodSection {
    pub uuid: String,
    #[serde(default = "default_period_scale")]
    pub scale: f64,
    #[serde(default = "default_period_max")]
    pub max: u8,
}

fn default_period_scale() -> f64 {
    DEFAULT_PERIOD_SCALE
}

fn default_period_max() -> u8 {
    u8::MAX
}

impl DeviceConfig {
    /// Name used in output.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{prefix}.address"),
                "device address cannot be empty",
            ));
        }

        if let Some(name) = &self.name
            && name.is_empty()
        {
            errors.push(ValidationError::new(
                format!("{prefix}.name"),
                "name cannot be empty string (omit it instead)",
            ));
        }

        match self.capability(prefix) {
            Ok(capability) => {
                if let Some(seconds) = self.interval {
                    match capability.period() {
                        Some(period) => {
                            if let Err(message) = period.encode(seconds) {
                                errors.push(ValidationError::new(format!("{prefix}.interval"), message));
                            }
                        }
                        None => errors.push(ValidationError::new(
                            format!("{prefix}.interval"),
                            "interval requires a [devices.period] table on a poll or composite device",
                        )),
                    }
                }
            }
            Err(e) => errors.push(e),
        }

        errors
    }

    /// Build the capability this entry describes.
    pub fn capability(&self, prefix: &str) -> Result<Capability, ValidationError> {
        let field_uuid = |field: &str, raw: &str| {
            parse_uuid(raw).map_err(|message| ValidationError::new(format!("{prefix}.{field}"), message))
        };

        let data = field_uuid("data", &self.data)?;
        let config = match &self.config {
            Some(section) => {
                let mut config = ConfigCharacteristic::new(
                    field_uuid("config.uuid", &section.uuid)?,
                    section.on.clone(),
                    section.off.clone(),
                );
                if let Some(payload) = &section.on_notify {
                    config = config.on_notify(payload.clone());
                }
                Some(config)
            }
            None => None,
        };
        let period = match &self.period {
            Some(section) => {
                if !section.scale.is_finite() || section.scale <= 0.0 {
                    return Err(ValidationError::new(
                        format!("{prefix}.period.scale"),
                        format!("scale {} must be a positive number", section.scale),
                    ));
                }
                Some(
                    PeriodCharacteristic::new(field_uuid("period.uuid", &section.uuid)?)
                        .scale(section.scale)
                        .max(section.max),
                )
            }
            None => None,
        };

        if self.kind == DeviceKind::Notifying {
            if period.is_some() {
                return Err(ValidationError::new(
                    format!("{prefix}.period"),
                    "notifying devices have no sampling period",
                ));
            }
            let mut notifying = NotifyingCharacteristic::new(data);
            if let Some(config) = config {
                notifying = notifying.config(config);
            }
            return Ok(notifying.into());
        }

        let mut poll = PollCharacteristic::new(data);
        if let Some(config) = config {
            poll = poll.config(config);
        }
        if let Some(period) = period {
            poll = poll.period(period);
        }
        Ok(match self.kind {
            DeviceKind::Composite => Capability::CompositeNotifying(poll),
            _ => Capability::Poll(poll),
        })
    }
}

/// Parse `0x2a19` as a 16-bit assigned number, anything else as a full UUID.
pub fn parse_uuid(raw: &str) -> Result<Uuid, String> {
    let trimmed = raw.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u16::from_str_radix(hex, 16)
            .map(uuid16)
            .map_err(|_| format!("'{raw}' is not a 16-bit UUID"));
    }
    Uuid::parse_str(trimmed).map_err(|e| format!("'{raw}' is not a UUID: {e}"))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// The field path (e.g., `session.read_timeout_secs` or `devices[0].data`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [session]
        read_timeout_secs = 2
        reconnect = true
        enable_on_connect = true
        max_retries = 10

        [[devices]]
        name = "temperature"
        address = "a0-e6-f8-00-11-22"
        data = "0xaa01"
        decode = "i16_le"
        interval = 0.5

        [devices.config]
        uuid = "0xaa02"
        on = [1]
        off = [0]

        [devices.period]
        uuid = "0xaa03"

        [[devices]]
        name = "button"
        address = "A0:E6:F8:00:11:22"
        kind = "notifying"
        data = "0000ffe1-0000-1000-8000-00805f9b34fb"
        decode = "u8"
    "#;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("session.toml");
        std::fs::write(&path, content).unwrap();
        (temp_dir, path)
    }

    fn poll_device(data: &str) -> DeviceConfig {
        DeviceConfig {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: None,
            kind: DeviceKind::Poll,
            data: data.to_string(),
            decode: DecodeKind::Raw,
            interval: None,
            config: None,
            period: None,
        }
    }

    fn fields(result: Result<(), ConfigError>) -> Vec<String> {
        match result {
            Err(ConfigError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_session_section_default_matches_core() {
        let section = SessionSection::default();
        assert_eq!(section.session_config(), SessionConfig::default());
        assert!(section.validate().is_empty());
    }

    #[test]
    fn test_config_load_full() {
        let (_dir, path) = write_config(FULL);
        let config = Config::load_validated(&path).unwrap();

        assert_eq!(config.session.read_timeout_secs, 2);
        assert_eq!(config.session.connect_timeout_secs, 30);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].decode, DecodeKind::I16Le);
        assert_eq!(config.devices[1].kind, DeviceKind::Notifying);

        let options = config.session.connection_options();
        assert!(options.reconnect);
        assert!(options.enable_on_connect);
        assert_eq!(options.backoff.max_retries, Some(10));
        assert!(options.validate().is_ok());

        let timeouts = config.session.session_config();
        assert_eq!(timeouts.read_timeout, Duration::from_secs(2));
        assert_eq!(timeouts.notification_timeout, None);
    }

    #[test]
    fn test_capability_from_config() {
        let (_dir, path) = write_config(FULL);
        let config = Config::load(&path).unwrap();

        let temperature = config.devices[0].capability("devices[0]").unwrap();
        assert_eq!(temperature.kind(), "poll");
        assert_eq!(temperature.data(), uuid16(0xaa01));
        assert_eq!(temperature.config().unwrap().uuid, uuid16(0xaa02));
        assert_eq!(temperature.period().unwrap().encode(0.5), Ok(50));

        let button = config.devices[1].capability("devices[1]").unwrap();
        assert!(button.is_notifying());
        assert_eq!(button.data(), uuid16(0xffe1));
    }

    #[test]
    fn test_composite_kind() {
        let mut device = poll_device("0xaa11");
        device.kind = DeviceKind::Composite;
        device.config = Some(ConfigSection {
            uuid: "0xaa12".to_string(),
            on: vec![0x01],
            off: vec![0x00],
            on_notify: Some(vec![0x02]),
        });
        let capability = device.capability("devices[0]").unwrap();
        assert_eq!(capability.kind(), "composite-notifying");
        assert_eq!(&capability.config().unwrap().on_payload(true)[..], &[0x02]);
    }

    #[test]
    fn test_parse_uuid() {
        assert_eq!(parse_uuid("0x2a19"), Ok(uuid16(0x2a19)));
        assert_eq!(parse_uuid("0X2A19"), Ok(uuid16(0x2a19)));
        assert_eq!(
            parse_uuid("00002a19-0000-1000-8000-00805f9b34fb"),
            Ok(uuid16(0x2a19))
        );
        assert!(parse_uuid("0x12345").is_err());
        assert!(parse_uuid("battery").is_err());
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/session.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let (_dir, path) = write_config("this is not valid { toml");
        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_config_unknown_decoder_rejected() {
        let (_dir, path) = write_config(
            r#"
            [[devices]]
            address = "AA:BB:CC:DD:EE:FF"
            data = "0x2a19"
            decode = "f32"
            "#,
        );
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    // ==========================================================================
    // Validation tests
    // ==========================================================================

    #[test]
    fn test_empty_config_rejected() {
        assert_eq!(fields(Config::default().validate()), vec!["devices"]);
    }

    #[test]
    fn test_session_validation() {
        let section = SessionSection {
            read_timeout_secs: 0,
            notification_timeout_secs: Some(0),
            initial_delay_ms: 5000,
            max_delay_ms: 100,
            ..SessionSection::default()
        };
        let fields: Vec<_> = section.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "session.read_timeout_secs",
                "session.notification_timeout_secs",
                "session.max_delay_ms",
            ]
        );
    }

    #[test]
    fn test_device_validation() {
        let mut device = poll_device("not-a-uuid");
        device.address = String::new();
        device.name = Some(String::new());
        let fields: Vec<_> = device.validate("devices[0]").into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["devices[0].address", "devices[0].name", "devices[0].data"]
        );
    }

    #[test]
    fn test_interval_validation() {
        let mut device = poll_device("0xaa01");
        device.interval = Some(1.0);
        let errors = device.validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("requires"));

        device.period = Some(PeriodSection {
            uuid: "0xaa03".to_string(),
            scale: DEFAULT_PERIOD_SCALE,
            max: u8::MAX,
        });
        assert!(device.validate("devices[0]").is_empty());

        device.interval = Some(2.56);
        let errors = device.validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "devices[0].interval");
    }

    #[test]
    fn test_notifying_period_rejected() {
        let mut device = poll_device("0xffe1");
        device.kind = DeviceKind::Notifying;
        device.period = Some(PeriodSection {
            uuid: "0xaa03".to_string(),
            scale: DEFAULT_PERIOD_SCALE,
            max: u8::MAX,
        });
        let errors = device.validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "devices[0].period");
    }

    #[test]
    fn test_duplicate_names() {
        let config = Config {
            session: SessionSection::default(),
            devices: vec![poll_device("0x2a19"), poll_device("0x2a00")],
        };
        assert_eq!(fields(config.validate()), vec!["devices[1].name"]);
    }

    #[test]
    fn test_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError::new("devices[0].data", "bad uuid"),
            ValidationError::new("session.read_timeout_secs", "zero"),
        ]);
        let display = error.to_string();
        assert!(display.contains("  - devices[0].data: bad uuid"));
        assert!(display.contains("  - session.read_timeout_secs: zero"));
    }
}
