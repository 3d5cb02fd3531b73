//! Reading values and their text/JSON output.

use std::fmt;

use serde::Serialize;

use sensorbus_types::{DecodeResult, decode};

use crate::config::DecodeKind;

/// A decoded value, independent of the decoder that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Signed(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => {
                f.write_str("0x")?;
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl DecodeKind {
    /// Decode a payload with the generic decoder this kind names.
    pub fn decode(self, data: &[u8]) -> DecodeResult<Value> {
        Ok(match self {
            Self::U8 => Value::Unsigned(decode::u8(data)?.into()),
            Self::U16Le => Value::Unsigned(decode::u16_le(data)?.into()),
            Self::I16Le => Value::Signed(decode::i16_le(data)?.into()),
            Self::U32Le => Value::Unsigned(decode::u32_le(data)?.into()),
            Self::Raw => Value::Bytes(decode::raw(data)?.to_vec()),
            Self::Utf8 => Value::Text(decode::utf8(data)?),
        })
    }
}

/// One line of `read` output.
#[derive(Debug, Serialize)]
pub struct ReadingLine<'a> {
    pub device: &'a str,
    pub address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReadingLine<'_> {
    /// Render as a single line of text or JSON.
    pub fn render(&self, json: bool) -> String {
        if json {
            return serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
        }
        match (self.value, &self.error) {
            (Some(value), _) => format!("{:<20} {:<20} {value}", self.device, self.address),
            (None, Some(error)) => format!("{:<20} {:<20} error: {error}", self.device, self.address),
            (None, None) => format!("{:<20} {:<20} -", self.device, self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_kinds() {
        assert_eq!(DecodeKind::U8.decode(&[0x2a]).unwrap(), Value::Unsigned(42));
        assert_eq!(DecodeKind::U16Le.decode(&[0x20, 0x03]).unwrap(), Value::Unsigned(800));
        assert_eq!(DecodeKind::I16Le.decode(&[0xff, 0xff]).unwrap(), Value::Signed(-1));
        assert_eq!(
            DecodeKind::U32Le.decode(&[0x01, 0x00, 0x01, 0x00]).unwrap(),
            Value::Unsigned(65537)
        );
        assert_eq!(DecodeKind::Raw.decode(&[0xab, 0x01]).unwrap(), Value::Bytes(vec![0xab, 0x01]));
        assert_eq!(DecodeKind::Utf8.decode(b"abc\0").unwrap(), Value::Text("abc".into()));
        assert!(DecodeKind::U16Le.decode(&[0x01]).is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Bytes(vec![0x00, 0xff]).to_string(), "0x00ff");
        assert_eq!(Value::Signed(-12).to_string(), "-12");
        assert_eq!(Value::Text("hi".into()).to_string(), "\"hi\"");
    }

    #[test]
    fn test_render_json() {
        let value = Value::Unsigned(7);
        let line = ReadingLine {
            device: "battery",
            address: "AA:BB:CC:DD:EE:FF",
            value: Some(&value),
            error: None,
        };
        let json: serde_json::Value = serde_json::from_str(&line.render(true)).unwrap();
        assert_eq!(json["device"], "battery");
        assert_eq!(json["value"], 7);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_render_text_error() {
        let line = ReadingLine {
            device: "button",
            address: "AA:BB:CC:DD:EE:FF",
            value: None,
            error: Some("timed out".into()),
        };
        let text = line.render(false);
        assert!(text.starts_with("button"));
        assert!(text.ends_with("error: timed out"));
    }
}
