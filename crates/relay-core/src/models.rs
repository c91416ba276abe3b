//! Domain models shared across the forwarding pipeline.
//!
//! Strongly-typed wrappers for broker handles and routing metadata so that
//! delivery tags, attempt counts, and HTTP targets cannot be confused with
//! arbitrary integers and strings.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Broker header carrying the 1-based delivery attempt number.
pub const ATTEMPT_HEADER: &str = "x-attempt";

/// Broker-assigned handle for one live delivery.
///
/// Required for ack and nack. Only meaningful on the channel that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device event classes carried in `deviceMessageType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventType {
    /// Device presence confirmed.
    Confirmed,
    /// New device discovered.
    Discovered,
    /// Device detached.
    Detached,
    /// Playback volume changed.
    VolumeRenderChanged,
    /// Recording volume changed.
    VolumeCaptureChanged,
    /// Default playback device changed.
    DefaultRenderChanged,
    /// Default recording device changed.
    DefaultCaptureChanged,
}

impl DeviceEventType {
    /// Maps the wire code to an event class. Unknown codes return `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Confirmed),
            1 => Some(Self::Discovered),
            2 => Some(Self::Detached),
            3 => Some(Self::VolumeRenderChanged),
            4 => Some(Self::VolumeCaptureChanged),
            5 => Some(Self::DefaultRenderChanged),
            6 => Some(Self::DefaultCaptureChanged),
            _ => None,
        }
    }

    /// Wire code for this class.
    pub fn code(self) -> i64 {
        match self {
            Self::Confirmed => 0,
            Self::Discovered => 1,
            Self::Detached => 2,
            Self::VolumeRenderChanged => 3,
            Self::VolumeCaptureChanged => 4,
            Self::DefaultRenderChanged => 5,
            Self::DefaultCaptureChanged => 6,
        }
    }
}

impl fmt::Display for DeviceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Confirmed => "Confirmed",
            Self::Discovered => "Discovered",
            Self::Detached => "Detached",
            Self::VolumeRenderChanged => "VolumeRenderChanged",
            Self::VolumeCaptureChanged => "VolumeCaptureChanged",
            Self::DefaultRenderChanged => "DefaultRenderChanged",
            Self::DefaultCaptureChanged => "DefaultCaptureChanged",
        };
        f.write_str(name)
    }
}

/// HTTP verb used for the outbound call.
///
/// Only `PUT` is distinguished; every other non-blank method string is sent
/// as `POST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMethod {
    /// HTTP PUT.
    Put,
    /// HTTP POST.
    Post,
}

impl ForwardMethod {
    /// Resolves a method string. Blank strings return `None`.
    pub fn parse(method: &str) -> Option<Self> {
        let trimmed = method.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.eq_ignore_ascii_case("PUT") {
            Some(Self::Put)
        } else {
            Some(Self::Post)
        }
    }

    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for ForwardMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named REST backend selected by configuration, carrying its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiTarget {
    /// Hosted production API.
    Azure {
        /// Base URL every suffix is appended to
        base_url: String,
    },
    /// API on a local machine.
    Local {
        /// Base URL every suffix is appended to
        base_url: String,
    },
    /// API running in a GitHub Codespace that may be suspended.
    Codespace {
        /// Base URL every suffix is appended to
        base_url: String,
    },
}

impl ApiTarget {
    /// Selector names accepted in configuration.
    pub const NAMES: [&'static str; 3] = ["Azure", "Local", "Codespace"];

    /// Selector used when the configured name is not recognized.
    pub const DEFAULT_NAME: &'static str = "Azure";

    /// Base URL of the selected backend.
    pub fn base_url(&self) -> &str {
        match self {
            Self::Azure { base_url } | Self::Local { base_url } | Self::Codespace { base_url } => {
                base_url
            },
        }
    }

    /// Selector name of this backend.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Azure { .. } => "Azure",
            Self::Local { .. } => "Local",
            Self::Codespace { .. } => "Codespace",
        }
    }

    /// Whether the backend may be asleep and must be woken after failures.
    pub fn is_wake_capable(&self) -> bool {
        matches!(self, Self::Codespace { .. })
    }

    /// Full URL for a message suffix.
    pub fn url_for(&self, url_suffix: &str) -> String {
        format!("{}{}", self.base_url(), url_suffix)
    }
}

impl fmt::Display for ApiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unit of work flowing from the dispatcher to delivery.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Broker handle for ack and nack.
    pub delivery_tag: DeliveryTag,
    /// Body exactly as received, republished verbatim on retry.
    pub raw_body: Bytes,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Raw `httpRequest` value.
    pub http_method: Option<String>,
    /// Raw `urlSuffix` value.
    pub url_suffix: Option<String>,
    /// Body with routing fields removed.
    pub payload: Map<String, Value>,
    /// Event's own declared time, used only for debounce windows.
    pub event_timestamp: DateTime<Utc>,
    /// Parsed event class, `None` for unknown codes.
    pub event_type: Option<DeviceEventType>,
}

/// Reads an attempt number from header text.
///
/// Missing, unparsable, or non-positive values count as the first attempt.
pub fn parse_attempt(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|attempt| *attempt > 0)
        .map_or(1, |attempt| u32::try_from(attempt).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_round_trip_through_known_classes() {
        for code in 0..=6 {
            let class = DeviceEventType::from_code(code).unwrap();
            assert_eq!(class.code(), code);
        }
        assert_eq!(DeviceEventType::from_code(7), None);
        assert_eq!(DeviceEventType::from_code(-1), None);
    }

    #[test]
    fn only_put_is_distinguished() {
        assert_eq!(ForwardMethod::parse("PUT"), Some(ForwardMethod::Put));
        assert_eq!(ForwardMethod::parse("put"), Some(ForwardMethod::Put));
        assert_eq!(ForwardMethod::parse(" Put "), Some(ForwardMethod::Put));
        assert_eq!(ForwardMethod::parse("POST"), Some(ForwardMethod::Post));
        assert_eq!(ForwardMethod::parse("DELETE"), Some(ForwardMethod::Post));
        assert_eq!(ForwardMethod::parse("patch"), Some(ForwardMethod::Post));
        assert_eq!(ForwardMethod::parse(""), None);
        assert_eq!(ForwardMethod::parse("   "), None);
    }

    #[test]
    fn attempt_header_defaults_to_first_attempt() {
        assert_eq!(parse_attempt(None), 1);
        assert_eq!(parse_attempt(Some("")), 1);
        assert_eq!(parse_attempt(Some("abc")), 1);
        assert_eq!(parse_attempt(Some("0")), 1);
        assert_eq!(parse_attempt(Some("-3")), 1);
        assert_eq!(parse_attempt(Some("4")), 4);
        assert_eq!(parse_attempt(Some(" 2 ")), 2);
    }

    #[test]
    fn only_codespace_is_wake_capable() {
        let base_url = "https://api.example.com".to_string();
        assert!(!ApiTarget::Azure { base_url: base_url.clone() }.is_wake_capable());
        assert!(!ApiTarget::Local { base_url: base_url.clone() }.is_wake_capable());
        assert!(ApiTarget::Codespace { base_url }.is_wake_capable());
    }

    #[test]
    fn url_suffix_is_appended_verbatim() {
        let target = ApiTarget::Local { base_url: "http://localhost:5000/api".to_string() };
        assert_eq!(target.url_for("/devices/7"), "http://localhost:5000/api/devices/7");
        assert_eq!(target.url_for(""), "http://localhost:5000/api");
    }
}
