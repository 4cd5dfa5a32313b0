//! NBSProxy wire format — frames exchanged between client apps and the proxy.
//!
//! Frames travel app-to-app on the device; the carrier only ever sees the
//! raw `payload` bytes. Frames are JSON with the payload hex-encoded, so
//! they survive any text-only channel the host platform offers.
//!
//! Every frame carries the sender's protocol version. Two sides are
//! compatible when major and minor match; patch is informational.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Largest payload the NBS carrier accepts in one frame.
pub const MAX_NBS_PAYLOAD: usize = 140;

/// Version this build speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

// ── Commands ──────────────────────────────────────────────────────────────────

/// What a frame asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Client → proxy: route traffic on `port` to `app_id`.
    /// Proxy → client: the same frame echoed back with `response_timestamp`.
    Register,
    /// Client → proxy: transmit `payload` to `phone` on `port`.
    Send,
    /// Proxy → client: the proxy app was launched by the user.
    AppLaunched,
    /// Proxy → client: the user granted the transport permissions.
    PermissionsGranted,
    /// Proxy → client: inbound data from `phone` on `port`.
    Deliver,
}

// ── Version ───────────────────────────────────────────────────────────────────

/// A `major.minor.patch` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(WireError::BadVersion(s.to_string()));
        }
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| WireError::BadVersion(s.to_string()))
        };
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}

/// Result of comparing a remote version tag against our own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Compatible,
    /// The remote side is older, or sent no usable version at all.
    RemoteOlder,
    /// We are older than the remote side.
    LocalOlder,
}

impl VersionCheck {
    pub fn is_compatible(self) -> bool {
        matches!(self, Self::Compatible)
    }
}

/// Compare `remote` against `local`.
///
/// A missing or malformed remote tag counts as older. Only major and minor
/// take part in the comparison.
pub fn check_version(local: &ProtocolVersion, remote: Option<&str>) -> VersionCheck {
    let remote = match remote.filter(|v| !v.is_empty()).map(str::parse::<ProtocolVersion>) {
        Some(Ok(v)) => v,
        _ => return VersionCheck::RemoteOlder,
    };
    match (local.major, local.minor).cmp(&(remote.major, remote.minor)) {
        std::cmp::Ordering::Equal => VersionCheck::Compatible,
        std::cmp::Ordering::Greater => VersionCheck::RemoteOlder,
        std::cmp::Ordering::Less => VersionCheck::LocalOlder,
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One logical unit of routed data: a control message or a data payload
/// plus the small header of protocol metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Sender's protocol version, `major.minor.patch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub command: Command,

    /// NBS port. 0 means the field was absent.
    #[serde(default)]
    pub port: u16,

    /// Package id of the client app that originated the frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Remote phone: destination for `Send`, origin for `Deliver`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    /// Client clock (ms) when a `Register` was sent. Echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timestamp: Option<u64>,

    /// Proxy clock (ms) when the `Register` was answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timestamp: Option<u64>,

    #[serde(default, with = "hex_payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    fn base(version: &ProtocolVersion, command: Command, port: u16) -> Self {
        Self {
            version: Some(version.to_string()),
            command,
            port,
            app_id: None,
            phone: None,
            request_timestamp: None,
            response_timestamp: None,
            payload: None,
        }
    }

    /// Registration request from a client app.
    pub fn register(version: &ProtocolVersion, port: u16, app_id: &str, now_ms: u64) -> Self {
        Self {
            app_id: Some(app_id.to_string()),
            request_timestamp: Some(now_ms),
            ..Self::base(version, Command::Register, port)
        }
    }

    /// The proxy's answer to `request`, stamped with the proxy's clock.
    pub fn registration_response(version: &ProtocolVersion, request: &Frame, now_ms: u64) -> Self {
        Self {
            app_id: request.app_id.clone(),
            request_timestamp: request.request_timestamp,
            response_timestamp: Some(now_ms),
            ..Self::base(version, Command::Register, request.port)
        }
    }

    /// Outbound send request from a client app.
    pub fn send(version: &ProtocolVersion, app_id: &str, phone: &str, port: u16, data: &[u8]) -> Self {
        Self {
            app_id: Some(app_id.to_string()),
            phone: Some(phone.to_string()),
            payload: Some(data.to_vec()),
            ..Self::base(version, Command::Send, port)
        }
    }

    /// Inbound data relayed from the proxy to one registered app.
    pub fn deliver(version: &ProtocolVersion, phone: &str, port: u16, data: &[u8]) -> Self {
        Self {
            phone: Some(phone.to_string()),
            payload: Some(data.to_vec()),
            ..Self::base(version, Command::Deliver, port)
        }
    }

    /// A payload-less notification (`AppLaunched`, `PermissionsGranted`).
    pub fn control(version: &ProtocolVersion, command: Command) -> Self {
        Self::base(version, command, 0)
    }

    /// True for the proxy's answer to a `Register`, which carries both
    /// timestamps. Such frames are never handed to app-level callbacks.
    pub fn is_registration_response(&self) -> bool {
        self.command == Command::Register
            && self.request_timestamp.is_some()
            && self.response_timestamp.is_some()
    }

    /// Compare the frame's version tag against `local`.
    pub fn version_check(&self, local: &ProtocolVersion) -> VersionCheck {
        check_version(local, self.version.as_deref())
    }

    /// The fields every data-bearing frame (`Send`, `Deliver`) must carry.
    pub fn require_data(&self) -> Result<(&str, u16, &[u8]), WireError> {
        let payload = self
            .payload
            .as_deref()
            .ok_or(WireError::MissingField("payload"))?;
        let phone = self.phone.as_deref().ok_or(WireError::MissingField("phone"))?;
        if self.port == 0 {
            return Err(WireError::MissingField("port"));
        }
        Ok((phone, self.port, payload))
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Json)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Json)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Json(serde_json::Error),
    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("malformed version tag: {0:?}")]
    BadVersion(String),
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_str(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
