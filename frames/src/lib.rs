//! Shared message model and JSON codec for the realtime relay.
//!
//! This crate owns the wire representation used by both the hub (`pixelverse`)
//! and the client engine (`canvas`). Every message travels as a flat envelope
//! `{ "type": "...", "payload": { ... } }`; the envelope is decoded first and
//! the payload is then parsed into the typed struct for that `type`.
//!
//! Payload field names are camelCase on the wire. Colors travel as
//! `"#rrggbb"` strings and are parsed into [`Rgb`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned by [`decode`] and [`encode`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not a JSON envelope.
    #[error("invalid json envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The envelope `type` is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// The payload does not match the schema for its `type`.
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned when parsing an [`Rgb`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColorError {
    #[error("color must be six hex digits, got {0:?}")]
    Malformed(String),
}

// =============================================================================
// COLOR
// =============================================================================

/// 24-bit RGB color. Serialized as `"#rrggbb"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb(u32);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0x00_00_00);
    pub const WHITE: Rgb = Rgb(0xFF_FF_FF);

    /// Build from a packed `0xRRGGBB` value. Bits above 24 are masked off.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value & 0x00FF_FFFF)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Parse `"#rrggbb"` or `"rrggbb"`, case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`ColorError::Malformed`] unless the text is exactly six hex digits
    /// after an optional leading `#`.
    pub fn parse(text: &str) -> Result<Self, ColorError> {
        let digits = text.strip_prefix('#').unwrap_or(text);
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ColorError::Malformed(text.to_owned()));
        }
        u32::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| ColorError::Malformed(text.to_owned()))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

impl TryFrom<String> for Rgb {
    type Error = ColorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// `identify`: optional identity binding for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub identity: String,
}

/// An unconfirmed paint as relayed between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelPainted {
    pub x: u32,
    pub y: u32,
    pub color: Rgb,
    /// Painter identity. Inbound paints may omit it; the hub fills it in.
    #[serde(default)]
    pub owner: String,
    /// Milliseconds since epoch. Zero means "stamp on arrival".
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// A cursor position ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoved {
    /// Filled in by the hub; whatever a client sends here is overwritten.
    #[serde(default)]
    pub session_id: String,
    pub x: u32,
    pub y: u32,
    pub color: Rgb,
    #[serde(default)]
    pub timestamp: i64,
}

/// First message a session receives after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub session_id: String,
    pub active_sessions: usize,
    pub recent_paints: Vec<PixelPainted>,
}

/// `user_joined` / `user_left` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub session_id: String,
    pub timestamp: i64,
}

/// Aggregate relay statistics, derived from the in-memory paint history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasStats {
    pub active_sessions: usize,
    pub total_paints: usize,
    pub paints_per_second: f64,
    pub unique_artists: usize,
    #[serde(default)]
    pub recent_paints: usize,
    #[serde(default)]
    pub hourly_paints: usize,
    #[serde(default)]
    pub timestamp: i64,
}

/// Rectangle request against the hub's paint history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionRequest {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionRequest {
    /// Whether `(x, y)` lies inside the half-open rectangle.
    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.start_x
            && y >= self.start_y
            && u64::from(x) < u64::from(self.start_x) + u64::from(self.width)
            && u64::from(y) < u64::from(self.start_y) + u64::from(self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionData {
    #[serde(flatten)]
    pub region: RegionRequest,
    pub pixels: Vec<PixelPainted>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasData {
    pub pixels: Vec<PixelPainted>,
    pub active_sessions: usize,
    pub stats: CanvasStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// =============================================================================
// MESSAGE
// =============================================================================

/// Raw envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Every message of the relay protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Identify(Identify),
    Welcome(Welcome),
    PixelPainted(PixelPainted),
    CursorMoved(CursorMoved),
    UserJoined(Presence),
    UserLeft(Presence),
    CanvasStats(CanvasStats),
    JoinRegion(RegionRequest),
    RegionData(RegionData),
    RequestCanvasData,
    CanvasData(CanvasData),
    Error(ErrorPayload),
}

impl Message {
    /// The envelope `type` string for this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify(_) => "identify",
            Self::Welcome(_) => "welcome",
            Self::PixelPainted(_) => "pixel_painted",
            Self::CursorMoved(_) => "cursor_moved",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::CanvasStats(_) => "canvas_stats",
            Self::JoinRegion(_) => "join_region",
            Self::RegionData(_) => "region_data",
            Self::RequestCanvasData => "request_canvas_data",
            Self::CanvasData(_) => "canvas_data",
            Self::Error(_) => "error",
        }
    }

    /// Convenience constructor for `error` replies.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload { message: message.into() })
    }

    /// Build the wire envelope for this message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] if the payload cannot be represented as JSON.
    pub fn to_envelope(&self) -> Result<Envelope, CodecError> {
        let payload = match self {
            Self::Identify(p) => to_payload(self.kind(), p)?,
            Self::Welcome(p) => to_payload(self.kind(), p)?,
            Self::PixelPainted(p) => to_payload(self.kind(), p)?,
            Self::CursorMoved(p) => to_payload(self.kind(), p)?,
            Self::UserJoined(p) | Self::UserLeft(p) => to_payload(self.kind(), p)?,
            Self::CanvasStats(p) => to_payload(self.kind(), p)?,
            Self::JoinRegion(p) => to_payload(self.kind(), p)?,
            Self::RegionData(p) => to_payload(self.kind(), p)?,
            Self::RequestCanvasData => Value::Object(serde_json::Map::new()),
            Self::CanvasData(p) => to_payload(self.kind(), p)?,
            Self::Error(p) => to_payload(self.kind(), p)?,
        };
        Ok(Envelope { kind: self.kind().to_owned(), payload })
    }

    /// Parse a typed message out of a raw envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownType`] for unrecognised `type` strings and
    /// [`CodecError::Payload`] when the payload does not fit the schema.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, CodecError> {
        let Envelope { kind, payload } = envelope;
        let message = match kind.as_str() {
            "identify" => Self::Identify(from_payload(&kind, payload)?),
            "welcome" => Self::Welcome(from_payload(&kind, payload)?),
            "pixel_painted" => Self::PixelPainted(from_payload(&kind, payload)?),
            "cursor_moved" => Self::CursorMoved(from_payload(&kind, payload)?),
            "user_joined" => Self::UserJoined(from_payload(&kind, payload)?),
            "user_left" => Self::UserLeft(from_payload(&kind, payload)?),
            "canvas_stats" => Self::CanvasStats(from_payload(&kind, payload)?),
            "join_region" => Self::JoinRegion(from_payload(&kind, payload)?),
            "region_data" => Self::RegionData(from_payload(&kind, payload)?),
            "request_canvas_data" => Self::RequestCanvasData,
            "canvas_data" => Self::CanvasData(from_payload(&kind, payload)?),
            "error" => Self::Error(from_payload(&kind, payload)?),
            _ => return Err(CodecError::UnknownType(kind)),
        };
        Ok(message)
    }
}

/// Encode a message as envelope JSON text.
///
/// # Errors
///
/// Returns a [`CodecError`] if serialization fails.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    let envelope = message.to_envelope()?;
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode envelope JSON text into a typed message.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed text, plus the errors of
/// [`Message::from_envelope`].
pub fn decode(text: &str) -> Result<Message, CodecError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Message::from_envelope(envelope)
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

fn to_payload<T: Serialize>(kind: &str, payload: &T) -> Result<Value, CodecError> {
    serde_json::to_value(payload).map_err(|source| CodecError::Payload { kind: kind.to_owned(), source })
}

fn from_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, CodecError> {
    // A missing payload decodes as an empty object so optional-only payloads still parse.
    let payload = if payload.is_null() { Value::Object(serde_json::Map::new()) } else { payload };
    serde_json::from_value(payload).map_err(|source| CodecError::Payload { kind: kind.to_owned(), source })
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
