//! Command channel wire format.
//!
//! ```text
//!   ┌──────────────┬───────────────────────────────────────────┐
//!   │ len: u32 BE  │ {"command": <string>, "value": <any>}     │
//!   └──────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Frames larger than `MAX_FRAME_LEN` are rejected before any allocation.

use lanepilot_env::Fault;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted JSON payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

/// Framing and payload errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the 64 KiB limit")]
    FrameTooLarge(usize),

    #[error("Connection closed mid-frame")]
    UnexpectedEof,
}

impl From<WireError> for Fault {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(_) | WireError::UnexpectedEof => Fault::transport(err.to_string()),
            WireError::Json(_) | WireError::FrameTooLarge(_) => Fault::protocol(err.to_string()),
        }
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// One command exchanged between the nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,

    #[serde(default)]
    pub value: Value,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            command: command.into(),
            value: value.into(),
        }
    }

    /// The server's default acknowledgment: `{"command":"status","value":"ok"}`.
    pub fn status_ok() -> Self {
        Self::new("status", "ok")
    }

    /// Reply sent when a request could not be decoded.
    pub fn status_error(reason: impl Into<String>) -> Self {
        Self::new("status", Value::String(format!("error: {}", reason.into())))
    }

    /// Liveness probe.
    pub fn ping() -> Self {
        Self::new("status", "ping")
    }

    pub fn exit() -> Self {
        Self::new("exit", Value::Null)
    }

    pub fn switch(switch: LaneSwitch) -> Self {
        Self::new("switch", switch.to_string())
    }

    pub fn is_exit(&self) -> bool {
        self.command == "exit"
    }

    pub fn is_ping(&self) -> bool {
        self.command == "status" && self.value.as_str() == Some("ping")
    }

    pub fn is_status_ok(&self) -> bool {
        self.command == "status" && self.value.as_str() == Some("ok")
    }

    /// Serializes into a length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Parses a frame payload (without the length prefix).
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// ============================================================================
// LANE SWITCH VALUE
// ============================================================================

/// Errors parsing a `"switch"` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchParseError {
    #[error("Switch value '{0}' has no '-->' separator")]
    MissingArrow(String),

    #[error("Invalid lane id '{0}'")]
    InvalidLane(String),

    #[error("Unsupported switch value: {0}")]
    UnsupportedValue(String),
}

impl From<SwitchParseError> for Fault {
    fn from(err: SwitchParseError) -> Self {
        Fault::protocol(err.to_string())
    }
}

/// A `fromLane --> toLane` decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaneSwitch {
    pub from: i64,
    pub to: i64,
}

impl LaneSwitch {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// Accepts `"a-->b"` or `[a, b]`.
    pub fn from_value(value: &Value) -> Result<Self, SwitchParseError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Array(items) if items.len() == 2 => {
                let lane = |v: &Value| v.as_i64().ok_or_else(|| SwitchParseError::InvalidLane(v.to_string()));
                Ok(Self::new(lane(&items[0])?, lane(&items[1])?))
            }
            other => Err(SwitchParseError::UnsupportedValue(other.to_string())),
        }
    }
}

impl fmt::Display for LaneSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-->{}", self.from, self.to)
    }
}

impl FromStr for LaneSwitch {
    type Err = SwitchParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once("-->")
            .ok_or_else(|| SwitchParseError::MissingArrow(s.to_string()))?;

        let lane = |part: &str| {
            let part = part.trim();
            part.parse::<i64>()
                .map_err(|_| SwitchParseError::InvalidLane(part.to_string()))
        };
        Ok(Self::new(lane(from)?, lane(to)?))
    }
}

// ============================================================================
// FRAMING
// ============================================================================

/// Writes one length-prefixed frame and flushes.
pub async fn write_frame<W>(writer: &mut W, message: &CommandMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame reader.
///
/// `read_frame` is cancel safe: bytes received before the future is
/// dropped stay in the buffer and are picked up by the next call, so it can
/// sit in a `tokio::select!` next to a poll timer.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(1024),
        }
    }

    /// Reads the next message. `Ok(None)` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<CommandMessage>, WireError> {
        loop {
            if let Some(message) = self.parse_buffered()? {
                return Ok(Some(message));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(WireError::UnexpectedEof)
                };
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<CommandMessage>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let result = CommandMessage::decode(&self.buf[HEADER_LEN..HEADER_LEN + len]);
        self.buf.drain(..HEADER_LEN + len);
        result.map(Some)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_ack_shape() {
        let ack = serde_json::to_value(CommandMessage::status_ok()).unwrap();
        assert_eq!(ack, json!({"command": "status", "value": "ok"}));
    }

    #[test]
    fn test_missing_value_defaults_to_null() {
        let msg: CommandMessage = serde_json::from_str(r#"{"command":"exit"}"#).unwrap();
        assert!(msg.is_exit());
        assert_eq!(msg.value, Value::Null);
    }

    #[test]
    fn test_switch_encoding() {
        let msg = CommandMessage::switch(LaneSwitch::new(0, 2));
        assert_eq!(msg.value, json!("0-->2"));
    }

    #[test]
    fn test_switch_parse_variants() {
        assert_eq!("0-->2".parse(), Ok(LaneSwitch::new(0, 2)));
        assert_eq!(" 3 --> 1 ".parse(), Ok(LaneSwitch::new(3, 1)));
        assert_eq!(LaneSwitch::from_value(&json!([1, 0])), Ok(LaneSwitch::new(1, 0)));
        assert_eq!(LaneSwitch::from_value(&json!("-1-->0")), Ok(LaneSwitch::new(-1, 0)));

        assert!(matches!("0->2".parse::<LaneSwitch>(), Err(SwitchParseError::MissingArrow(_))));
        assert!(matches!("a-->2".parse::<LaneSwitch>(), Err(SwitchParseError::InvalidLane(_))));
        assert!(matches!(
            LaneSwitch::from_value(&json!({"from": 0})),
            Err(SwitchParseError::UnsupportedValue(_))
        ));
    }

    #[tokio::test]
    async fn test_frames_survive_split_delivery() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut writer) = tokio::io::split(client);
        let (reader, _) = tokio::io::split(server);
        let mut reader = FrameReader::new(reader);

        let messages = vec![
            CommandMessage::new("switch", "0-->1"),
            CommandMessage::ping(),
            CommandMessage::exit(),
        ];
        let expected = messages.clone();

        tokio::spawn(async move {
            for m in &messages {
                let frame = m.encode().unwrap();
                // Dribble the bytes to force partial reads
                for chunk in frame.chunks(3) {
                    writer.write_all(chunk).await.unwrap();
                }
            }
        });

        for want in expected {
            assert_eq!(reader.read_frame().await.unwrap(), Some(want));
        }
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut frame = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(b"{}");
        let mut reader = FrameReader::new(&frame[..]);

        assert!(matches!(reader.read_frame().await, Err(WireError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof_error() {
        let frame = CommandMessage::status_ok().encode().unwrap();
        let mut reader = FrameReader::new(&frame[..frame.len() - 2]);
        assert!(matches!(reader.read_frame().await, Err(WireError::UnexpectedEof)));
    }
}
