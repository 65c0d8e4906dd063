//! Line-delimited JSON envelopes spoken by CozyLife plugs on TCP port 5555.
//! Requests end in `\r\n`, replies in `\n`. Reply lines that are not JSON
//! objects are dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const PROTOCOL_VERSION: u8 = 0;
pub const REQUEST_TERMINATOR: &[u8] = b"\r\n";

pub const ATTR_ALL: u32 = 0;
pub const ATTR_SWITCH: u32 = 1;
pub const ATTR_CURRENT_MA: u32 = 27;
pub const ATTR_POWER_W: u32 = 28;
pub const ATTR_VOLTAGE_V: u32 = 29;

pub const SWITCH_ON: u8 = 255;
pub const SWITCH_OFF: u8 = 0;

pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CommandCode {
    Info,
    Query,
    Set,
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> Self {
        match code {
            CommandCode::Info => 0,
            CommandCode::Query => 2,
            CommandCode::Set => 3,
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Info),
            2 => Ok(Self::Query),
            3 => Ok(Self::Set),
            other => Err(format!("unknown command code {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    Attributes,
    // Legacy `[0]`: the device answers with everything it knows.
    All,
}

impl QueryMode {
    pub fn attributes(self) -> Vec<u32> {
        match self {
            Self::Attributes => vec![ATTR_SWITCH, ATTR_CURRENT_MA, ATTR_POWER_W, ATTR_VOLTAGE_V],
            Self::All => vec![ATTR_ALL],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attr: Vec<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<u32, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub pv: u8,
    pub cmd: CommandCode,
    pub sn: String,
    pub msg: CommandMessage,
}

impl CommandEnvelope {
    pub fn info(sn: String) -> Self {
        Self::with_message(CommandCode::Info, sn, CommandMessage::default())
    }

    pub fn query(sn: String, attributes: Vec<u32>) -> Self {
        Self::with_message(
            CommandCode::Query,
            sn,
            CommandMessage {
                attr: attributes,
                data: BTreeMap::new(),
            },
        )
    }

    pub fn set(sn: String, payload: BTreeMap<u32, Value>) -> Self {
        Self::with_message(
            CommandCode::Set,
            sn,
            CommandMessage {
                attr: payload.keys().copied().collect(),
                data: payload,
            },
        )
    }

    pub fn switch(sn: String, on: bool) -> Self {
        let level = if on { SWITCH_ON } else { SWITCH_OFF };
        Self::set(sn, BTreeMap::from([(ATTR_SWITCH, Value::from(level))]))
    }

    fn with_message(cmd: CommandCode, sn: String, msg: CommandMessage) -> Self {
        Self {
            pv: PROTOCOL_VERSION,
            cmd,
            sn,
            msg,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut frame = serde_json::to_vec(self)?;
        frame.extend_from_slice(REQUEST_TERMINATOR);
        Ok(frame)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub res: Option<i64>,
    #[serde(default)]
    pub cmd: Option<i64>,
    #[serde(default)]
    pub sn: Option<Value>,
    #[serde(default)]
    pub msg: Option<Value>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.res == Some(0)
    }

    pub fn message(&self) -> Option<&serde_json::Map<String, Value>> {
        self.msg
            .as_ref()
            .and_then(Value::as_object)
            .filter(|msg| !msg.is_empty())
    }

    // A message without a data block yields an empty mapping.
    pub fn data(&self) -> Option<Attributes> {
        let msg = self.message()?;
        let data = msg
            .get("data")
            .and_then(Value::as_object)
            .map(|data| data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Some(data)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

fn decode_line(line: &[u8]) -> Result<Option<ResponseEnvelope>, DecodeError> {
    let text = std::str::from_utf8(line)?.trim();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    skipped: usize,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_response(&mut self) -> Option<ResponseEnvelope> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            match decode_line(&line) {
                Ok(Some(response)) => return Some(response),
                Ok(None) => {}
                Err(err) => {
                    self.skipped += 1;
                    debug!(len = line.len(), %err, "skipping undecodable reply line");
                }
            }
        }
        None
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// Millisecond timestamps, strictly increasing within a client.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub fn next(&self) -> String {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_envelope_survives_encode_and_decode() {
        // Arrange
        let envelope = CommandEnvelope::set(
            "1700000000000".to_string(),
            BTreeMap::from([(1, json!(0))]),
        );

        // Act
        let frame = envelope.encode().expect("encode");
        let decoded: CommandEnvelope =
            serde_json::from_slice(&frame[..frame.len() - 2]).expect("decode");

        // Assert
        assert_eq!(decoded.cmd, CommandCode::Set);
        assert_eq!(decoded.pv, 0);
        assert_eq!(decoded.msg.attr, vec![1]);
        assert_eq!(decoded.msg.data, BTreeMap::from([(1, json!(0))]));
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn wire_shapes_match_device_dialect() {
        let info: Value = serde_json::to_value(CommandEnvelope::info("1".into())).expect("info");
        assert_eq!(info, json!({"pv": 0, "cmd": 0, "sn": "1", "msg": {}}));

        let query: Value = serde_json::to_value(CommandEnvelope::query(
            "2".into(),
            QueryMode::Attributes.attributes(),
        ))
        .expect("query");
        assert_eq!(
            query,
            json!({"pv": 0, "cmd": 2, "sn": "2", "msg": {"attr": [1, 27, 28, 29]}})
        );

        let on: Value = serde_json::to_value(CommandEnvelope::switch("3".into(), true)).expect("set");
        assert_eq!(
            on,
            json!({"pv": 0, "cmd": 3, "sn": "3", "msg": {"attr": [1], "data": {"1": 255}}})
        );
    }

    #[test]
    fn legacy_query_asks_for_attribute_zero() {
        assert_eq!(QueryMode::All.attributes(), vec![0]);
    }

    #[test]
    fn frames_end_with_crlf() {
        let frame = CommandEnvelope::info("9".into()).encode().expect("encode");
        assert!(frame.ends_with(b"\r\n"));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        let err = serde_json::from_value::<CommandEnvelope>(
            json!({"pv": 0, "cmd": 7, "sn": "1", "msg": {}}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn decoder_skips_garbage_line_before_valid_reply() {
        // Arrange
        let mut decoder = LineDecoder::default();
        decoder.push(b"garbage\n{\"res\":0,\"msg\":{\"data\":{\"1\":255}}}\n");

        // Act
        let response = decoder.next_response().expect("second line parses");

        // Assert
        assert!(response.is_success());
        assert_eq!(response.data(), Some(Attributes::from([("1".into(), json!(255))])));
        assert_eq!(decoder.skipped(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_skips_invalid_utf8_and_blank_lines() {
        let mut decoder = LineDecoder::default();
        decoder.push(&[0xff, 0xfe, b'\n']);
        decoder.push(b"\r\n");
        decoder.push(b"{\"res\":0}\n");

        let response = decoder.next_response().expect("valid line");
        assert!(response.is_success());
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn decoder_waits_for_terminator_across_chunks() {
        let mut decoder = LineDecoder::default();
        decoder.push(b"{\"res\":");
        assert!(decoder.next_response().is_none());
        assert_eq!(decoder.pending(), 7);

        decoder.push(b"1}\n{\"res\":0}\n");
        let first = decoder.next_response().expect("first reply");
        assert_eq!(first.res, Some(1));
        assert!(!first.is_success());
    }

    #[test]
    fn reply_without_message_has_no_data() {
        let bare: ResponseEnvelope = serde_json::from_str(r#"{"res":0}"#).expect("parse");
        assert!(bare.data().is_none());

        let empty: ResponseEnvelope = serde_json::from_str(r#"{"res":0,"msg":{}}"#).expect("parse");
        assert!(empty.data().is_none());

        let no_data: ResponseEnvelope =
            serde_json::from_str(r#"{"res":0,"msg":{"attr":[1]}}"#).expect("parse");
        assert_eq!(no_data.data(), Some(Attributes::new()));
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let sequence = SequenceGenerator::default();
        let first: u64 = sequence.next().parse().expect("numeric");
        let second: u64 = sequence.next().parse().expect("numeric");
        let third: u64 = sequence.next().parse().expect("numeric");

        assert!(second > first);
        assert!(third > second);
        assert!(first > 1_600_000_000_000);
    }
}
