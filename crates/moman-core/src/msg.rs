//! Wire messages and their JSON codec.
//!
//! Both messages travel as a single JSON object per connection
//! direction; the byte stream is delimited by the sender half-closing
//! its write side, so no length prefix or terminator appears here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{Command, ErrorCode};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing mandatory field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    InvalidField(&'static str),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request: numeric opcode plus an optional JSON-object payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cmd {
    pub cmd: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Cmd {
    pub fn new(cmd: impl Into<u32>) -> Self {
        Self {
            cmd: cmd.into(),
            payload: None,
        }
    }

    pub fn with_payload(cmd: impl Into<u32>, payload: Value) -> Self {
        Self {
            cmd: cmd.into(),
            payload: Some(payload),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.cmd).ok()
    }

    /// String payload argument, if the payload is an object carrying it.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }
}

/// A reply: numeric error code (zero means success) plus optional
/// human-readable `info` and optional structured `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub error: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            error: ErrorCode::Ok.into(),
            info: None,
            payload: None,
        }
    }

    pub fn from_error(error: impl Into<u32>) -> Self {
        Self {
            error: error.into(),
            info: None,
            payload: None,
        }
    }

    pub fn bad(error: impl Into<u32>, info: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            info: Some(info.into()),
            payload: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error == u32::from(ErrorCode::Ok)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.error).ok()
    }
}

pub fn encode_cmd(cmd: &Cmd) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(cmd)?)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(response)?)
}

/// Decodes a `Cmd`, distinguishing a missing `cmd` field from one of
/// the wrong type. Serde derive alone collapses both into a generic
/// parse error, which is too coarse for the protocol's error taxonomy.
pub fn decode_cmd(bytes: &[u8]) -> Result<Cmd, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let obj = value.as_object().ok_or(CodecError::NotAnObject)?;
    let cmd = match obj.get("cmd") {
        None => return Err(CodecError::MissingField("cmd")),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(CodecError::InvalidField("cmd"))?,
    };
    let payload = match obj.get("payload") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.clone()),
    };
    Ok(Cmd { cmd, payload })
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let obj = value.as_object().ok_or(CodecError::NotAnObject)?;
    let error = match obj.get("error") {
        None => return Err(CodecError::MissingField("error")),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(CodecError::InvalidField("error"))?,
    };
    let info = match obj.get("info") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_str()
                .ok_or(CodecError::InvalidField("info"))?
                .to_string(),
        ),
    };
    let payload = match obj.get("payload") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.clone()),
    };
    Ok(Response {
        error,
        info,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cmd_round_trip() {
        let cmd = Cmd::with_payload(Command::MmAddMonitor, json!({"name": "Footsites"}));
        let bytes = encode_cmd(&cmd).unwrap();
        let back = decode_cmd(&bytes).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.command(), Some(Command::MmAddMonitor));
        assert_eq!(back.payload_str("name"), Some("Footsites"));
    }

    #[test]
    fn cmd_without_payload_omits_the_field() {
        let bytes = encode_cmd(&Cmd::new(Command::Ping)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("payload"));
        let back = decode_cmd(text.as_bytes()).unwrap();
        assert_eq!(back.payload, None);
    }

    #[test]
    fn response_round_trip() {
        let resp = Response::bad(ErrorCode::MmCouldntAddMonitor, "Monitor already started.")
            .with_payload(json!({"detail": 1}));
        let bytes = encode_response(&resp).unwrap();
        assert_eq!(decode_response(&bytes).unwrap(), resp);
    }

    #[test]
    fn missing_cmd_field() {
        let err = decode_cmd(br#"{"payload": {}}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("cmd")));
    }

    #[test]
    fn non_integer_cmd_field() {
        let err = decode_cmd(br#"{"cmd": "PING"}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField("cmd")));
    }

    #[test]
    fn missing_error_field() {
        let err = decode_response(br#"{"info": "Pong"}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("error")));
    }

    #[test]
    fn null_payload_reads_as_absent() {
        let cmd = decode_cmd(br#"{"cmd": 1, "payload": null}"#).unwrap();
        assert_eq!(cmd.payload, None);
    }

    #[test]
    fn garbage_is_a_json_error() {
        assert!(matches!(
            decode_cmd(b"not json").unwrap_err(),
            CodecError::Json(_)
        ));
        assert!(matches!(
            decode_cmd(b"[1,2,3]").unwrap_err(),
            CodecError::NotAnObject
        ));
    }

    #[test]
    fn unknown_error_code_still_decodes() {
        let resp = decode_response(br#"{"error": 4242}"#).unwrap();
        assert_eq!(resp.error, 4242);
        assert_eq!(resp.error_code(), None);
        assert!(!resp.is_ok());
    }
}
