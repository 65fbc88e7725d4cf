/// OneBot gateway wire types.
///
/// Outbound calls are `{action, params, echo}` JSON frames. Inbound frames are
/// either responses carrying the echo back, or untagged event payloads.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::GatewayError;

// ====== REQUEST (bot -> gateway) ======

/// An outbound API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    pub echo: String,
}

impl ApiRequest {
    pub fn new(action: impl Into<String>, params: Value, echo: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params,
            echo: echo.into(),
        }
    }

    /// Serialize to a single text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Handshake frame sent right after connecting when an access token is set.
pub fn auth_frame(token: &str) -> Value {
    serde_json::json!({
        "type": "auth",
        "token": token,
    })
}

// ====== RESPONSE (gateway -> bot) ======

/// Response to an [`ApiRequest`], matched by echo.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub echo: String,
    pub status: String,
    pub retcode: i64,
    pub data: Value,
    pub message: Option<String>,
}

impl ApiResponse {
    /// Build from a decoded frame. Returns `None` when the frame has no echo.
    pub fn from_value(value: &Value) -> Option<Self> {
        let echo = match value.get("echo")? {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(Self {
            echo,
            status: value
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("ok")
                .to_string(),
            retcode: value.get("retcode").and_then(|v| v.as_i64()).unwrap_or(0),
            data: value.get("data").cloned().unwrap_or(Value::Null),
            message: value
                .get("msg")
                .or_else(|| value.get("wording"))
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }

    /// Turn a failure status into a [`GatewayError::Rejected`].
    pub fn into_result(self) -> Result<Self, GatewayError> {
        if self.is_failed() {
            Err(GatewayError::Rejected {
                retcode: self.retcode,
                message: self.message.unwrap_or_else(|| "unknown error".to_string()),
            })
        } else {
            Ok(self)
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ApiResponse),
    Event(Value),
}

impl InboundFrame {
    /// Parse a text frame. Frames carrying an echo are responses; anything
    /// else is a gateway event.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(match ApiResponse::from_value(&value) {
            Some(response) => InboundFrame::Response(response),
            None => InboundFrame::Event(value),
        })
    }
}

// ====== EVENTS ======

/// The fields of a group message event the bot consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub group_id: i64,
    pub user_id: i64,
    /// Concatenated text content, trimmed.
    pub text: String,
}

impl GroupMessage {
    /// Extract a group message from an event payload.
    /// Returns `None` for anything that is not `post_type=message`,
    /// `message_type=group`.
    pub fn from_event(event: &Value) -> Option<Self> {
        if event.get("post_type").and_then(|v| v.as_str()) != Some("message") {
            return None;
        }
        if event.get("message_type").and_then(|v| v.as_str()) != Some("group") {
            return None;
        }
        let group_id = event.get("group_id").and_then(|v| v.as_i64())?;
        let user_id = event.get("user_id").and_then(|v| v.as_i64())?;
        let text = match event.get("message") {
            Some(Value::Array(segments)) => segments
                .iter()
                .filter(|seg| seg.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|seg| seg.get("data").and_then(|d| d.get("text")).and_then(|t| t.as_str()))
                .collect::<String>(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Some(Self {
            group_id,
            user_id,
            text: text.trim().to_string(),
        })
    }
}

// ====== CONVENIENCE BUILDERS ======

/// Params for a plain group text message (`send_msg`).
pub fn group_text_params(group_id: i64, text: &str) -> Value {
    serde_json::json!({
        "message_type": "group",
        "group_id": group_id,
        "message": text,
    })
}

/// Params for a group file attachment (`send_group_msg`).
pub fn group_file_params(group_id: i64, name: &str, file_path: &str) -> Value {
    serde_json::json!({
        "group_id": group_id,
        "message": [
            {
                "type": "file",
                "data": {
                    "name": name,
                    "file": file_path,
                    "path": name,
                }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = ApiRequest::new("send_msg", group_text_params(42, "hi"), "7");
        let json = req.to_json().unwrap();
        assert!(json.contains("\"action\":\"send_msg\""));
        assert!(json.contains("\"echo\":\"7\""));
        assert!(json.contains("\"group_id\":42"));
    }

    #[test]
    fn test_response_frame() {
        let frame = InboundFrame::parse(r#"{"status":"ok","retcode":0,"data":{"message_id":9},"echo":"12"}"#).unwrap();
        match frame {
            InboundFrame::Response(resp) => {
                assert_eq!(resp.echo, "12");
                assert!(!resp.is_failed());
                assert_eq!(resp.data["message_id"], 9);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_echo_is_stringified() {
        let frame = InboundFrame::parse(r#"{"status":"ok","echo":33}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Response(ref r) if r.echo == "33"));
    }

    #[test]
    fn test_failed_response_is_rejected() {
        let frame = InboundFrame::parse(r#"{"status":"failed","retcode":1404,"msg":"no such group","echo":"1"}"#).unwrap();
        let InboundFrame::Response(resp) = frame else {
            panic!("Expected response");
        };
        match resp.into_result() {
            Err(GatewayError::Rejected { retcode, message }) => {
                assert_eq!(retcode, 1404);
                assert_eq!(message, "no such group");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_event_frame_without_echo() {
        let frame = InboundFrame::parse(r#"{"post_type":"meta_event","meta_event_type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Event(_)));
    }

    #[test]
    fn test_group_message_from_segments() {
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "group",
            "group_id": 1001,
            "user_id": 55,
            "message": [
                {"type": "at", "data": {"qq": "123"}},
                {"type": "text", "data": {"text": " /jm "}},
                {"type": "text", "data": {"text": "350234 "}}
            ]
        });
        let msg = GroupMessage::from_event(&event).unwrap();
        assert_eq!(msg.group_id, 1001);
        assert_eq!(msg.user_id, 55);
        assert_eq!(msg.text, "/jm 350234");
    }

    #[test]
    fn test_group_message_from_string() {
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "group",
            "group_id": 1,
            "user_id": 2,
            "message": "  /帮助 "
        });
        assert_eq!(GroupMessage::from_event(&event).unwrap().text, "/帮助");
    }

    #[test]
    fn test_private_message_ignored() {
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "private",
            "user_id": 2,
            "message": "/jm 1"
        });
        assert!(GroupMessage::from_event(&event).is_none());
    }

    #[test]
    fn test_file_params_shape() {
        let params = group_file_params(9, "【1】.pdf", "/tmp/x.pdf");
        let seg = &params["message"][0];
        assert_eq!(seg["type"], "file");
        assert_eq!(seg["data"]["file"], "/tmp/x.pdf");
        assert_eq!(seg["data"]["name"], "【1】.pdf");
    }
}
