//! 클라이언트-서버 채팅 프레임 정의
//!
//! 프레임은 `{"type": ..., "data"?: ..., "error"?: ..., "timestamp"?: ...}`
//! 형태의 JSON 객체다. 서버 발신 프레임은 항상 timestamp를 싣는다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::room::{ChatMessage, ChatUser};

/// 클라이언트 수신 프레임. type별 검증을 위해 느슨하게 받는다
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// `join` 페이로드
#[derive(Debug, Deserialize)]
pub struct JoinData {
    #[serde(default, rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

/// `message` 페이로드
#[derive(Debug, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub message: String,
}

/// `typing` 페이로드
#[derive(Debug, Deserialize)]
pub struct TypingData {
    #[serde(default, rename = "isTyping")]
    pub is_typing: bool,
}

/// 서버 → 클라이언트 이벤트. type 태그와 data 페이로드로 직렬화된다
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    History(Vec<ChatMessage>),
    Users(Vec<ChatUser>),
    Message(ChatMessage),
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, username: String },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String, username: String },
    #[serde(rename_all = "camelCase")]
    Typing {
        user_id: String,
        username: String,
        is_typing: bool,
    },
    Timeout { duration: f64 },
    System { message: String },
    /// T2a(버스트) 거부 전용. 본문은 error 필드에 실린다
    RateLimit,
    /// 그 외 거부와 프로토콜 오류. 본문은 error 필드에 실린다
    Error,
}

/// 서버 발신 와이어 프레임
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServerFrame {
    pub fn event(event: ServerEvent) -> Self {
        Self {
            event,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: ServerEvent::Error,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self {
            event: ServerEvent::RateLimit,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_frame_serializes_type_data_timestamp() {
        let frame = ServerFrame::event(ServerEvent::UserJoined {
            user_id: "u1".to_string(),
            username: "Ann".to_string(),
        });
        let value: Value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], "user_joined");
        assert_eq!(value["data"]["userId"], "u1");
        assert_eq!(value["data"]["username"], "Ann");
        assert!(value["timestamp"].is_string());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_frame_omits_data_and_carries_error() {
        let frame = ServerFrame::error("TIMEOUT: You are timed out.");
        let value: Value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "TIMEOUT: You are timed out.");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn rate_limit_frame_uses_error_field() {
        let frame = ServerFrame::rate_limit("RATE_LIMIT: Slow down!");
        let value: Value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], "rate_limit");
        assert_eq!(value["error"], "RATE_LIMIT: Slow down!");
    }

    #[test]
    fn message_payload_uses_camel_case_fields() {
        let msg = ChatMessage {
            id: "m1".to_string(),
            stream_key: "s1".to_string(),
            user_id: "u1".to_string(),
            username: "Ann".to_string(),
            message: "hi".to_string(),
            timestamp: Utc::now(),
        };
        let value: Value =
            serde_json::to_value(ServerFrame::event(ServerEvent::Message(msg))).unwrap();

        assert_eq!(value["data"]["streamKey"], "s1");
        assert_eq!(value["data"]["userId"], "u1");
        assert!(value["data"]["timestamp"].is_string());
    }

    #[test]
    fn inbound_frame_parses_loosely() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"join","data":{"userId":"u1","username":"Ann"}}"#)
                .unwrap();
        assert_eq!(frame.kind.as_ref().and_then(Value::as_str), Some("join"));

        let join: JoinData = serde_json::from_value(frame.data.unwrap()).unwrap();
        assert_eq!(join.user_id, "u1");
        assert_eq!(join.username, "Ann");

        // type이 문자열이 아니어도 파싱 자체는 성공한다
        let frame: InboundFrame = serde_json::from_str(r#"{"type":42}"#).unwrap();
        assert!(frame.kind.as_ref().and_then(Value::as_str).is_none());

        // 누락 필드는 기본값으로 채워진다
        let join: JoinData = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(join.user_id.is_empty());
    }
}
