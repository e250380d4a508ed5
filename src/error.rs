//! 채팅 계층 에러 정의

use thiserror::Error;

/// 채팅 계층 에러. 와이어에는 `CODE: message` 형태로 노출된다
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ChatError {
    pub code: &'static str,
    pub message: String,
}

impl ChatError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 방 정원 초과
    pub fn room_full() -> Self {
        Self::new("ROOM_FULL", "Chat room is full")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = ChatError::room_full();
        assert_eq!(err.to_string(), "ROOM_FULL: Chat room is full");
    }
}
