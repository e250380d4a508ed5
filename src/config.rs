//! 환경 변수 기반 채팅 설정 관리

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

/// 메시지 1건의 평균 상주 크기 추정치 (바이트)
pub const AVG_MESSAGE_SIZE_BYTES: u64 = 500;
/// 사용자 레코드 1건의 평균 크기 추정치 (바이트)
pub const AVG_USER_SIZE_BYTES: u64 = 200;

/// 채팅 서버 설정
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,

    // 메모리 한도
    pub max_memory_mb: u64,
    pub max_messages_per_stream: usize,
    pub max_users_per_stream: usize,

    // 시간 한도
    pub message_retention_minutes: u64,
    pub cleanup_interval_minutes: u64,
    /// 환경 변수로 조정하지 않는다 (고정 10분)
    pub inactive_stream_timeout: Duration,

    // 속도 제한
    pub max_messages_per_minute: u32,
    pub max_characters_per_message: usize,
    pub spam_threshold_messages: u32,
    pub spam_timeout_minutes: u64,

    // 기능 플래그
    pub enable_viewer_list: bool,
    pub enable_mentions: bool,
    pub enable_typing_status: bool,
    pub enable_emojis: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),

            max_memory_mb: 100,
            max_messages_per_stream: 500,
            max_users_per_stream: 100,

            message_retention_minutes: 30,
            cleanup_interval_minutes: 5,
            inactive_stream_timeout: Duration::from_secs(10 * 60),

            max_messages_per_minute: 10,
            max_characters_per_message: 500,
            spam_threshold_messages: 20,
            spam_timeout_minutes: 5,

            enable_viewer_list: true,
            enable_mentions: true,
            enable_typing_status: false,
            enable_emojis: true,
        }
    }
}

impl ChatConfig {
    /// 환경 변수에서 설정 로드 (파싱 실패 시 기본값 유지)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),

            max_memory_mb: env_parse("CHAT_MAX_MEMORY_MB", defaults.max_memory_mb),
            max_messages_per_stream: env_parse(
                "CHAT_MAX_MESSAGES_PER_STREAM",
                defaults.max_messages_per_stream,
            ),
            max_users_per_stream: env_parse(
                "CHAT_MAX_USERS_PER_STREAM",
                defaults.max_users_per_stream,
            ),

            message_retention_minutes: env_parse(
                "CHAT_MESSAGE_RETENTION_MINUTES",
                defaults.message_retention_minutes,
            ),
            cleanup_interval_minutes: env_parse(
                "CHAT_CLEANUP_INTERVAL_MINUTES",
                defaults.cleanup_interval_minutes,
            ),
            inactive_stream_timeout: defaults.inactive_stream_timeout,

            max_messages_per_minute: env_parse(
                "CHAT_MAX_MESSAGES_PER_MINUTE",
                defaults.max_messages_per_minute,
            ),
            max_characters_per_message: env_parse(
                "CHAT_MAX_CHARACTERS_PER_MESSAGE",
                defaults.max_characters_per_message,
            ),
            spam_threshold_messages: env_parse(
                "CHAT_SPAM_THRESHOLD_MESSAGES",
                defaults.spam_threshold_messages,
            ),
            spam_timeout_minutes: env_parse(
                "CHAT_SPAM_TIMEOUT_MINUTES",
                defaults.spam_timeout_minutes,
            ),

            enable_viewer_list: env_bool("CHAT_ENABLE_VIEWER_LIST", defaults.enable_viewer_list),
            enable_mentions: env_bool("CHAT_ENABLE_MENTIONS", defaults.enable_mentions),
            enable_typing_status: env_bool(
                "CHAT_ENABLE_TYPING_STATUS",
                defaults.enable_typing_status,
            ),
            enable_emojis: env_bool("CHAT_ENABLE_EMOJIS", defaults.enable_emojis),
        }
    }

    /// 설정 기준 수용량 추정치 계산
    pub fn capacity(&self) -> CapacityEstimate {
        let total_memory_bytes = self.max_memory_mb * 1024 * 1024;

        let message_memory_per_stream =
            self.max_messages_per_stream as u64 * AVG_MESSAGE_SIZE_BYTES;
        let user_memory_per_stream = self.max_users_per_stream as u64 * AVG_USER_SIZE_BYTES;
        let total_per_stream = (message_memory_per_stream + user_memory_per_stream).max(1);

        let max_streams = total_memory_bytes / total_per_stream;

        CapacityEstimate {
            max_memory_mb: self.max_memory_mb,
            max_messages_per_stream: self.max_messages_per_stream,
            max_users_per_stream: self.max_users_per_stream,
            estimated_max_streams: max_streams,
            total_message_capacity: max_streams * self.max_messages_per_stream as u64,
            avg_message_size_bytes: AVG_MESSAGE_SIZE_BYTES,
            memory_per_stream_kb: total_per_stream / 1024,
        }
    }
}

/// 설정에서 파생한 수용량 추정치 (stats 응답의 config 블록)
#[derive(Debug, Clone, Serialize)]
pub struct CapacityEstimate {
    pub max_memory_mb: u64,
    pub max_messages_per_stream: usize,
    pub max_users_per_stream: usize,
    pub estimated_max_streams: u64,
    pub total_message_capacity: u64,
    pub avg_message_size_bytes: u64,
    pub memory_per_stream_kb: u64,
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).map(|v| v == "true").unwrap_or(default)
}
