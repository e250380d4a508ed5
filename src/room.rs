//! 채팅방 데이터 모델 (메시지, 사용자, 방 상태)

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::AVG_MESSAGE_SIZE_BYTES;
use crate::ring::RingBuffer;

/// 채팅 메시지. 생성 후 불변이며 정확히 하나의 방 버퍼에 담긴다
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub stream_key: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// 상주 바이트 추정치 (고정 오버헤드 100B 포함)
    pub fn estimated_size(&self) -> u64 {
        (self.id.len()
            + self.stream_key.len()
            + self.user_id.len()
            + self.username.len()
            + self.message.len()
            + 100) as u64
    }
}

/// 방 명부에 등록된 사용자 레코드
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    pub user_id: String,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    pub last_message: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub char_count: u64,
    pub timeout_until: Option<DateTime<Utc>>,
    pub violations: u32,
    pub is_active: bool,
}

impl ChatUser {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            connected_at: Utc::now(),
            last_message: None,
            message_count: 0,
            char_count: 0,
            timeout_until: None,
            violations: 0,
            is_active: true,
        }
    }
}

struct MessageState {
    buffer: RingBuffer,
    /// 방 생성 이후 누적 메시지 수 (버퍼 크기와 별개)
    lifetime_count: u64,
    bytes_used: u64,
}

/// 스트림 하나에 대응하는 채팅방
///
/// 메시지 상태와 명부는 별도 락을 쓰므로 명부 읽기가 메시지 읽기를
/// 막지 않는다. 어느 락도 소켓 I/O를 하는 동안 쥐지 않는다.
pub struct ChatRoom {
    pub stream_key: String,
    messages: RwLock<MessageState>,
    users: RwLock<HashMap<String, ChatUser>>,
    last_activity: RwLock<Instant>,
}

impl ChatRoom {
    pub fn new(stream_key: impl Into<String>, max_messages: usize) -> Self {
        Self {
            stream_key: stream_key.into(),
            messages: RwLock::new(MessageState {
                buffer: RingBuffer::new(max_messages),
                lifetime_count: 0,
                bytes_used: 0,
            }),
            users: RwLock::new(HashMap::new()),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// 메시지 추가. 버퍼가 가득 차면 가장 오래된 메시지를 말없이 밀어내고
    /// 평균 크기 추정치만큼 바이트 집계를 깎는다
    pub fn add_message(&self, msg: ChatMessage) {
        self.add_message_with(msg, |_| {});
    }

    /// 메시지를 추가하고, 메시지 락을 쥔 채로 `deliver`를 호출한다.
    /// 수신자별 큐 적재 순서가 추가 순서와 일치해야 하는 팬아웃 경로용.
    /// `deliver`는 블로킹 없이 즉시 반환해야 한다 (비블로킹 큐 적재 전용)
    pub fn add_message_with<F>(&self, msg: ChatMessage, deliver: F)
    where
        F: FnOnce(&ChatMessage),
    {
        let size = msg.estimated_size();
        {
            let mut state = self.messages.write();
            let evicted = state.buffer.append(msg.clone());
            state.lifetime_count += 1;
            state.bytes_used += size;
            if evicted {
                state.bytes_used = state.bytes_used.saturating_sub(AVG_MESSAGE_SIZE_BYTES);
            }
            deliver(&msg);
        }
        self.touch();
    }

    /// recent_n > 0이면 최근 n건, 아니면 전체를 오래된 순으로 반환
    pub fn get_messages(&self, recent_n: usize) -> Vec<ChatMessage> {
        let state = self.messages.read();
        if recent_n > 0 {
            state.buffer.recent(recent_n)
        } else {
            state.buffer.snapshot()
        }
    }

    /// 사용자 추가 또는 갱신 (같은 user_id는 덮어쓴다)
    pub fn add_user(&self, user: ChatUser) {
        self.users.write().insert(user.user_id.clone(), user);
        self.touch();
    }

    pub fn remove_user(&self, user_id: &str) {
        self.users.write().remove(user_id);
        self.touch();
    }

    pub fn get_user(&self, user_id: &str) -> Option<ChatUser> {
        self.users.read().get(user_id).cloned()
    }

    pub fn users(&self) -> Vec<ChatUser> {
        self.users.read().values().cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// 허용된 메시지 전송 후 발신자 명부 통계 갱신
    pub fn record_user_message(&self, user_id: &str, chars: usize) {
        let mut users = self.users.write();
        if let Some(user) = users.get_mut(user_id) {
            user.last_message = Some(Utc::now());
            user.message_count += 1;
            user.char_count += chars as u64;
        }
    }

    /// 제한기 판정 상태를 명부 레코드에 반영한다 (users 프레임에 실린다)
    pub fn set_user_rate_state(
        &self,
        user_id: &str,
        timeout_until: Option<DateTime<Utc>>,
        violations: u32,
    ) {
        let mut users = self.users.write();
        if let Some(user) = users.get_mut(user_id) {
            user.timeout_until = timeout_until;
            user.violations = violations;
        }
    }

    /// retention보다 오래된 메시지를 제거하고 제거 건수를 반환
    pub fn evict_old(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let mut state = self.messages.write();
        let removed = state.buffer.evict_older_than(cutoff);
        if removed > 0 {
            state.bytes_used = state
                .bytes_used
                .saturating_sub(removed as u64 * AVG_MESSAGE_SIZE_BYTES);
        }
        removed
    }

    /// 명부가 비었고 timeout 이상 활동이 없으면 true
    pub fn is_inactive(&self, timeout: Duration) -> bool {
        self.user_count() == 0 && self.last_activity.read().elapsed() > timeout
    }

    pub fn bytes_used(&self) -> u64 {
        self.messages.read().bytes_used
    }

    /// 방 생성 이후 누적 메시지 수
    pub fn lifetime_message_count(&self) -> u64 {
        self.messages.read().lifetime_count
    }

    /// 현재 버퍼에 남아 있는 메시지 수
    pub fn buffered_message_count(&self) -> usize {
        self.messages.read().buffer.len()
    }

    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn message(room: &ChatRoom, text: &str, age_secs: i64) -> ChatMessage {
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            stream_key: room.stream_key.clone(),
            user_id: "u1".to_string(),
            username: "Ann".to_string(),
            message: text.to_string(),
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    #[test]
    fn add_message_tracks_bytes_and_counts() {
        let room = ChatRoom::new("s1", 10);
        let msg = message(&room, "hello", 0);
        let size = msg.estimated_size();
        room.add_message(msg);

        assert_eq!(room.bytes_used(), size);
        assert_eq!(room.lifetime_message_count(), 1);
        assert_eq!(room.buffered_message_count(), 1);
    }

    #[test]
    fn eviction_on_full_buffer_decrements_estimate() {
        let room = ChatRoom::new("s1", 2);
        for text in ["a", "b", "c"] {
            room.add_message(message(&room, text, 0));
        }

        assert_eq!(room.buffered_message_count(), 2);
        assert_eq!(room.lifetime_message_count(), 3);
        let texts: Vec<_> = room
            .get_messages(0)
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn bytes_used_never_underflows() {
        let room = ChatRoom::new("s1", 10);
        room.add_message(message(&room, "x", 3600));

        // 평균 추정치(500B)가 실제 기여분보다 커도 0 아래로 내려가지 않는다
        let removed = room.evict_old(Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert_eq!(room.bytes_used(), 0);
    }

    #[test]
    fn add_user_is_idempotent_on_user_id() {
        let room = ChatRoom::new("s1", 10);
        room.add_user(ChatUser::new("u1", "Ann"));
        room.add_user(ChatUser::new("u1", "Anne"));

        assert_eq!(room.user_count(), 1);
        assert_eq!(room.get_user("u1").unwrap().username, "Anne");
    }

    #[test]
    fn remove_user_is_best_effort() {
        let room = ChatRoom::new("s1", 10);
        room.remove_user("missing");
        assert_eq!(room.user_count(), 0);
    }

    #[test]
    fn record_user_message_updates_roster_stats() {
        let room = ChatRoom::new("s1", 10);
        room.add_user(ChatUser::new("u1", "Ann"));
        room.record_user_message("u1", 5);
        room.record_user_message("u1", 3);

        let user = room.get_user("u1").unwrap();
        assert_eq!(user.message_count, 2);
        assert_eq!(user.char_count, 8);
        assert!(user.last_message.is_some());
    }

    #[test]
    fn set_user_rate_state_updates_roster_record() {
        let room = ChatRoom::new("s1", 10);
        room.add_user(ChatUser::new("u1", "Ann"));

        let until = Utc::now() + ChronoDuration::seconds(30);
        room.set_user_rate_state("u1", Some(until), 2);

        let user = room.get_user("u1").unwrap();
        assert_eq!(user.timeout_until, Some(until));
        assert_eq!(user.violations, 2);

        // 명부에 없는 사용자는 무시된다
        room.set_user_rate_state("missing", None, 1);
        assert_eq!(room.user_count(), 1);
    }

    #[test]
    fn is_inactive_requires_empty_roster() {
        let room = ChatRoom::new("s1", 10);
        room.add_user(ChatUser::new("u1", "Ann"));
        assert!(!room.is_inactive(Duration::ZERO));

        room.remove_user("u1");
        assert!(room.is_inactive(Duration::ZERO));
    }

    #[test]
    fn add_message_with_runs_deliver_with_message() {
        let room = ChatRoom::new("s1", 10);
        let mut delivered = None;
        room.add_message_with(message(&room, "hi", 0), |msg| {
            delivered = Some(msg.message.clone());
        });
        assert_eq!(delivered.as_deref(), Some("hi"));
    }
}
