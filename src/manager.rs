//! 방 디렉터리 및 백그라운드 유지보수 워커
//!
//! 방 생성/사용자 입장 정책과 정리(cleanup)·메모리 감시(monitor) 워커의
//! 수명을 관리한다. 두 워커는 타이머와 정지 신호를 select로 기다린다.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::memory::MemoryTracker;
use crate::room::{ChatMessage, ChatRoom, ChatUser};

/// 메모리 감시 주기
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
/// 비상 정리 시 적용하는 단축 보존 기간
const EMERGENCY_RETENTION: Duration = Duration::from_secs(10 * 60);

/// 스트림 키 → 방 디렉터리와 전역 정책
pub struct ChatManager {
    config: Arc<ChatConfig>,
    rooms: DashMap<String, Arc<ChatRoom>>,
    tracker: MemoryTracker,
    stop_tx: watch::Sender<bool>,
}

impl ChatManager {
    pub fn new(config: Arc<ChatConfig>) -> Self {
        let tracker = MemoryTracker::new(config.max_memory_mb);
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            rooms: DashMap::new(),
            tracker,
            stop_tx,
        }
    }

    /// 기존 방을 반환하거나 설정된 버퍼 용량으로 새로 만든다
    pub fn get_or_create_room(&self, stream_key: &str) -> Arc<ChatRoom> {
        self.rooms
            .entry(stream_key.to_string())
            .or_insert_with(|| {
                tracing::info!(stream_key = %stream_key, "Created chat room");
                Arc::new(ChatRoom::new(
                    stream_key,
                    self.config.max_messages_per_stream,
                ))
            })
            .value()
            .clone()
    }

    pub fn get_room(&self, stream_key: &str) -> Option<Arc<ChatRoom>> {
        self.rooms.get(stream_key).map(|entry| entry.value().clone())
    }

    /// 새 ID와 서버 수신 시각으로 메시지를 만들어 방에 추가한다
    pub fn add_message(
        &self,
        stream_key: &str,
        user_id: &str,
        username: &str,
        message: &str,
    ) -> ChatMessage {
        self.add_message_with(stream_key, user_id, username, message, |_| {})
    }

    /// add_message와 같지만, 버퍼 추가를 끝낸 임계 구역 안에서 `deliver`를
    /// 호출한다. 팬아웃 적재가 추가 순서를 따르게 하는 용도
    pub fn add_message_with<F>(
        &self,
        stream_key: &str,
        user_id: &str,
        username: &str,
        message: &str,
        deliver: F,
    ) -> ChatMessage
    where
        F: FnOnce(&ChatMessage),
    {
        let room = self.get_or_create_room(stream_key);

        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            stream_key: stream_key.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };

        room.add_message_with(msg.clone(), deliver);
        room.record_user_message(user_id, message.chars().count());
        msg
    }

    /// 사용자 입장. 정원이 차 있으면 ROOM_FULL로 거절한다
    pub fn add_user(&self, stream_key: &str, user_id: &str, username: &str) -> Result<(), ChatError> {
        let room = self.get_or_create_room(stream_key);

        if room.user_count() >= self.config.max_users_per_stream {
            return Err(ChatError::room_full());
        }

        room.add_user(ChatUser::new(user_id, username));
        tracing::info!(
            user_id = %user_id,
            username = %username,
            stream_key = %stream_key,
            "User joined room"
        );
        Ok(())
    }

    /// 최선 노력 제거: 방이나 사용자가 없어도 조용히 넘어간다
    pub fn remove_user(&self, stream_key: &str, user_id: &str) {
        let Some(room) = self.get_room(stream_key) else {
            return;
        };

        room.remove_user(user_id);
        tracing::info!(user_id = %user_id, stream_key = %stream_key, "User left room");
    }

    /// 제한기 상태를 방 명부 레코드에 반영한다. 방이나 사용자가 없으면
    /// 조용히 넘어간다
    pub fn set_user_rate_state(
        &self,
        stream_key: &str,
        user_id: &str,
        timeout_until: Option<DateTime<Utc>>,
        violations: u32,
    ) {
        if let Some(room) = self.get_room(stream_key) {
            room.set_user_rate_state(user_id, timeout_until, violations);
        }
    }

    pub fn get_messages(&self, stream_key: &str, recent_n: usize) -> Vec<ChatMessage> {
        self.get_room(stream_key)
            .map(|room| room.get_messages(recent_n))
            .unwrap_or_default()
    }

    pub fn get_users(&self, stream_key: &str) -> Vec<ChatUser> {
        self.get_room(stream_key)
            .map(|room| room.users())
            .unwrap_or_default()
    }

    pub fn get_user_count(&self, stream_key: &str) -> usize {
        self.get_room(stream_key)
            .map(|room| room.user_count())
            .unwrap_or(0)
    }

    pub fn tracker(&self) -> &MemoryTracker {
        &self.tracker
    }

    /// 현재 통계 스냅샷 (stats 엔드포인트 본문)
    pub fn stats(&self) -> serde_json::Value {
        let mut total_users = 0;
        let mut total_buffered = 0;

        for entry in self.rooms.iter() {
            total_users += entry.user_count();
            total_buffered += entry.buffered_message_count();
        }

        serde_json::json!({
            "total_rooms": self.rooms.len(),
            "total_users": total_users,
            "total_messages": total_buffered,
            "memory": self.tracker.stats(),
            "config": self.config.capacity(),
        })
    }

    /// 정리·감시 워커 기동
    pub fn spawn_workers(self: &Arc<Self>) {
        let cleanup_interval =
            Duration::from_secs(self.config.cleanup_interval_minutes.max(1) * 60);

        let manager = self.clone();
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.perform_cleanup(),
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!("Cleanup worker stopped");
        });

        let manager = self.clone();
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MONITOR_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.update_memory_stats(),
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!("Monitor worker stopped");
        });
    }

    /// 두 워커에 정지 신호를 보낸다. 이후에도 API 호출은 기존 상태에 대해
    /// 동작하지만 백그라운드 유지보수는 멈춘다
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        tracing::info!("Chat manager stopped");
    }

    /// 오래된 메시지를 걷어내고 비활성 빈 방을 디렉터리에서 제거한다
    pub fn perform_cleanup(&self) {
        let retention = Duration::from_secs(self.config.message_retention_minutes * 60);
        let inactive_timeout = self.config.inactive_stream_timeout;

        let mut total_removed = 0;
        let mut to_delete = Vec::new();

        for entry in self.rooms.iter() {
            total_removed += entry.evict_old(retention);
            if entry.is_inactive(inactive_timeout) {
                to_delete.push(entry.key().clone());
            }
        }

        let mut deleted = 0;
        for stream_key in to_delete {
            // 표시 이후 사용자가 다시 들어온 방은 제거하지 않는다
            let removed = self
                .rooms
                .remove_if(&stream_key, |_, room| room.is_inactive(inactive_timeout));
            if removed.is_some() {
                tracing::info!(stream_key = %stream_key, "Deleted inactive room");
                deleted += 1;
            }
        }

        if total_removed > 0 || deleted > 0 {
            tracing::info!(
                removed_messages = total_removed,
                deleted_rooms = deleted,
                "Cleanup completed"
            );
        }
    }

    /// 방 전체의 바이트·메시지 집계를 트래커에 반영하고, 임계 상태면
    /// 비상 정리를 수행한다. 합산은 공유 순회로 하고 정리는 그 밖에서 한다
    pub fn update_memory_stats(&self) {
        let mut total_bytes = 0;
        let mut total_messages = 0;
        let mut streams = 0;

        for entry in self.rooms.iter() {
            total_bytes += entry.bytes_used();
            total_messages += entry.lifetime_message_count();
            streams += 1;
        }

        self.tracker.update(total_bytes, total_messages, streams);

        if self.tracker.is_critical() {
            tracing::warn!(
                usage_percent = format!("{:.1}", self.tracker.usage_percent()),
                "⚠️ CRITICAL: Chat memory usage"
            );
            self.perform_emergency_cleanup();
        } else if self.tracker.is_near_limit() {
            tracing::warn!(
                usage_percent = format!("{:.1}", self.tracker.usage_percent()),
                "⚠️ WARNING: Chat memory usage"
            );
        }
    }

    /// 모든 방의 보존 기간을 한 차례 10분으로 줄여 적용한다
    fn perform_emergency_cleanup(&self) {
        tracing::warn!("Performing emergency cleanup");

        let mut total_removed = 0;
        for entry in self.rooms.iter() {
            total_removed += entry.evict_old(EMERGENCY_RETENTION);
        }

        tracing::warn!(removed_messages = total_removed, "Emergency cleanup completed");
    }
}
