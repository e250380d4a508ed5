//! 고정 용량 메시지 링 버퍼
//!
//! 가득 찬 상태에서 추가하면 가장 오래된 메시지가 밀려난다. 버퍼가 쥐는
//! 메모리는 방 하나당 `capacity` 건으로 고정된다.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::room::ChatMessage;

/// 고정 용량 FIFO 메시지 버퍼
pub struct RingBuffer {
    buf: VecDeque<ChatMessage>,
    capacity: usize,
}

impl RingBuffer {
    /// # Panics
    ///
    /// `capacity == 0`이면 패닉
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// 메시지 추가. 가장 오래된 메시지가 밀려났으면 true를 반환한다
    pub fn append(&mut self, msg: ChatMessage) -> bool {
        let evicted = self.buf.len() == self.capacity;
        if evicted {
            self.buf.pop_front();
        }
        self.buf.push_back(msg);
        evicted
    }

    /// 전체 메시지를 오래된 순으로 복사해 반환
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.buf.iter().cloned().collect()
    }

    /// 최근 n건을 오래된 순으로 반환. n ≥ size면 snapshot과 동일
    pub fn recent(&self, n: usize) -> Vec<ChatMessage> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).cloned().collect()
    }

    /// head부터 timestamp ≤ cutoff인 연속 구간을 제거하고 제거 건수를 반환.
    /// 첫 번째 미만료 메시지에서 멈춘다 (방 내 타임스탬프 단조 증가 가정)
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(front) = self.buf.front() {
            if front.timestamp > cutoff {
                break;
            }
            self.buf.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(text: &str, age_secs: i64) -> ChatMessage {
        ChatMessage {
            id: format!("id-{text}"),
            stream_key: "stream".to_string(),
            user_id: "user".to_string(),
            username: "User".to_string(),
            message: text.to_string(),
            timestamp: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn append_within_capacity_keeps_order() {
        let mut ring = RingBuffer::new(3);
        assert!(!ring.append(message("a", 0)));
        assert!(!ring.append(message("b", 0)));

        let texts: Vec<_> = ring.snapshot().into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn append_past_capacity_drops_oldest() {
        let mut ring = RingBuffer::new(3);
        for text in ["m1", "m2", "m3"] {
            assert!(!ring.append(message(text, 0)));
        }
        assert!(ring.append(message("m4", 0)));
        assert!(ring.append(message("m5", 0)));

        assert_eq!(ring.len(), 3);
        let texts: Vec<_> = ring.snapshot().into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let mut ring = RingBuffer::new(5);
        for text in ["a", "b", "c", "d"] {
            ring.append(message(text, 0));
        }

        let texts: Vec<_> = ring.recent(2).into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["c", "d"]);

        // n ≥ size면 전체 반환
        assert_eq!(ring.recent(10).len(), 4);
        assert!(ring.recent(0).is_empty());
    }

    #[test]
    fn evict_older_than_removes_expired_head() {
        let mut ring = RingBuffer::new(10);
        ring.append(message("old1", 3600));
        ring.append(message("old2", 1800));
        ring.append(message("fresh", 1));

        let cutoff = Utc::now() - Duration::seconds(600);
        assert_eq!(ring.evict_older_than(cutoff), 2);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot()[0].message, "fresh");
    }

    #[test]
    fn evict_older_than_is_idempotent() {
        let mut ring = RingBuffer::new(10);
        ring.append(message("old", 3600));
        ring.append(message("fresh", 1));

        let cutoff = Utc::now() - Duration::seconds(600);
        assert_eq!(ring.evict_older_than(cutoff), 1);
        assert_eq!(ring.evict_older_than(cutoff), 0);
    }

    #[test]
    fn evict_stops_at_first_unexpired_message() {
        let mut ring = RingBuffer::new(10);
        ring.append(message("fresh", 1));
        ring.append(message("old", 3600)); // 단조 가정 위반 (비정상 입력)

        let cutoff = Utc::now() - Duration::seconds(600);
        assert_eq!(ring.evict_older_than(cutoff), 0);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut ring = RingBuffer::new(3);
        ring.append(message("a", 0));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 3);
    }
}
