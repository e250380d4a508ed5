//! 전역 메모리 사용량 추적
//!
//! 트래커는 보고만 한다. 임계치 초과 시의 정책(비상 정리)은 매니저가 쥔다.

use parking_lot::RwLock;
use serde::Serialize;

struct TrackerState {
    total_bytes: u64,
    total_messages: u64,
    active_streams: usize,
}

/// 방 전체의 바이트 집계와 한도 대비 사용률
pub struct MemoryTracker {
    max_bytes: u64,
    state: RwLock<TrackerState>,
}

/// stats 응답의 memory 블록
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub total_mb: f64,
    pub max_bytes: u64,
    pub max_mb: f64,
    pub usage_percent: f64,
    pub total_messages: u64,
    pub active_streams: usize,
    pub is_near_limit: bool,
    pub is_critical: bool,
}

impl MemoryTracker {
    pub fn new(max_memory_mb: u64) -> Self {
        Self {
            max_bytes: max_memory_mb * 1024 * 1024,
            state: RwLock::new(TrackerState {
                total_bytes: 0,
                total_messages: 0,
                active_streams: 0,
            }),
        }
    }

    pub fn update(&self, total_bytes: u64, total_messages: u64, active_streams: usize) {
        let mut state = self.state.write();
        state.total_bytes = total_bytes;
        state.total_messages = total_messages;
        state.active_streams = active_streams;
    }

    pub fn usage_percent(&self) -> f64 {
        self.state.read().total_bytes as f64 / self.max_bytes as f64 * 100.0
    }

    /// 사용률 80% 초과
    pub fn is_near_limit(&self) -> bool {
        self.state.read().total_bytes as f64 / self.max_bytes as f64 > 0.8
    }

    /// 사용률 90% 초과
    pub fn is_critical(&self) -> bool {
        self.state.read().total_bytes as f64 / self.max_bytes as f64 > 0.9
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.read();
        let usage_percent = state.total_bytes as f64 / self.max_bytes as f64 * 100.0;

        MemoryStats {
            total_bytes: state.total_bytes,
            total_mb: state.total_bytes as f64 / 1024.0 / 1024.0,
            max_bytes: self.max_bytes,
            max_mb: self.max_bytes as f64 / 1024.0 / 1024.0,
            usage_percent,
            total_messages: state.total_messages,
            active_streams: state.active_streams,
            is_near_limit: usage_percent > 80.0,
            is_critical: usage_percent > 90.0,
        }
    }
}
