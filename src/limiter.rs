//! 다단계 메시지 속도 제한 및 스팸 탐지
//!
//! 판정은 (사용자별 이력, 현재 시각, 본문, 길이)만의 함수다. 티어는
//! 문서화된 순서로 평가되며 첫 매치가 결과가 된다. 사용자별 레코드가
//! 유일한 가변 상태이고 레코드 단위 락(dashmap 샤드)으로 보호된다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::config::ChatConfig;
use crate::error::ChatError;

/// 이력 자체 정리 주기 (사용자별)
const SELF_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// 자체 정리 시 보존하는 이력 길이
const HISTORY_WINDOW: Duration = Duration::from_secs(5 * 60);
/// 레코드 수거 워커 주기
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// 이 시간 이상 메시지가 없는 레코드는 수거된다
const RECORD_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// 중복 판정에 사용하는 최근 메시지 수
const DUPLICATE_WINDOW: usize = 5;
/// 두 문자열이 "유사"한 것으로 치는 경계
const SIMILARITY_THRESHOLD: f64 = 0.8;

/// 사용자별 속도 제한 이력
struct UserRateRecord {
    /// 최근 메시지 시각 (contents, char_counts와 병렬)
    messages: Vec<Instant>,
    contents: Vec<String>,
    char_counts: Vec<usize>,
    timeout_until: Option<Instant>,
    violations: u32,
    last_cleanup: Instant,
}

impl UserRateRecord {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            contents: Vec::new(),
            char_counts: Vec::new(),
            timeout_until: None,
            violations: 0,
            last_cleanup: Instant::now(),
        }
    }

    fn record(&mut self, now: Instant, content: &str, chars: usize) {
        self.messages.push(now);
        self.contents.push(content.to_string());
        self.char_counts.push(chars);
    }

    fn count_in_window(&self, now: Instant, window: Duration) -> usize {
        self.messages
            .iter()
            .filter(|t| now.duration_since(**t) < window)
            .count()
    }

    fn chars_in_window(&self, now: Instant, window: Duration) -> usize {
        self.messages
            .iter()
            .zip(&self.char_counts)
            .filter(|(t, _)| now.duration_since(**t) < window)
            .map(|(_, chars)| *chars)
            .sum()
    }

    /// 최근 ≤5건 중 2건 이상이 수신 본문과 유사하면 중복 스팸.
    /// 수신 메시지 자신까지 합쳐 "최근 5건 중 3건 유사" 기준이 된다
    fn is_duplicate_spam(&self, message: &str) -> bool {
        if self.contents.len() < 2 {
            return false;
        }

        let incoming = normalize(message);
        let start = self.contents.len().saturating_sub(DUPLICATE_WINDOW);
        let duplicates = self.contents[start..]
            .iter()
            .filter(|recent| similarity(&normalize(recent), &incoming) > SIMILARITY_THRESHOLD)
            .count();

        duplicates >= 2
    }

    fn apply_timeout(&mut self, now: Instant, duration: Duration) {
        self.timeout_until = Some(now + duration);
    }

    /// 지연 자체 정리: 마지막 정리 후 60초가 지났으면 5분보다 오래된
    /// 이력을 버린다
    fn cleanup(&mut self, now: Instant) {
        if now.duration_since(self.last_cleanup) < SELF_CLEANUP_INTERVAL {
            return;
        }

        let mut messages = Vec::with_capacity(self.messages.len());
        let mut contents = Vec::with_capacity(self.contents.len());
        let mut char_counts = Vec::with_capacity(self.char_counts.len());

        for ((timestamp, content), chars) in self
            .messages
            .iter()
            .zip(&self.contents)
            .zip(&self.char_counts)
        {
            if now.duration_since(*timestamp) < HISTORY_WINDOW {
                messages.push(*timestamp);
                contents.push(content.clone());
                char_counts.push(*chars);
            }
        }

        self.messages = messages;
        self.contents = contents;
        self.char_counts = char_counts;
        self.last_cleanup = now;
    }
}

/// 사용자 제한 상태 스냅샷 (명부 동기화용, 벽시계 기준)
#[derive(Debug, Clone, Copy, Default)]
pub struct RateState {
    pub timeout_until: Option<DateTime<Utc>>,
    pub violations: u32,
}

/// 다단계 속도 제한기
pub struct RateLimiter {
    config: Arc<ChatConfig>,
    records: DashMap<String, UserRateRecord>,
    stop_tx: watch::Sender<bool>,
}

impl RateLimiter {
    pub fn new(config: Arc<ChatConfig>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            records: DashMap::new(),
            stop_tx,
        }
    }

    /// 메시지 허용 여부 판정. 허용 시 이력에 기록한다
    pub fn check(&self, user_id: &str, message: &str) -> Result<(), ChatError> {
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(UserRateRecord::new);
        let now = Instant::now();

        // T0: 활성 타임아웃
        if let Some(until) = record.timeout_until {
            if now < until {
                return Err(ChatError::new(
                    "TIMEOUT",
                    "You are timed out. Please wait before sending messages.",
                ));
            }
        }

        record.cleanup(now);

        // T1: 본문 길이 (유니코드 스칼라 기준)
        let length = message.chars().count();
        if length > self.config.max_characters_per_message {
            return Err(ChatError::new(
                "MESSAGE_TOO_LONG",
                format!(
                    "Message is too long. Maximum {} characters.",
                    self.config.max_characters_per_message
                ),
            ));
        }

        // T2a: 버스트 (10초에 5건)
        let in_10s = record.count_in_window(now, Duration::from_secs(10));
        if in_10s >= 5 {
            record.apply_timeout(now, Duration::from_secs(30));
            record.violations += 1;
            return Err(ChatError::new("RATE_LIMIT", "Slow down! (30 second cooldown)"));
        }

        // T2b: 스팸 (30초에 10건)
        if record.count_in_window(now, Duration::from_secs(30)) >= 10 {
            record.apply_timeout(now, Duration::from_secs(2 * 60));
            record.violations += 1;
            return Err(ChatError::new(
                "SPAM_DETECTED",
                "Spam detected. (2 minute timeout)",
            ));
        }

        // T2c: 고강도 스팸 (60초에 20건)
        if record.count_in_window(now, Duration::from_secs(60)) >= 20 {
            record.apply_timeout(now, Duration::from_secs(5 * 60));
            record.violations += 2;
            return Err(ChatError::new(
                "HEAVY_SPAM",
                "Heavy spam detected. (5 minute timeout)",
            ));
        }

        // T3: 길이 가중 빈도 제한
        if length > 300 {
            if in_10s >= 1 {
                return Err(ChatError::new(
                    "RATE_LIMIT_LONG_MESSAGE",
                    "Large messages limited to 1 per 10 seconds.",
                ));
            }
        } else if length > 100 && in_10s >= 3 {
            return Err(ChatError::new(
                "RATE_LIMIT_MEDIUM_MESSAGE",
                "Medium messages limited to 3 per 10 seconds.",
            ));
        }

        // T4: 중복/유사 메시지
        if record.is_duplicate_spam(message) {
            record.apply_timeout(now, Duration::from_secs(5 * 60));
            record.violations += 1;
            return Err(ChatError::new(
                "DUPLICATE_SPAM",
                "Stop sending the same message repeatedly. (5 minute timeout)",
            ));
        }

        // T5: 장문 대량 전송 (5분에 2000자 초과)
        if length >= 400 && record.chars_in_window(now, Duration::from_secs(5 * 60)) > 2000 {
            record.apply_timeout(now, Duration::from_secs(10 * 60));
            record.violations += 2;
            return Err(ChatError::new(
                "HEAVY_TEXT_SPAM",
                "Too much text too quickly. (10 minute timeout)",
            ));
        }

        // 누적 위반 가중 처벌
        if record.violations >= 5 {
            record.apply_timeout(now, Duration::from_secs(30 * 60));
            return Err(ChatError::new(
                "REPEAT_OFFENDER",
                "Multiple violations. (30 minute timeout)",
            ));
        } else if record.violations >= 4 {
            record.apply_timeout(now, Duration::from_secs(10 * 60));
            return Err(ChatError::new(
                "REPEAT_OFFENDER",
                "Multiple violations. (10 minute timeout)",
            ));
        } else if record.violations >= 3 {
            record.apply_timeout(now, Duration::from_secs(5 * 60));
            return Err(ChatError::new(
                "REPEAT_OFFENDER",
                "Multiple violations. (5 minute timeout)",
            ));
        }

        record.record(now, message, length);
        Ok(())
    }

    /// 활성 타임아웃의 남은 시간
    pub fn timeout_status(&self, user_id: &str) -> Option<Duration> {
        let record = self.records.get(user_id)?;
        let until = record.timeout_until?;
        until.checked_duration_since(Instant::now())
    }

    /// 명부 레코드에 비추기 위한 현재 제한 상태. 레코드가 없으면 기본값
    pub fn rate_state(&self, user_id: &str) -> RateState {
        let Some(record) = self.records.get(user_id) else {
            return RateState::default();
        };

        let timeout_until = record
            .timeout_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .and_then(|remaining| chrono::Duration::from_std(remaining).ok())
            .map(|remaining| Utc::now() + remaining);

        RateState {
            timeout_until,
            violations: record.violations,
        }
    }

    /// 수거 워커 기동: 5분마다 30분 이상 조용한 레코드를 제거한다
    pub fn spawn_reaper(self: &Arc<Self>) {
        let limiter = self.clone();
        let mut stop = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.reap_idle_records(),
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!("Rate limiter reaper stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn reap_idle_records(&self) {
        let now = Instant::now();
        let before = self.records.len();

        self.records.retain(|_, record| {
            record
                .messages
                .last()
                .is_some_and(|last| now.duration_since(*last) <= RECORD_IDLE_TIMEOUT)
        });

        let removed = before - self.records.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Reaped idle rate limit records");
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// 위치별 문자 일치 수를 긴 쪽 길이로 나눈 단순 유사도 (0.0 ~ 1.0)
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longer = a_chars.len().max(b_chars.len());

    let matches = a_chars
        .iter()
        .zip(&b_chars)
        .filter(|(x, y)| x == y)
        .count();

    matches as f64 / longer as f64
}
