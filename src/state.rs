//! 애플리케이션 상태 관리

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::limiter::RateLimiter;
use crate::manager::ChatManager;
use crate::protocol::ServerFrame;

/// 전역 애플리케이션 상태
pub struct AppState {
    pub config: Arc<ChatConfig>,
    /// 방 디렉터리와 유지보수 정책
    pub manager: Arc<ChatManager>,
    /// 메시지 속도 제한기
    pub limiter: Arc<RateLimiter>,
    /// 접속 레지스트리 (user_id → 세션 핸들). 같은 user_id의 두 번째
    /// join은 항목을 교체한다
    pub sessions: DashMap<String, SessionHandle>,
}

impl AppState {
    pub fn new(config: ChatConfig) -> Self {
        let config = Arc::new(config);
        Self {
            manager: Arc::new(ChatManager::new(config.clone())),
            limiter: Arc::new(RateLimiter::new(config.clone())),
            sessions: DashMap::new(),
            config,
        }
    }
}

/// 팬아웃 대상이 되는 세션의 송신 핸들
pub struct SessionHandle {
    pub username: String,
    pub stream_key: String,
    /// 유한 송신 큐. 가득 차면 해당 수신자에 한해 프레임이 버려진다
    pub sender: mpsc::Sender<ServerFrame>,
}
