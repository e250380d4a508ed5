//! PulseCast 채팅 서버 엔트리포인트

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsecast_chat::config::ChatConfig;
use pulsecast_chat::handlers;
use pulsecast_chat::state::AppState;

#[tokio::main]
async fn main() {
    let config = ChatConfig::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AppState::new(config.clone()));

    // 백그라운드 워커 (정리, 메모리 감시, 제한기 레코드 수거)
    state.manager.spawn_workers();
    state.limiter.spawn_reaper();

    // CORS 설정
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 라우터 설정
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/chat", get(chat_ws_handler))
        .route("/api/chat/stats", get(stats_handler))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    tracing::info!("🚀 PulseCast chat server started");
    tracing::info!("Address: {}", addr);
    tracing::info!("WebSocket: ws://{}/api/chat?streamKey=<STREAM_KEY>", addr);

    axum::serve(listener, app).await.unwrap();
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>PulseCast Chat Server</h1><p>WebSocket endpoint: /api/chat?streamKey=&lt;STREAM_KEY&gt;</p>")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "pulsecast-chat",
        "timestamp": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }))
}

#[derive(Debug, Deserialize)]
struct ChatQuery {
    #[serde(rename = "streamKey")]
    stream_key: Option<String>,
}

/// 채팅 WebSocket 업그레이드. streamKey 쿼리 파라미터가 없으면 400
async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChatQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(stream_key) = query.stream_key.filter(|key| !key.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing streamKey parameter").into_response();
    };

    ws.on_upgrade(move |socket| handlers::handle_socket(socket, state, stream_key))
        .into_response()
}

/// 매니저와 메모리 트래커 상태의 JSON 스냅샷
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.manager.stats())
}
