//! WebSocket 세션 수명주기
//!
//! 수락된 소켓마다 두 태스크가 협력한다. 읽기 루프는 프레임을 해석해
//! type별로 분배하고, 쓰기 태스크는 유한 송신 큐를 비우면서 주기적으로
//! keep-alive ping을 보낸다.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::handlers::chat;
use crate::protocol::{InboundFrame, ServerEvent, ServerFrame};
use crate::state::AppState;

/// 세션별 송신 큐 용량. 가득 찬 수신자에게는 프레임이 버려진다
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// 프레임이 이 시간 동안 없으면 읽기 루프를 끝낸다
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(54);

/// 열린 클라이언트 소켓 하나의 서버 측 대응물
pub struct Session {
    pub(crate) state: Arc<AppState>,
    pub(crate) stream_key: String,
    /// join이 처리되기 전까지 비어 있다
    pub(crate) user_id: Option<String>,
    pub(crate) username: String,
    pub(crate) tx: mpsc::Sender<ServerFrame>,
}

impl Session {
    pub(crate) async fn send_frame(&self, frame: ServerFrame) {
        let _ = self.tx.send(frame).await;
    }

    pub(crate) async fn send_error(&self, message: &str) {
        self.send_frame(ServerFrame::error(message)).await;
    }
}

/// 업그레이드된 소켓 처리: 쓰기 태스크를 띄우고 읽기 루프를 돌린 뒤
/// 정리 경로를 탄다
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, stream_key: String) {
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let write_task = tokio::spawn(write_pump(ws_sender, rx));

    let mut session = Session {
        state,
        stream_key,
        user_id: None,
        username: String::new(),
        tx,
    };

    read_pump(&mut session, ws_receiver).await;
    cleanup(&session);

    // 마지막 송신자가 사라지면 쓰기 태스크가 종료 프레임을 보내고 끝난다
    drop(session);
    let _ = write_task.await;
}

/// 송신 큐를 비우고 54초마다 ping을 보낸다
async fn write_pump(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // 첫 tick은 즉시 발화한다

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let Ok(json) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// 읽기 루프. 모든 수신 프레임(pong 포함)이 60초 데드라인을 갱신한다
async fn read_pump(session: &mut Session, mut ws_receiver: SplitStream<WebSocket>) {
    loop {
        let msg = match tokio::time::timeout(READ_DEADLINE, ws_receiver.next()).await {
            Err(_) => break, // 데드라인 만료
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => dispatch(session, frame).await,
                // JSON 자체가 깨진 프레임은 세션을 끝낸다
                Err(_) => break,
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// type 판별자 기준 분배
async fn dispatch(session: &mut Session, frame: InboundFrame) {
    let kind = match frame.kind.as_ref().and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            session.send_error("Invalid message type").await;
            return;
        }
    };

    match kind.as_str() {
        "join" => chat::handle_join(session, frame.data).await,
        "message" => chat::handle_message(session, frame.data).await,
        "typing" => chat::handle_typing(session, frame.data),
        _ => session.send_error("Unknown message type").await,
    }
}

/// 세션이 쥔 신원을 해제한다. user_id가 묶여 있었다면 명부와
/// 레지스트리에서 빠지고 user_left를 알린다. 읽기 루프 종료와
/// 신원을 바꾸는 재-join 경로에서 쓰이며, 멱등하다
pub(crate) fn cleanup(session: &Session) {
    let Some(user_id) = &session.user_id else {
        return;
    };

    // 같은 user_id의 새 세션이 항목을 교체했다면 건드리지 않는다
    let was_registered = session
        .state
        .sessions
        .remove_if(user_id, |_, handle| handle.sender.same_channel(&session.tx))
        .is_some();
    if !was_registered {
        return;
    }

    session
        .state
        .manager
        .remove_user(&session.stream_key, user_id);

    chat::broadcast_to_room(
        &session.state,
        &session.stream_key,
        &ServerFrame::event(ServerEvent::UserLeft {
            user_id: user_id.clone(),
            username: session.username.clone(),
        }),
    );

    tracing::info!(
        user_id = %user_id,
        username = %session.username,
        stream_key = %session.stream_key,
        "User left chat"
    );
}
