//! 채팅 핸들러 (join/message/typing 분배와 방 팬아웃)
//!
//! 팬아웃은 레지스트리를 공유 순회해 수신자를 고른 뒤 각 세션의 유한
//! 큐에 비블로킹으로 적재한다. 큐가 가득 찬 수신자는 해당 프레임을
//! 건너뛴다. 전달 보장은 최선 노력까지다.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::handlers::session::{cleanup, Session};
use crate::protocol::{JoinData, MessageData, ServerEvent, ServerFrame, TypingData};
use crate::state::{AppState, SessionHandle};

/// join 시 보내는 최근 메시지 수
pub const HISTORY_LIMIT: usize = 100;

/// `join` 처리: 입장 정책 검사 후 레지스트리 등록, 히스토리·명부 전송,
/// 방에 user_joined 알림 (본인 제외)
pub async fn handle_join(session: &mut Session, data: Option<Value>) {
    let state = session.state.clone();

    let Some(join) = data.and_then(|d| serde_json::from_value::<JoinData>(d).ok()) else {
        session.send_error("Invalid join data").await;
        return;
    };
    if join.user_id.is_empty() || join.username.is_empty() {
        session.send_error("Missing userId or username").await;
        return;
    }

    // 이미 다른 신원으로 join한 세션은 이전 신원부터 내려놓는다.
    // 그대로 두면 명부와 레지스트리에 이전 신원이 영영 남는다
    if session
        .user_id
        .as_deref()
        .is_some_and(|old_id| old_id != join.user_id)
    {
        cleanup(session);
        session.user_id = None;
        session.username.clear();
    }

    if let Err(err) = state
        .manager
        .add_user(&session.stream_key, &join.user_id, &join.username)
    {
        session.send_frame(ServerFrame::error(err.to_string())).await;
        return;
    }

    session.user_id = Some(join.user_id.clone());
    session.username = join.username.clone();

    // 제한기에 남아 있는 타임아웃/위반 상태를 새 명부 레코드에 비춘다
    let rate = state.limiter.rate_state(&join.user_id);
    state.manager.set_user_rate_state(
        &session.stream_key,
        &join.user_id,
        rate.timeout_until,
        rate.violations,
    );

    // 같은 user_id의 기존 항목은 교체된다. 밀려난 세션의 큐는 더 이상
    // 팬아웃을 받지 않고 다음 읽기 데드라인에 닫힌다
    state.sessions.insert(
        join.user_id.clone(),
        SessionHandle {
            username: join.username.clone(),
            stream_key: session.stream_key.clone(),
            sender: session.tx.clone(),
        },
    );

    let history = state.manager.get_messages(&session.stream_key, HISTORY_LIMIT);
    session
        .send_frame(ServerFrame::event(ServerEvent::History(history)))
        .await;

    let users = state.manager.get_users(&session.stream_key);
    session
        .send_frame(ServerFrame::event(ServerEvent::Users(users)))
        .await;

    if let Some(remaining) = state.limiter.timeout_status(&join.user_id) {
        session
            .send_frame(ServerFrame::event(ServerEvent::Timeout {
                duration: remaining.as_secs_f64(),
            }))
            .await;
    }

    broadcast_to_room_except(
        &state,
        &session.stream_key,
        &join.user_id,
        &ServerFrame::event(ServerEvent::UserJoined {
            user_id: join.user_id.clone(),
            username: join.username.clone(),
        }),
    );

    tracing::info!(
        user_id = %join.user_id,
        username = %join.username,
        stream_key = %session.stream_key,
        "User joined chat"
    );
}

/// `message` 처리: 속도 제한 판정 후 방에 저장하고 발신자를 포함한
/// 전원에게 브로드캐스트한다. 거부는 발신자에게만 알린다
pub async fn handle_message(session: &mut Session, data: Option<Value>) {
    let state = session.state.clone();

    let Some(user_id) = session.user_id.clone() else {
        session.send_error("Not joined to chat").await;
        return;
    };

    let text = data
        .and_then(|d| serde_json::from_value::<MessageData>(d).ok())
        .map(|d| d.message)
        .unwrap_or_default();
    if text.is_empty() {
        session.send_error("Invalid message content").await;
        return;
    }

    let verdict = state.limiter.check(&user_id, &text);

    // 판정이 갱신한 타임아웃/위반 횟수를 명부 레코드에도 비춘다
    let rate = state.limiter.rate_state(&user_id);
    state.manager.set_user_rate_state(
        &session.stream_key,
        &user_id,
        rate.timeout_until,
        rate.violations,
    );

    match verdict {
        Err(err) if err.code == "RATE_LIMIT" => {
            session.send_frame(ServerFrame::rate_limit(err.to_string())).await;
        }
        Err(err) => {
            session.send_frame(ServerFrame::error(err.to_string())).await;
        }
        Ok(()) => {
            // 수신자 목록은 방 락을 잡기 전에 스냅샷하고, 적재는 버퍼
            // 추가를 마친 임계 구역 안에서 한다. 수신자별 적재 순서는
            // 추가 순서와 일치한다
            let recipients = room_senders(&state, &session.stream_key);
            state.manager.add_message_with(
                &session.stream_key,
                &user_id,
                &session.username,
                &text,
                |msg| {
                    let frame = ServerFrame::event(ServerEvent::Message(msg.clone()));
                    for sender in &recipients {
                        let _ = sender.try_send(frame.clone());
                    }
                },
            );
        }
    }
}

/// `typing` 처리: 발신자를 제외한 방 전원에게 중계한다.
/// join 전이거나 페이로드가 깨졌으면 조용히 무시한다
pub fn handle_typing(session: &Session, data: Option<Value>) {
    let Some(user_id) = &session.user_id else {
        return;
    };
    let Some(typing) = data.and_then(|d| serde_json::from_value::<TypingData>(d).ok()) else {
        return;
    };

    broadcast_to_room_except(
        &session.state,
        &session.stream_key,
        user_id,
        &ServerFrame::event(ServerEvent::Typing {
            user_id: user_id.clone(),
            username: session.username.clone(),
            is_typing: typing.is_typing,
        }),
    );
}

/// 방 전원에게 비블로킹 적재. 큐가 가득 찬 수신자는 건너뛴다
pub fn broadcast_to_room(state: &AppState, stream_key: &str, frame: &ServerFrame) {
    for entry in state.sessions.iter() {
        if entry.stream_key == stream_key {
            let _ = entry.sender.try_send(frame.clone());
        }
    }
}

/// 한 명을 제외한 방 전원에게 적재
pub fn broadcast_to_room_except(
    state: &AppState,
    stream_key: &str,
    except_user_id: &str,
    frame: &ServerFrame,
) {
    for entry in state.sessions.iter() {
        if entry.stream_key == stream_key && entry.key() != except_user_id {
            let _ = entry.sender.try_send(frame.clone());
        }
    }
}

/// 시스템 공지를 방 전원에게 보낸다 (상위 서버가 호출하는 라이브러리 표면)
pub fn broadcast_system(state: &AppState, stream_key: &str, message: impl Into<String>) {
    broadcast_to_room(
        state,
        stream_key,
        &ServerFrame::event(ServerEvent::System {
            message: message.into(),
        }),
    );
}

/// 스트림에 등록된 세션들의 송신 핸들 스냅샷
fn room_senders(state: &AppState, stream_key: &str) -> Vec<mpsc::Sender<ServerFrame>> {
    state
        .sessions
        .iter()
        .filter(|entry| entry.stream_key == stream_key)
        .map(|entry| entry.sender.clone())
        .collect()
}
