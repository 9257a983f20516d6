// ====================================================================================
// src/handler.rs - WebSocket 实时推送
// ====================================================================================
use crate::{error::AppError, models::FeedMessage, state::AppState};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{Stream, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// RAII Guard for connection counting
pub struct ConnectionGuard {
    count: Arc<AtomicU32>,
}

impl ConnectionGuard {
    // 检查与占位是同一个原子操作，并发升级不会超过上限
    pub fn try_acquire(count: Arc<AtomicU32>, limit: u32) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()?;
        Some(Self { count })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

// 推送开放房间列表
pub async fn stream_open_rooms(socket: WebSocket, state: Arc<AppState>, _conn_guard: ConnectionGuard) {
    let updates = state.feed.open_rooms().map(|snapshot| match snapshot {
        Ok(rooms) => FeedMessage::OpenRooms { rooms },
        Err(e) => feed_error(e),
    });
    pump(socket, updates).await;
}

// 推送单个房间状态，房间删除后发送 RoomGone 并关闭
pub async fn stream_room(
    socket: WebSocket,
    state: Arc<AppState>,
    room_id: Uuid,
    _conn_guard: ConnectionGuard,
) {
    let updates = state.feed.watch_room(room_id).map(move |snapshot| match snapshot {
        Ok(Some(room)) => FeedMessage::Room { room },
        Ok(None) => FeedMessage::RoomGone { room_id },
        Err(e) => feed_error(e),
    });
    pump(socket, updates).await;
}

fn feed_error(e: AppError) -> FeedMessage {
    tracing::error!("live feed failed: {}", e);
    FeedMessage::Error { message: e.to_string() }
}

// 客户端断开、发送失败或订阅结束都会退出循环；订阅随 updates 一起被释放
async fn pump<St>(mut socket: WebSocket, updates: St)
where
    St: Stream<Item = FeedMessage> + Send,
{
    let mut updates = Box::pin(updates);
    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(update) = update else { break };
                let text = match serde_json::to_string(&update) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode feed message: {}", e);
                        break;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
    tracing::debug!("live feed closed");
}
