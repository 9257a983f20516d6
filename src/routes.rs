
// ====================================================================================
// src/routes.rs - HTTP路由处理
// ====================================================================================
use crate::{
    config::Config,
    error::AppError,
    handler::{self, ConnectionGuard},
    identity::Identity,
    models::{
        CreateRoomRequest, CreateRoomResponse, JoinRoomResponse, Room, SweepReport,
        UpdateRoomStatusRequest,
    },
    state::AppState,
};
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub fn router(state: Arc<AppState>) -> Router {
    // 定义CORS策略
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/management/health", get(health_check))
        .route("/management/sweep", post(trigger_sweep))
        .route("/rooms", get(list_open_rooms).post(create_room))
        .route("/rooms/:room_id", get(get_room))
        .route("/rooms/:room_id/join", post(join_room))
        .route("/rooms/:room_id/leave", post(leave_room))
        .route("/rooms/:room_id/presence", post(update_presence))
        .route("/rooms/:room_id/disconnect", post(mark_disconnected))
        .route("/rooms/:room_id/status", put(update_room_status))
        .route("/ws/rooms", get(ws_open_rooms))
        .route("/ws/rooms/:room_id", get(ws_watch_room))
        .with_state(state)
        .layer(cors)
}

// 健康检查
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

// 创建房间
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, AppError> {
    let identity = Identity::from_headers(&headers)?;
    let room_id = state.lobby.create_room(&identity, &payload.room_name).await?;
    Ok(Json(CreateRoomResponse {
        room_id,
        heartbeat_interval_seconds: state.config.heartbeat_interval_seconds,
    }))
}

// 查询所有开放房间
pub async fn list_open_rooms(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Room>>, AppError> {
    Ok(Json(state.lobby.open_rooms().await?))
}

pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<Room>, AppError> {
    Ok(Json(state.lobby.get_room(room_id).await?))
}

// 加入房间；满员返回 admitted = false 而不是错误
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<Json<JoinRoomResponse>, AppError> {
    let identity = Identity::from_headers(&headers)?;
    let admitted = state.lobby.join_room(&identity, room_id).await?;
    Ok(Json(JoinRoomResponse {
        room_id,
        admitted,
        heartbeat_interval_seconds: state.config.heartbeat_interval_seconds,
    }))
}

pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let identity = Identity::from_headers(&headers)?;
    state.lobby.leave_room(&identity, room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// 心跳
pub async fn update_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let identity = Identity::from_headers(&headers)?;
    state.presence.update_presence(&identity, room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// 客户端切到后台
pub async fn mark_disconnected(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let identity = Identity::from_headers(&headers)?;
    state.presence.mark_disconnected(&identity, room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_room_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<UpdateRoomStatusRequest>,
) -> Result<StatusCode, AppError> {
    let identity = Identity::from_headers(&headers)?;
    state.lobby.set_room_status(&identity, room_id, payload.status).await?;
    Ok(StatusCode::NO_CONTENT)
}

// 开放房间列表的实时推送
pub async fn ws_open_rooms(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let guard = match reserve_connection(&state) {
        Ok(guard) => guard,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handler::stream_open_rooms(socket, state, guard))
}

// 单个房间的实时推送
pub async fn ws_watch_room(
    ws: WebSocketUpgrade,
    Path(room_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let guard = match reserve_connection(&state) {
        Ok(guard) => guard,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handler::stream_room(socket, state, room_id, guard))
}

// 手动触发清理
pub async fn trigger_sweep(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, AppError> {
    check_auth(&headers, &state.config)?;
    tracing::info!("手动触发房间清理");
    Ok(Json(state.sweeper.sweep().await?))
}

// 负载保护：升级前占用连接名额，升级失败时名额随 guard 释放
fn reserve_connection(state: &AppState) -> Result<ConnectionGuard, AppError> {
    ConnectionGuard::try_acquire(state.total_connections.clone(), state.config.max_connections)
        .ok_or_else(|| AppError::ServiceUnavailable("服务器连接数已达上限".to_string()))
}

// 管理接口认证；未配置密钥时不做校验
fn check_auth(headers: &HeaderMap, config: &Config) -> Result<(), AppError> {
    let Some(expected) = &config.admin_api_key else {
        return Ok(());
    };
    match headers.get("X-Api-Key").and_then(|v| v.to_str().ok()) {
        Some(key) if key == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}
