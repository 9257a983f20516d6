// ====================================================================================
// src/store.rs - 房间存储接口与乐观事务
// ====================================================================================
use crate::{
    error::AppError,
    models::{Room, RoomChange, RoomStatus},
};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

// 带版本号的房间快照，版本号用于比较并提交
#[derive(Debug, Clone)]
pub struct Versioned {
    pub room: Room,
    pub version: i64,
}

// 房间存储：单记录原子条件提交 + 变更订阅
pub trait RoomStore: Send + Sync + 'static {
    fn insert(&self, room: &Room) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, room_id: Uuid) -> impl Future<Output = Result<Option<Versioned>, AppError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<Versioned>, AppError>> + Send;

    fn list_by_status(
        &self,
        status: RoomStatus,
    ) -> impl Future<Output = Result<Vec<Room>, AppError>> + Send;

    // 仅当存储中的版本仍为 expected_version 时写入；返回 false 表示冲突或记录已不存在
    fn compare_and_swap(
        &self,
        room: &Room,
        expected_version: i64,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn compare_and_delete(
        &self,
        room_id: Uuid,
        expected_version: i64,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn subscribe(&self) -> broadcast::Receiver<RoomChange>;
}

// 事务闭包的决定
pub enum Txn<T> {
    Write(Room, T),
    Delete(T),
    Abort(T),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

// 读取快照 -> 计算新值 -> 条件提交；冲突时按退避重试，超过次数返回 Conflict
pub async fn transact<S, T, F>(
    store: &S,
    retry: &RetryPolicy,
    room_id: Uuid,
    mut apply: F,
) -> Result<T, AppError>
where
    S: RoomStore,
    T: Send,
    F: FnMut(Option<Room>) -> Result<Txn<T>, AppError> + Send,
{
    let mut attempt = 0;
    loop {
        let current = store.get(room_id).await?;
        let version = current.as_ref().map(|v| v.version);

        match (apply(current.map(|v| v.room))?, version) {
            (Txn::Abort(out), _) => return Ok(out),
            (Txn::Write(room, out), Some(version)) => {
                if store.compare_and_swap(&room, version).await? {
                    return Ok(out);
                }
            }
            (Txn::Delete(out), Some(version)) => {
                if store.compare_and_delete(room_id, version).await? {
                    return Ok(out);
                }
            }
            (Txn::Write(..) | Txn::Delete(_), None) => {
                return Err(AppError::room_not_found(room_id));
            }
        }

        attempt += 1;
        if attempt >= retry.max_attempts {
            tracing::warn!(%room_id, attempts = attempt, "transaction gave up after repeated conflicts");
            return Err(AppError::Conflict(format!(
                "Room {} changed concurrently {} times",
                room_id, attempt
            )));
        }
        let delay = retry.delay_for(attempt - 1);
        tracing::debug!(%room_id, attempt, ?delay, "transaction conflict, retrying");
        sleep(delay).await;
    }
}
