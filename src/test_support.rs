// ====================================================================================
// src/test_support.rs - 测试辅助
// ====================================================================================
use crate::{
    clock::ManualClock,
    config::Config,
    db::SqliteRoomStore,
    error::AppError,
    identity::Identity,
    models::{Room, RoomChange, RoomStatus},
    store::{RetryPolicy, RoomStore, Versioned},
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::Duration;
use uuid::Uuid;

pub const T0: i64 = 1_700_000_000_000;

pub async fn memory_store() -> Arc<SqliteRoomStore> {
    memory_store_with_feed(1024).await
}

// 变更通道容量很小时，订阅者很容易落后
pub async fn memory_store_with_feed(capacity: usize) -> Arc<SqliteRoomStore> {
    let store = SqliteRoomStore::connect("sqlite::memory:", 1, capacity)
        .await
        .expect("in-memory sqlite store");
    Arc::new(store)
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

// 并发测试需要更宽松的重试次数
pub fn test_config() -> Config {
    Config {
        txn_max_attempts: 64,
        txn_retry_base_delay_ms: 1,
        txn_retry_max_delay_ms: 4,
        change_feed_capacity: 1024,
        ..Config::default()
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T0))
}

pub fn identity(user_id: &str) -> Identity {
    Identity::new(user_id, Some(&format!("Player {}", user_id))).expect("valid identity")
}

// 可按房间注入故障的存储包装
pub struct FlakyStore<S> {
    inner: Arc<S>,
    conflicting: Mutex<HashSet<Uuid>>,
    unavailable: Mutex<HashSet<Uuid>>,
}

impl<S: RoomStore> FlakyStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            conflicting: Mutex::new(HashSet::new()),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    pub fn always_conflict(&self, room_id: Uuid) {
        self.conflicting.lock().unwrap().insert(room_id);
    }

    pub fn fail_reads(&self, room_id: Uuid) {
        self.unavailable.lock().unwrap().insert(room_id);
    }

    fn is_conflicting(&self, room_id: Uuid) -> bool {
        self.conflicting.lock().unwrap().contains(&room_id)
    }

    fn is_unavailable(&self, room_id: Uuid) -> bool {
        self.unavailable.lock().unwrap().contains(&room_id)
    }
}

impl<S: RoomStore> RoomStore for FlakyStore<S> {
    async fn insert(&self, room: &Room) -> Result<(), AppError> {
        self.inner.insert(room).await
    }

    async fn get(&self, room_id: Uuid) -> Result<Option<Versioned>, AppError> {
        if self.is_unavailable(room_id) {
            return Err(AppError::StoreUnavailable(sqlx::Error::PoolTimedOut));
        }
        self.inner.get(room_id).await
    }

    async fn list(&self) -> Result<Vec<Versioned>, AppError> {
        self.inner.list().await
    }

    async fn list_by_status(&self, status: RoomStatus) -> Result<Vec<Room>, AppError> {
        self.inner.list_by_status(status).await
    }

    async fn compare_and_swap(&self, room: &Room, expected_version: i64) -> Result<bool, AppError> {
        if self.is_conflicting(room.id) {
            return Ok(false);
        }
        self.inner.compare_and_swap(room, expected_version).await
    }

    async fn compare_and_delete(&self, room_id: Uuid, expected_version: i64) -> Result<bool, AppError> {
        if self.is_conflicting(room_id) {
            return Ok(false);
        }
        self.inner.compare_and_delete(room_id, expected_version).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomChange> {
        self.inner.subscribe()
    }
}
