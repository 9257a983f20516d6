// ====================================================================================
// src/db.rs - 数据库交互（SQLite 房间存储）
// ====================================================================================
use crate::error::AppError;
use crate::models::{Player, Room, RoomChange, RoomStatus};
use crate::store::{RoomStore, Versioned};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(FromRow)]
struct RoomRow {
    id: String,
    name: String,
    creator_id: String,
    status: String,
    players: String,
    max_players: i64,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl TryFrom<RoomRow> for Versioned {
    type Error = AppError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| AppError::InternalServerError(format!("bad room id '{}': {}", row.id, e)))?;
        let status = row
            .status
            .parse::<RoomStatus>()
            .map_err(AppError::InternalServerError)?;
        let players: Vec<Player> = serde_json::from_str(&row.players)?;
        let max_players = usize::try_from(row.max_players).map_err(|_| {
            AppError::InternalServerError(format!(
                "bad max_players {} for room {}",
                row.max_players, row.id
            ))
        })?;
        Ok(Versioned {
            room: Room {
                id,
                name: row.name,
                creator_id: row.creator_id,
                status,
                players,
                max_players,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
            version: row.version,
        })
    }
}

// 初始化数据库表
pub async fn migrate(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::raw_sql(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            creator_id TEXT NOT NULL,
            status TEXT NOT NULL,
            players TEXT NOT NULL,
            max_players INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        );

        -- 按状态过滤开放房间
        CREATE INDEX IF NOT EXISTS idx_rooms_status ON rooms(status);
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub struct SqliteRoomStore {
    pool: SqlitePool,
    changes: broadcast::Sender<RoomChange>,
}

impl SqliteRoomStore {
    pub fn new(pool: SqlitePool, feed_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(feed_capacity.max(1));
        Self { pool, changes }
    }

    // 连接数据库并运行迁移；内存数据库每个连接都是独立实例，因此只保留一个常驻连接
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        feed_capacity: usize,
    ) -> Result<Self, AppError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory {
            1
        } else {
            max_connections.max(1)
        });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;
        migrate(&pool).await?;
        Ok(Self::new(pool, feed_capacity))
    }

    // version 是本次提交之后的版本号；删除事件同样递增
    fn publish(&self, room_id: Uuid, version: i64, room: Option<Room>) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.changes.send(RoomChange { room_id, version, room });
    }

    // 重放任意事件，模拟延迟到达的旧通知
    #[cfg(test)]
    pub fn replay(&self, room_id: Uuid, version: i64, room: Option<Room>) {
        self.publish(room_id, version, room);
    }
}

impl RoomStore for SqliteRoomStore {
    async fn insert(&self, room: &Room) -> Result<(), AppError> {
        let players = serde_json::to_string(&room.players)?;
        sqlx::query(
            "INSERT INTO rooms (id, name, creator_id, status, players, max_players, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(room.id.to_string())
        .bind(&room.name)
        .bind(&room.creator_id)
        .bind(room.status.as_str())
        .bind(players)
        .bind(room.max_players as i64)
        .bind(room.created_at)
        .bind(room.updated_at)
        .execute(&self.pool)
        .await?;
        self.publish(room.id, 0, Some(room.clone()));
        Ok(())
    }

    async fn get(&self, room_id: Uuid) -> Result<Option<Versioned>, AppError> {
        let row = sqlx::query_as::<_, RoomRow>("SELECT * FROM rooms WHERE id = ?")
            .bind(room_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Versioned::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<Versioned>, AppError> {
        let rows = sqlx::query_as::<_, RoomRow>("SELECT * FROM rooms ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Versioned::try_from).collect()
    }

    async fn list_by_status(&self, status: RoomStatus) -> Result<Vec<Room>, AppError> {
        let rows = sqlx::query_as::<_, RoomRow>(
            "SELECT * FROM rooms WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Versioned::try_from(row).map(|v| v.room))
            .collect()
    }

    async fn compare_and_swap(&self, room: &Room, expected_version: i64) -> Result<bool, AppError> {
        let players = serde_json::to_string(&room.players)?;
        let result = sqlx::query(
            "UPDATE rooms
             SET name = ?, creator_id = ?, status = ?, players = ?, max_players = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(&room.name)
        .bind(&room.creator_id)
        .bind(room.status.as_str())
        .bind(players)
        .bind(room.max_players as i64)
        .bind(room.updated_at)
        .bind(room.id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            self.publish(room.id, expected_version + 1, Some(room.clone()));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn compare_and_delete(&self, room_id: Uuid, expected_version: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM rooms WHERE id = ? AND version = ?")
            .bind(room_id.to_string())
            .bind(expected_version)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            self.publish(room_id, expected_version + 1, None);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomChange> {
        self.changes.subscribe()
    }
}
