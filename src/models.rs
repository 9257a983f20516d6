
// ====================================================================================
// src/models.rs - 数据模型定义
// ====================================================================================
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// 房间状态：只有 open 状态接受加入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Open,
    Playing,
    Closed,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Open => "open",
            RoomStatus::Playing => "playing",
            RoomStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RoomStatus::Open),
            "playing" => Ok(RoomStatus::Playing),
            "closed" => Ok(RoomStatus::Closed),
            other => Err(format!("unknown room status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Active,
    Disconnected,
}

// 嵌入在房间记录中的玩家
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub user_id: String,
    pub display_name: String,
    pub joined_at: i64,
    pub status: PlayerStatus,
    pub last_seen: i64,
}

impl Player {
    pub fn admitted(user_id: &str, display_name: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            joined_at: now,
            status: PlayerStatus::Active,
            last_seen: now,
        }
    }
}

// 房间记录；players 按加入顺序排列，是成员关系的唯一来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub creator_id: String,
    pub status: RoomStatus,
    pub players: Vec<Player>,
    pub max_players: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Room {
    // 创建者作为第一个玩家直接嵌入，不存在零玩家的中间状态
    pub fn open(name: &str, creator: &Player, max_players: usize, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            creator_id: creator.user_id.clone(),
            status: RoomStatus::Open,
            players: vec![creator.clone()],
            max_players,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self, capacity: usize) -> bool {
        self.player_count() >= capacity
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.players.iter().any(|p| p.user_id == user_id)
    }

    pub fn player_mut(&mut self, user_id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.user_id == user_id)
    }

    // updated_at 只增不减
    pub fn touch(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(now);
    }
}

// 存储变更通知；room 为 None 表示记录已删除，version 为提交后的版本号
#[derive(Debug, Clone)]
pub struct RoomChange {
    pub room_id: Uuid,
    pub version: i64,
    pub room: Option<Room>,
}

// API请求/响应模型
#[derive(Deserialize)]
pub struct CreateRoomRequest {
    pub room_name: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CreateRoomResponse {
    pub room_id: Uuid,
    pub heartbeat_interval_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JoinRoomResponse {
    pub room_id: Uuid,
    pub admitted: bool,
    pub heartbeat_interval_seconds: u64,
}

#[derive(Deserialize)]
pub struct UpdateRoomStatusRequest {
    pub status: RoomStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub started_at: i64,
    pub rooms_scanned: usize,
    pub players_evicted: usize,
    pub rooms_deleted: usize,
    pub rooms_failed: usize,
}

// WebSocket 推送消息模型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FeedMessage {
    OpenRooms { rooms: Vec<Room> },
    Room { room: Room },
    RoomGone { room_id: Uuid },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_room_embeds_creator() {
        let creator = Player::admitted("u1", "Alice", 1_000);
        let room = Room::open("Foo", &creator, 4, 1_000);
        assert_eq!(room.status, RoomStatus::Open);
        assert_eq!(room.creator_id, "u1");
        assert_eq!(room.player_count(), 1);
        assert!(room.contains("u1"));
        assert!(!room.is_full(4));
        assert!(room.is_full(1));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let creator = Player::admitted("u1", "Alice", 5_000);
        let mut room = Room::open("Foo", &creator, 4, 5_000);
        room.touch(4_000);
        assert_eq!(room.updated_at, 5_000);
        room.touch(6_000);
        assert_eq!(room.updated_at, 6_000);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&RoomStatus::Playing).unwrap(), "\"playing\"");
        assert_eq!(serde_json::to_string(&PlayerStatus::Disconnected).unwrap(), "\"disconnected\"");
        assert_eq!("closed".parse::<RoomStatus>().unwrap(), RoomStatus::Closed);
        assert!("lobby".parse::<RoomStatus>().is_err());
    }

    #[test]
    fn feed_messages_are_tagged() {
        let msg = FeedMessage::RoomGone { room_id: Uuid::nil() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "RoomGone");
        assert_eq!(json["payload"]["room_id"], Uuid::nil().to_string());
    }
}
