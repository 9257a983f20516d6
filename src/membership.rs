// ====================================================================================
// src/membership.rs - 房间成员协调器
// ====================================================================================
use crate::{
    clock::Clock,
    config::Config,
    error::AppError,
    identity::Identity,
    models::{Player, Room, RoomStatus},
    store::{transact, RetryPolicy, RoomStore, Txn},
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub struct MembershipCoordinator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    max_players: usize,
}

impl<S: RoomStore> MembershipCoordinator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            store,
            clock,
            retry: config.retry_policy(),
            max_players: config.max_players,
        }
    }

    // 创建房间，创建者随记录一起原子写入
    #[instrument(skip(self, identity), fields(user_id = identity.user_id()))]
    pub async fn create_room(&self, identity: &Identity, name: &str) -> Result<Uuid, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("room name must not be empty".to_string()));
        }

        let now = self.clock.now_millis();
        let creator = Player::admitted(identity.user_id(), identity.display_name(), now);
        let room = Room::open(name, &creator, self.max_players, now);
        self.store.insert(&room).await?;

        tracing::info!(room_id = %room.id, "room created");
        Ok(room.id)
    }

    // 在单个乐观事务内完成容量检查与追加，冲突时重新读取后再判定
    // 容量按配置判定，不信任记录中的 max_players
    #[instrument(skip(self, identity), fields(user_id = identity.user_id()))]
    pub async fn join_room(&self, identity: &Identity, room_id: Uuid) -> Result<bool, AppError> {
        let clock = &self.clock;
        let admitted = transact(&*self.store, &self.retry, room_id, |current| {
            let mut room = current.ok_or_else(|| AppError::room_not_found(room_id))?;

            // 重复加入（例如崩溃后重连）直接视为成功，不重复计数
            if room.contains(identity.user_id()) {
                return Ok(Txn::Abort(true));
            }
            if room.status != RoomStatus::Open || room.is_full(self.max_players) {
                return Ok(Txn::Abort(false));
            }

            let now = clock.now_millis();
            room.players
                .push(Player::admitted(identity.user_id(), identity.display_name(), now));
            room.touch(now);
            Ok(Txn::Write(room, true))
        })
        .await?;

        if admitted {
            tracing::info!(%room_id, "player admitted");
        } else {
            tracing::info!(%room_id, "join rejected, room full or not open");
        }
        Ok(admitted)
    }

    // 离开房间不会删除房间；空房间由清理任务负责删除
    #[instrument(skip(self, identity), fields(user_id = identity.user_id()))]
    pub async fn leave_room(&self, identity: &Identity, room_id: Uuid) -> Result<(), AppError> {
        let clock = &self.clock;
        let removed = transact(&*self.store, &self.retry, room_id, |current| {
            let Some(mut room) = current else {
                return Ok(Txn::Abort(false));
            };
            let before = room.players.len();
            room.players.retain(|p| p.user_id != identity.user_id());
            if room.players.len() == before {
                return Ok(Txn::Abort(false));
            }
            room.touch(clock.now_millis());
            Ok(Txn::Write(room, true))
        })
        .await?;

        if removed {
            tracing::info!(%room_id, "player left");
        }
        Ok(())
    }

    // 只有创建者可以切换房间状态
    #[instrument(skip(self, identity), fields(user_id = identity.user_id()))]
    pub async fn set_room_status(
        &self,
        identity: &Identity,
        room_id: Uuid,
        status: RoomStatus,
    ) -> Result<(), AppError> {
        let clock = &self.clock;
        transact(&*self.store, &self.retry, room_id, |current| {
            let mut room = current.ok_or_else(|| AppError::room_not_found(room_id))?;
            if room.creator_id != identity.user_id() {
                return Err(AppError::Forbidden(format!(
                    "only the creator may change room {}",
                    room_id
                )));
            }
            if room.status == status {
                return Ok(Txn::Abort(()));
            }
            room.status = status;
            room.touch(clock.now_millis());
            Ok(Txn::Write(room, ()))
        })
        .await?;

        tracing::info!(%room_id, %status, "room status changed");
        Ok(())
    }

    pub async fn get_room(&self, room_id: Uuid) -> Result<Room, AppError> {
        self.store
            .get(room_id)
            .await?
            .map(|v| v.room)
            .ok_or_else(|| AppError::room_not_found(room_id))
    }

    pub async fn open_rooms(&self) -> Result<Vec<Room>, AppError> {
        self.store.list_by_status(RoomStatus::Open).await
    }
}
