// ====================================================================================
// src/integrity.rs - 房间完整性守护
// ====================================================================================
use crate::{
    clock::Clock,
    config::Config,
    error::AppError,
    models::{Player, Room, RoomChange},
    store::{transact, RetryPolicy, RoomStore, Txn},
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

// 按加入时间保留最早的玩家：先去重同一 user_id，再稳定排序并截断到容量
pub fn trim_players(mut players: Vec<Player>, capacity: usize) -> Vec<Player> {
    players.sort_by_key(|p| p.joined_at);
    let mut seen = HashSet::new();
    players.retain(|p| seen.insert(p.user_id.clone()));
    players.truncate(capacity);
    players
}

pub struct IntegrityEnforcer<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    max_players: usize,
}

impl<S: RoomStore> IntegrityEnforcer<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            store,
            clock,
            retry: config.retry_policy(),
            max_players: config.max_players,
        }
    }

    // 容量以配置为准；记录里被改写的 max_players 同样视为违规
    fn violates(&self, room: &Room) -> bool {
        if room.max_players != self.max_players || room.player_count() > self.max_players {
            return true;
        }
        let mut seen = HashSet::new();
        !room.players.iter().all(|p| seen.insert(p.user_id.as_str()))
    }

    // 监听每一次提交；正常情况下协调器的事务保证不会进入纠正分支
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let changes = self.store.subscribe();
        tracing::info!("启动房间完整性守护，容量上限: {}", self.max_players);
        tokio::spawn(async move { self.listen(changes).await })
    }

    async fn listen(&self, mut changes: broadcast::Receiver<RoomChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let Some(room) = change.room else { continue };
                    if self.violates(&room) {
                        if let Err(e) = self.enforce(room.id).await {
                            tracing::error!(room_id = %room.id, "failed to restore room integrity: {}", e);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "integrity listener lagged, rechecking every room");
                    if let Err(e) = self.enforce_all().await {
                        tracing::error!("integrity recheck failed: {}", e);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("房间完整性守护已停止");
    }

    // 返回 true 表示提交了一次纠正
    pub async fn enforce(&self, room_id: Uuid) -> Result<bool, AppError> {
        let clock = &self.clock;
        let corrected = transact(&*self.store, &self.retry, room_id, |current| {
            let Some(mut room) = current else {
                return Ok(Txn::Abort(None));
            };
            if !self.violates(&room) {
                return Ok(Txn::Abort(None));
            }
            let before = room.players.len();
            room.players = trim_players(std::mem::take(&mut room.players), self.max_players);
            room.max_players = self.max_players;
            room.touch(clock.now_millis());
            let dropped = before - room.players.len();
            Ok(Txn::Write(room, Some(dropped)))
        })
        .await?;

        match corrected {
            Some(dropped) => {
                tracing::warn!(%room_id, dropped, "room exceeded its invariants, trimmed to earliest joiners");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn enforce_all(&self) -> Result<usize, AppError> {
        let mut corrected = 0;
        for versioned in self.store.list().await? {
            if self.violates(&versioned.room) && self.enforce(versioned.room.id).await? {
                corrected += 1;
            }
        }
        Ok(corrected)
    }
}
