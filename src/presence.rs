// ====================================================================================
// src/presence.rs - 玩家在线状态
// ====================================================================================
use crate::{
    clock::Clock,
    error::AppError,
    identity::Identity,
    models::{Player, PlayerStatus},
    store::{transact, RetryPolicy, RoomStore, Txn},
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

// 判定"过期"玩家的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalenessPolicy {
    // 超过超时时间没有心跳即过期，不论状态
    #[default]
    Silence,
    // 只有 disconnected 的玩家会过期，active 玩家永不过期
    ActiveExempt,
}

impl FromStr for StalenessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silence" => Ok(StalenessPolicy::Silence),
            "active-exempt" => Ok(StalenessPolicy::ActiveExempt),
            other => Err(format!("unknown staleness policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceRule {
    timeout_millis: i64,
    policy: StalenessPolicy,
}

impl PresenceRule {
    pub fn new(timeout: Duration, policy: StalenessPolicy) -> Self {
        Self {
            timeout_millis: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            policy,
        }
    }

    pub fn timeout_millis(&self) -> i64 {
        self.timeout_millis
    }

    // 过期是派生属性，不存储
    pub fn is_stale(&self, player: &Player, now: i64) -> bool {
        let silent = now.saturating_sub(player.last_seen) > self.timeout_millis;
        match self.policy {
            StalenessPolicy::Silence => silent,
            StalenessPolicy::ActiveExempt => silent && player.status == PlayerStatus::Disconnected,
        }
    }
}

pub struct PresenceTracker<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S: RoomStore> PresenceTracker<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    // 心跳：状态变为 active 并刷新 last_seen
    #[instrument(skip(self, identity), fields(user_id = identity.user_id()))]
    pub async fn update_presence(&self, identity: &Identity, room_id: Uuid) -> Result<(), AppError> {
        self.record(identity, room_id, PlayerStatus::Active).await
    }

    // 切到后台：记录最后一次确认联系的时间
    #[instrument(skip(self, identity), fields(user_id = identity.user_id()))]
    pub async fn mark_disconnected(&self, identity: &Identity, room_id: Uuid) -> Result<(), AppError> {
        self.record(identity, room_id, PlayerStatus::Disconnected).await
    }

    // 房间或玩家已不存在时静默返回，绝不重建
    async fn record(&self, identity: &Identity, room_id: Uuid, status: PlayerStatus) -> Result<(), AppError> {
        let clock = &self.clock;
        let user_id = identity.user_id();
        let updated = transact(&*self.store, &self.retry, room_id, |current| {
            let Some(mut room) = current else {
                return Ok(Txn::Abort(false));
            };
            let now = clock.now_millis();
            let Some(player) = room.player_mut(user_id) else {
                return Ok(Txn::Abort(false));
            };
            player.status = status;
            player.last_seen = player.last_seen.max(now);
            room.touch(now);
            Ok(Txn::Write(room, true))
        })
        .await?;

        if updated {
            tracing::debug!(%room_id, ?status, "presence recorded");
        }
        Ok(())
    }
}
