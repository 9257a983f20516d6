// ====================================================================================
// src/sweeper.rs - 定时清理服务
// ====================================================================================
use crate::{
    clock::Clock,
    config::Config,
    error::AppError,
    models::SweepReport,
    presence::PresenceRule,
    store::{transact, RetryPolicy, RoomStore, Txn},
};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use uuid::Uuid;

// 单个房间的清理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciled {
    Untouched,
    Evicted(usize),
    Deleted(usize),
}

pub struct SweepService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    rule: PresenceRule,
    retry: RetryPolicy,
    interval: Duration,
    concurrency: usize,
}

impl<S: RoomStore> SweepService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            store,
            clock,
            rule: config.presence_rule(),
            retry: config.retry_policy(),
            interval: config.sweep_interval(),
            concurrency: config.sweep_concurrency.max(1),
        }
    }

    // 启动定时清理任务
    pub fn start_periodic_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!("启动定时清理服务，间隔: {}秒", self.interval.as_secs());

        tokio::spawn(async move {
            let mut interval_timer = time::interval(self.interval);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval_timer.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!("定时清理失败: {}", e);
                }
            }
        })
    }

    // 清理所有房间；单个房间失败只记录并跳过，不影响其他房间
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = self.clock.now_millis();
        let room_ids: Vec<Uuid> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|v| v.room.id)
            .collect();

        let mut report = SweepReport {
            started_at: now,
            rooms_scanned: room_ids.len(),
            ..SweepReport::default()
        };

        let mut outcomes = stream::iter(room_ids)
            .map(|room_id| async move { (room_id, self.reconcile_room(room_id, now).await) })
            .buffer_unordered(self.concurrency);

        while let Some((room_id, outcome)) = outcomes.next().await {
            match outcome {
                Ok(Reconciled::Untouched) => {}
                Ok(Reconciled::Evicted(evicted)) => {
                    report.players_evicted += evicted;
                    tracing::info!(%room_id, evicted, "evicted stale players");
                }
                Ok(Reconciled::Deleted(evicted)) => {
                    report.players_evicted += evicted;
                    report.rooms_deleted += 1;
                    tracing::info!(%room_id, evicted, "deleted empty room");
                }
                Err(e) => {
                    report.rooms_failed += 1;
                    if e.is_terminal() {
                        tracing::warn!(%room_id, "skipping room this cycle: {}", e);
                    } else {
                        tracing::error!(%room_id, "room reconciliation failed: {}", e);
                    }
                }
            }
        }

        tracing::info!(
            rooms = report.rooms_scanned,
            evicted = report.players_evicted,
            deleted = report.rooms_deleted,
            failed = report.rooms_failed,
            "完成所有房间的定时清理"
        );
        Ok(report)
    }

    // 以本轮清理的开始时间判定过期；保留集合为空时删除整个房间
    async fn reconcile_room(&self, room_id: Uuid, now: i64) -> Result<Reconciled, AppError> {
        let rule = self.rule;
        transact(&*self.store, &self.retry, room_id, |current| {
            let Some(mut room) = current else {
                return Ok(Txn::Abort(Reconciled::Untouched));
            };
            let before = room.players.len();
            room.players.retain(|p| !rule.is_stale(p, now));
            let evicted = before - room.players.len();

            if room.players.is_empty() {
                return Ok(Txn::Delete(Reconciled::Deleted(evicted)));
            }
            if evicted == 0 {
                return Ok(Txn::Abort(Reconciled::Untouched));
            }
            room.touch(now);
            Ok(Txn::Write(room, Reconciled::Evicted(evicted)))
        })
        .await
    }
}
