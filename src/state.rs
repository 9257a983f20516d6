// ====================================================================================
// src/state.rs - 共享应用状态
// ====================================================================================
use crate::{
    clock::Clock, config::Config, db::SqliteRoomStore, feed::RoomFeed,
    membership::MembershipCoordinator, presence::PresenceTracker, store::RoomStore,
    sweeper::SweepService,
};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

pub struct AppState<S = SqliteRoomStore> {
    pub lobby: MembershipCoordinator<S>,
    pub presence: PresenceTracker<S>,
    pub feed: RoomFeed<S>,
    pub sweeper: Arc<SweepService<S>>,
    pub total_connections: Arc<AtomicU32>,
    pub config: Config,
}

impl<S: RoomStore> AppState<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            lobby: MembershipCoordinator::new(store.clone(), clock.clone(), &config),
            presence: PresenceTracker::new(store.clone(), clock.clone(), config.retry_policy()),
            feed: RoomFeed::new(store.clone()),
            sweeper: Arc::new(SweepService::new(store, clock, &config)),
            total_connections: Arc::new(AtomicU32::new(0)),
            config,
        }
    }
}
