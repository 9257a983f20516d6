// ====================================================================================
// src/feed.rs - 房间实时订阅
// ====================================================================================
use crate::{
    error::AppError,
    models::{Room, RoomChange, RoomStatus},
    store::RoomStore,
};
use futures_util::stream::{self, Stream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

// RAII Guard for subscription counting
pub struct SubscriptionGuard {
    count: Arc<AtomicUsize>,
}

impl SubscriptionGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

// 订阅的全部资源：变更接收端与计数 guard 同生共死，流被丢弃时一并释放
struct Subscription<S> {
    store: Arc<S>,
    changes: broadcast::Receiver<RoomChange>,
    primed: bool,
    finished: bool,
    seen_version: i64,
    _guard: SubscriptionGuard,
}

pub struct RoomFeed<S> {
    store: Arc<S>,
    active: Arc<AtomicUsize>,
}

impl<S> Clone for RoomFeed<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            active: self.active.clone(),
        }
    }
}

impl<S: RoomStore> RoomFeed<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    // 先订阅再读取快照，保证不会漏掉两者之间的变更
    fn subscription(&self) -> Subscription<S> {
        Subscription {
            changes: self.store.subscribe(),
            store: self.store.clone(),
            primed: false,
            finished: false,
            seen_version: -1,
            _guard: SubscriptionGuard::new(self.active.clone()),
        }
    }

    // 所有 open 房间的实时快照；出错后流结束
    pub fn open_rooms(&self) -> impl Stream<Item = Result<Vec<Room>, AppError>> + Send + use<S> {
        stream::unfold(self.subscription(), |mut sub| async move {
            if sub.finished {
                return None;
            }
            if sub.primed {
                loop {
                    match sub.changes.recv().await {
                        Ok(_) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "open room feed lagged, resynchronising");
                            break;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
            sub.primed = true;
            let snapshot = sub.store.list_by_status(RoomStatus::Open).await;
            sub.finished = snapshot.is_err();
            Some((snapshot, sub))
        })
    }

    // 单个房间的实时状态；房间不存在或被删除时发出一次 None 后结束
    // 版本号不大于已发出版本的事件被丢弃，乱序到达的旧状态不会覆盖新状态
    pub fn watch_room(
        &self,
        room_id: Uuid,
    ) -> impl Stream<Item = Result<Option<Room>, AppError>> + Send + use<S> {
        stream::unfold(self.subscription(), move |mut sub| async move {
            if sub.finished {
                return None;
            }
            let item = if !sub.primed {
                sub.primed = true;
                Self::resync(&mut sub, room_id).await
            } else {
                loop {
                    match sub.changes.recv().await {
                        Ok(change) if change.room_id == room_id => {
                            if change.version <= sub.seen_version {
                                continue;
                            }
                            sub.seen_version = change.version;
                            break Ok(change.room);
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%room_id, skipped, "room feed lagged, resynchronising");
                            break Self::resync(&mut sub, room_id).await;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            };
            sub.finished = !matches!(item, Ok(Some(_)));
            Some((item, sub))
        })
    }

    async fn resync(sub: &mut Subscription<S>, room_id: Uuid) -> Result<Option<Room>, AppError> {
        let current = sub.store.get(room_id).await?;
        Ok(current.map(|v| {
            sub.seen_version = sub.seen_version.max(v.version);
            v.room
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipCoordinator;
    use crate::test_support::{identity, manual_clock, memory_store, memory_store_with_feed, test_config};
    use futures_util::StreamExt;
    use tokio::time::{timeout, Duration};

    async fn next<St: Stream + Unpin>(stream: &mut St) -> Option<St::Item> {
        timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("feed produced nothing")
    }

    #[tokio::test]
    async fn watch_after_create_round_trips() {
        let store = memory_store().await;
        let lobby = MembershipCoordinator::new(store.clone(), manual_clock(), &test_config());
        let feed = RoomFeed::new(store.clone());

        let room_id = lobby.create_room(&identity("alice"), "Foo").await.unwrap();
        let mut watch = Box::pin(feed.watch_room(room_id));

        let room = next(&mut watch).await.unwrap().unwrap().unwrap();
        assert_eq!(room.name, "Foo");
        assert_eq!(room.players.len(), 1);
        assert_eq!(room.status, RoomStatus::Open);
    }

    #[tokio::test]
    async fn watch_follows_updates_until_deleted() {
        let store = memory_store().await;
        let lobby = MembershipCoordinator::new(store.clone(), manual_clock(), &test_config());
        let feed = RoomFeed::new(store.clone());

        let room_id = lobby.create_room(&identity("alice"), "Foo").await.unwrap();
        let other = lobby.create_room(&identity("zed"), "Other").await.unwrap();
        let mut watch = Box::pin(feed.watch_room(room_id));
        assert!(next(&mut watch).await.unwrap().unwrap().is_some());

        lobby.join_room(&identity("zoe"), other).await.unwrap();
        lobby.join_room(&identity("bob"), room_id).await.unwrap();
        let room = next(&mut watch).await.unwrap().unwrap().unwrap();
        assert_eq!(room.players.len(), 2);

        let version = store.get(room_id).await.unwrap().unwrap().version;
        assert!(store.compare_and_delete(room_id, version).await.unwrap());
        assert!(next(&mut watch).await.unwrap().unwrap().is_none());
        assert!(next(&mut watch).await.is_none());
    }

    #[tokio::test]
    async fn watching_a_missing_room_emits_absent_once() {
        let store = memory_store().await;
        let feed = RoomFeed::new(store);
        let mut watch = Box::pin(feed.watch_room(Uuid::new_v4()));
        assert!(next(&mut watch).await.unwrap().unwrap().is_none());
        assert!(next(&mut watch).await.is_none());
    }

    #[tokio::test]
    async fn open_room_list_tracks_status_changes() {
        let store = memory_store().await;
        let lobby = MembershipCoordinator::new(store.clone(), manual_clock(), &test_config());
        let feed = RoomFeed::new(store.clone());
        let alice = identity("alice");

        let mut rooms = Box::pin(feed.open_rooms());
        assert!(next(&mut rooms).await.unwrap().unwrap().is_empty());

        let room_id = lobby.create_room(&alice, "Foo").await.unwrap();
        let snapshot = next(&mut rooms).await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, room_id);

        lobby.set_room_status(&alice, room_id, RoomStatus::Playing).await.unwrap();
        assert!(next(&mut rooms).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lagging_watch_resynchronises_to_latest_state() {
        let store = memory_store_with_feed(1).await;
        let lobby = MembershipCoordinator::new(store.clone(), manual_clock(), &test_config());
        let feed = RoomFeed::new(store.clone());

        let room_id = lobby.create_room(&identity("alice"), "Foo").await.unwrap();
        let mut watch = Box::pin(feed.watch_room(room_id));
        assert_eq!(next(&mut watch).await.unwrap().unwrap().unwrap().players.len(), 1);

        // 流未被轮询期间连续提交，容量为 1 的通道必然溢出
        for user in ["bob", "carol", "dave"] {
            assert!(lobby.join_room(&identity(user), room_id).await.unwrap());
        }
        let room = next(&mut watch).await.unwrap().unwrap().unwrap();
        assert_eq!(room.players.len(), 4);

        // 溢出后残留的旧事件被丢弃，下一次提交照常送达
        lobby.leave_room(&identity("bob"), room_id).await.unwrap();
        let room = next(&mut watch).await.unwrap().unwrap().unwrap();
        assert_eq!(room.players.len(), 3);
        assert!(!room.contains("bob"));
    }

    #[tokio::test]
    async fn lagging_open_room_list_resynchronises() {
        let store = memory_store_with_feed(1).await;
        let lobby = MembershipCoordinator::new(store.clone(), manual_clock(), &test_config());
        let feed = RoomFeed::new(store.clone());

        let mut rooms = Box::pin(feed.open_rooms());
        assert!(next(&mut rooms).await.unwrap().unwrap().is_empty());

        for owner in ["alice", "bob", "carol"] {
            lobby.create_room(&identity(owner), "Foo").await.unwrap();
        }
        assert_eq!(next(&mut rooms).await.unwrap().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stale_events_do_not_rewind_a_watch() {
        let store = memory_store().await;
        let lobby = MembershipCoordinator::new(store.clone(), manual_clock(), &test_config());
        let feed = RoomFeed::new(store.clone());

        let room_id = lobby.create_room(&identity("alice"), "Foo").await.unwrap();
        lobby.join_room(&identity("bob"), room_id).await.unwrap();
        let mut watch = Box::pin(feed.watch_room(room_id));
        let primed = next(&mut watch).await.unwrap().unwrap().unwrap();
        assert_eq!(primed.players.len(), 2);

        // 用旧版本号重放一条过时的创建事件，它不应覆盖已发出的状态
        let mut stale = primed.clone();
        stale.players.truncate(1);
        store.replay(room_id, 0, Some(stale));
        lobby.join_room(&identity("carol"), room_id).await.unwrap();

        let room = next(&mut watch).await.unwrap().unwrap().unwrap();
        assert_eq!(room.players.len(), 3);
    }

    #[tokio::test]
    async fn dropping_a_stream_releases_the_subscription() {
        let store = memory_store().await;
        let feed = RoomFeed::new(store);

        let rooms = feed.open_rooms();
        let watch = feed.watch_room(Uuid::new_v4());
        assert_eq!(feed.active_subscriptions(), 2);

        drop(rooms);
        assert_eq!(feed.active_subscriptions(), 1);
        drop(watch);
        assert_eq!(feed.active_subscriptions(), 0);
    }
}
