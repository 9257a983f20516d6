
// ====================================================================================
// src/main.rs - 应用入口
// ====================================================================================
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod clock;
mod config;
mod db;
mod error;
mod feed;
mod handler;
mod identity;
mod integrity;
mod membership;
mod models;
mod presence;
mod routes;
mod state;
mod store;
mod sweeper;
#[cfg(test)]
mod test_support;

use clock::SystemClock;
use config::Config;
use db::SqliteRoomStore;
use integrity::IntegrityEnforcer;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志记录
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "lobby_coordinator=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env()?;

    // 连接数据库并运行迁移
    tracing::info!("正在连接数据库: {}", config.database_url);
    let store = Arc::new(
        SqliteRoomStore::connect(
            &config.database_url,
            config.db_max_connections,
            config.change_feed_capacity,
        )
        .await?,
    );
    tracing::info!("数据库就绪");

    let clock = Arc::new(SystemClock);

    // 完整性守护需要在任何写入之前订阅变更
    let enforcer = Arc::new(IntegrityEnforcer::new(store.clone(), clock.clone(), &config));
    let _enforcer_task = enforcer.start();

    // 创建共享的应用状态
    let app_state = Arc::new(AppState::new(store, clock, config.clone()));

    // 启动定时清理服务
    let _sweeper_task = app_state.sweeper.clone().start_periodic_sweep();

    let app = routes::router(app_state);

    // 启动服务器
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::debug!("服务器正在监听于 {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("服务器已关闭");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("无法监听关闭信号: {}", e);
        std::future::pending::<()>().await;
    }
}
