// ====================================================================================
// src/config.rs - 配置管理
// ====================================================================================
use crate::presence::{PresenceRule, StalenessPolicy};
use crate::store::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub bind_address: String,
    pub admin_api_key: Option<String>,
    pub max_connections: u32,

    // 房间容量与在线检测
    pub max_players: usize,
    pub presence_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub staleness_policy: StalenessPolicy,

    // 清理任务
    pub sweep_interval_seconds: u64,
    pub sweep_concurrency: usize,

    // 乐观事务重试
    pub txn_max_attempts: u32,
    pub txn_retry_base_delay_ms: u64,
    pub txn_retry_max_delay_ms: u64,

    pub change_feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            db_max_connections: 10,
            bind_address: "0.0.0.0:3000".to_string(),
            admin_api_key: None,
            max_connections: 10_000,
            max_players: 4,
            presence_timeout_seconds: 30,
            heartbeat_interval_seconds: 5,
            staleness_policy: StalenessPolicy::Silence,
            sweep_interval_seconds: 60,
            sweep_concurrency: 8,
            txn_max_attempts: 5,
            txn_retry_base_delay_ms: 20,
            txn_retry_max_delay_ms: 500,
            change_feed_capacity: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // 尝试加载 .env 文件，如果失败则忽略（可能文件不存在）
        if let Err(e) = dotenvy::dotenv() {
            tracing::warn!("Failed to load .env file: {}", e);
        }

        let defaults = Self::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            max_connections: env_or("MAX_CONNECTIONS", defaults.max_connections)?,

            max_players: capacity_or("MAX_PLAYERS", std::env::var("MAX_PLAYERS").ok(), defaults.max_players)?,
            presence_timeout_seconds: env_or("PRESENCE_TIMEOUT_SECONDS", defaults.presence_timeout_seconds)?,
            heartbeat_interval_seconds: env_or("HEARTBEAT_INTERVAL_SECONDS", defaults.heartbeat_interval_seconds)?,
            staleness_policy: env_or("STALENESS_POLICY", defaults.staleness_policy)?,

            sweep_interval_seconds: env_or("SWEEP_INTERVAL_SECONDS", defaults.sweep_interval_seconds)?,
            sweep_concurrency: env_or("SWEEP_CONCURRENCY", defaults.sweep_concurrency)?,

            txn_max_attempts: env_or("TXN_MAX_ATTEMPTS", defaults.txn_max_attempts)?,
            txn_retry_base_delay_ms: env_or("TXN_RETRY_BASE_DELAY_MS", defaults.txn_retry_base_delay_ms)?,
            txn_retry_max_delay_ms: env_or("TXN_RETRY_MAX_DELAY_MS", defaults.txn_retry_max_delay_ms)?,

            change_feed_capacity: env_or("CHANGE_FEED_CAPACITY", defaults.change_feed_capacity)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.txn_max_attempts.max(1),
            base_delay: Duration::from_millis(self.txn_retry_base_delay_ms),
            max_delay: Duration::from_millis(self.txn_retry_max_delay_ms),
        }
    }

    pub fn presence_rule(&self) -> PresenceRule {
        PresenceRule::new(
            Duration::from_secs(self.presence_timeout_seconds),
            self.staleness_policy,
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    parse_or(key, std::env::var(key).ok(), default)
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

// 房间容量至少为 1，否则创建者本身就会违反容量约束
fn capacity_or(key: &'static str, raw: Option<String>, default: usize) -> Result<usize, ConfigError> {
    let capacity = parse_or(key, raw.clone(), default)?;
    if capacity == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw.unwrap_or_default(),
        });
    }
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_keys_use_defaults() {
        assert_eq!(parse_or("MAX_PLAYERS", None, 4usize).unwrap(), 4);
        assert_eq!(parse_or("MAX_PLAYERS", Some(" 6 ".into()), 4usize).unwrap(), 6);
    }

    #[test]
    fn malformed_values_are_reported() {
        let err = parse_or("SWEEP_INTERVAL_SECONDS", Some("soon".into()), 60u64).unwrap_err();
        assert_eq!(err.to_string(), "SWEEP_INTERVAL_SECONDS has invalid value 'soon'");
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = capacity_or("MAX_PLAYERS", Some("0".into()), 4).unwrap_err();
        assert_eq!(err.to_string(), "MAX_PLAYERS has invalid value '0'");
        assert_eq!(capacity_or("MAX_PLAYERS", Some("2".into()), 4).unwrap(), 2);
        assert_eq!(capacity_or("MAX_PLAYERS", None, 4).unwrap(), 4);
    }

    #[test]
    fn staleness_policy_is_configurable() {
        let policy = parse_or("STALENESS_POLICY", Some("active-exempt".into()), StalenessPolicy::Silence).unwrap();
        assert_eq!(policy, StalenessPolicy::ActiveExempt);
    }

    #[test]
    fn derived_settings() {
        let config = Config { txn_max_attempts: 0, ..Config::default() };
        assert_eq!(config.retry_policy().max_attempts, 1);
        assert_eq!(config.presence_rule().timeout_millis(), 30_000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }
}
