//! 过期锁、缓存条目与登录失败记录的定期清理。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::{AuthConfig, prune_login_attempts};
use crate::cache::MetadataCache;
use crate::config::MAINTENANCE_INTERVAL_SECS;
use crate::webdav_lock::LockManager;

/// 启动后台清理任务。
pub fn spawn_background_tasks(
    locks: Arc<LockManager>,
    cache: Arc<MetadataCache>,
    auth: Option<Arc<AuthConfig>>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let expired_locks = locks.prune_expired().await;
            let expired_entries = cache.prune_expired();
            if expired_locks > 0 || expired_entries > 0 {
                debug!(expired_locks, expired_entries, "maintenance sweep");
            }
            if let Some(auth) = &auth {
                prune_login_attempts(auth).await;
            }
        }
    });
}
