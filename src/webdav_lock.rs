//! WebDAV 锁管理：独占/共享、深度传播、超时清理与持久化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::lock_store::LockStore;
use crate::path::DavPath;

pub const LOCK_TOKEN_SCHEME: &str = "opaquelocktoken:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockDepth {
    Zero,
    Infinity,
}

/// 一个生效中的 WebDAV 锁。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub token: String,
    pub path: DavPath,
    pub owner: Option<String>,
    pub scope: LockScope,
    pub depth: LockDepth,
    pub timeout_secs: u64,
    pub expires_at: DateTime<Utc>,
    /// 被锁资源尚未创建时置位。
    pub provisional: bool,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// 锁是否作用于 `path`（自身或深度无限祖先）。
    pub fn covers(&self, path: &DavPath) -> bool {
        self.path == *path || (self.depth == LockDepth::Infinity && self.path.is_ancestor_of(path))
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

/// 创建新锁的 `LOCK` 请求参数。
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub path: DavPath,
    pub owner: Option<String>,
    pub timeout: Duration,
    pub scope: LockScope,
    pub depth: LockDepth,
    pub provisional: bool,
}

#[derive(Debug, Default)]
struct LockState {
    locks: HashMap<String, Lock>,
}

/// 每个服务实例持有一个锁管理器。
#[derive(Debug)]
pub struct LockManager {
    state: Mutex<LockState>,
    store: Option<LockStore>,
}

impl LockManager {
    /// 仅保存在内存中，重启后不保留。
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            store: None,
        }
    }

    /// 从 `store` 加载持久化的锁，丢弃离线期间已过期的锁。
    pub async fn load(store: LockStore) -> io::Result<Self> {
        let now = Utc::now();
        let mut locks = HashMap::new();
        let mut expired = 0usize;
        for lock in store.load().await? {
            if lock.is_expired(now) {
                expired += 1;
                continue;
            }
            locks.insert(lock.token.clone(), lock);
        }
        info!(active = locks.len(), expired, "restored webdav locks");
        let manager = Self {
            state: Mutex::new(LockState { locks }),
            store: Some(store),
        };
        if expired > 0 {
            let state = manager.state.lock().await;
            manager.persist(&state).await;
        }
        Ok(manager)
    }

    /// 创建锁；冲突时返回与之冲突的现有锁。
    #[allow(clippy::result_large_err)]
    pub async fn create_lock(&self, request: LockRequest) -> Result<Lock, Lock> {
        let mut state = self.state.lock().await;
        state.prune_expired();
        if let Some(conflict) = state.find_conflict(&request) {
            debug!(path = %request.path, token = conflict.token, "lock conflict");
            return Err(conflict.clone());
        }

        let mut token = new_token();
        while state.locks.contains_key(&token) {
            token = new_token();
        }
        let now = Utc::now();
        let lock = Lock {
            token: token.clone(),
            path: request.path,
            owner: request.owner,
            scope: request.scope,
            depth: request.depth,
            timeout_secs: request.timeout.as_secs(),
            expires_at: now + chrono_duration(request.timeout),
            provisional: request.provisional,
        };
        state.locks.insert(token, lock.clone());
        self.persist(&state).await;
        info!(path = %lock.path, token = lock.token, scope = ?lock.scope, depth = ?lock.depth, "lock created");
        Ok(lock)
    }

    /// 若 `token` 对应的锁覆盖 `path`，则延长其有效期。
    pub async fn refresh_lock(&self, path: &DavPath, token: &str, timeout: Duration) -> Option<Lock> {
        let mut state = self.state.lock().await;
        state.prune_expired();
        let lock = state.locks.get_mut(token).filter(|lock| lock.covers(path))?;
        lock.timeout_secs = timeout.as_secs();
        lock.expires_at = Utc::now() + chrono_duration(timeout);
        let lock = lock.clone();
        self.persist(&state).await;
        debug!(path = %path, token, "lock refreshed");
        Some(lock)
    }

    /// 令牌对应的活动锁是否覆盖 `path`。
    pub async fn validate_token(&self, path: &DavPath, token: &str) -> bool {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .locks
            .get(token)
            .is_some_and(|lock| !lock.is_expired(now) && lock.covers(path))
    }

    /// 按令牌查找活动锁。
    pub async fn get_lock(&self, token: &str) -> Option<Lock> {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .locks
            .get(token)
            .filter(|lock| !lock.is_expired(now))
            .cloned()
    }

    /// 移除锁；没有该令牌对应的有效锁时返回 false。
    pub async fn delete_lock(&self, token: &str) -> bool {
        let mut state = self.state.lock().await;
        state.prune_expired();
        let removed = state.locks.remove(token).is_some();
        if removed {
            self.persist(&state).await;
            info!(token, "lock removed");
        }
        removed
    }

    /// 检查凭提交的令牌能否写入 `path`。
    ///
    /// `deep` 时还检查 `path` 之下的锁（集合的 DELETE 与 MOVE）。
    #[allow(clippy::result_large_err)]
    pub async fn check_write(
        &self,
        path: &DavPath,
        deep: bool,
        submitted_tokens: &[String],
    ) -> Result<(), Lock> {
        let mut state = self.state.lock().await;
        state.prune_expired();
        let holds = |lock: &Lock| submitted_tokens.iter().any(|token| *token == lock.token);

        let covering: Vec<&Lock> = state
            .locks
            .values()
            .filter(|lock| lock.covers(path) || (deep && path.is_ancestor_of(&lock.path)))
            .collect();
        let holds_shared = covering
            .iter()
            .any(|lock| lock.scope == LockScope::Shared && holds(lock));
        for lock in covering {
            if holds(lock) {
                continue;
            }
            if lock.scope == LockScope::Shared && holds_shared {
                continue;
            }
            return Err(lock.clone());
        }
        Ok(())
    }

    /// 作用于 `path` 的所有活动锁（用于 lockdiscovery）。
    pub async fn get_locks_for_path(&self, path: &DavPath) -> Vec<Lock> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut locks: Vec<Lock> = state
            .locks
            .values()
            .filter(|lock| !lock.is_expired(now) && lock.covers(path))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.path.segments().len().cmp(&b.path.segments().len()));
        locks
    }

    pub async fn get_all_locks(&self) -> Vec<Lock> {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .locks
            .values()
            .filter(|lock| !lock.is_expired(now))
            .cloned()
            .collect()
    }

    /// `path` 处的资源已创建，其临时锁转为普通锁。
    pub async fn confirm_provisional(&self, path: &DavPath) {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for lock in state.locks.values_mut() {
            if lock.provisional && lock.path == *path {
                lock.provisional = false;
                changed = true;
            }
        }
        if changed {
            self.persist(&state).await;
        }
    }

    /// 若 `token` 仍为临时锁则移除。
    pub async fn discard_provisional(&self, token: &str) -> bool {
        let mut state = self.state.lock().await;
        let is_provisional = state.locks.get(token).is_some_and(|lock| lock.provisional);
        if !is_provisional {
            return false;
        }
        state.locks.remove(token);
        self.persist(&state).await;
        info!(token, "provisional lock discarded");
        true
    }

    /// 删除 `path` 及其子路径上的所有锁（资源被删除或移走后调用）。
    pub async fn remove_tree(&self, path: &DavPath) -> usize {
        let mut state = self.state.lock().await;
        let before = state.locks.len();
        state.locks.retain(|_, lock| !lock.path.starts_with(path));
        let removed = before - state.locks.len();
        if removed > 0 {
            self.persist(&state).await;
        }
        removed
    }

    /// 清理过期锁，返回清理数量。
    pub async fn prune_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.prune_expired();
        if removed > 0 {
            self.persist(&state).await;
        }
        removed
    }

    async fn persist(&self, state: &LockState) {
        let Some(store) = &self.store else {
            return;
        };
        let locks: Vec<Lock> = state.locks.values().cloned().collect();
        if let Err(err) = store.save(&locks).await {
            error!(error = %err, path = ?store.path(), "failed to persist webdav locks");
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockState {
    fn prune_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.locks.len();
        self.locks.retain(|_, lock| !lock.is_expired(now));
        before - self.locks.len()
    }

    fn find_conflict(&self, request: &LockRequest) -> Option<&Lock> {
        self.locks.values().find(|lock| {
            let overlaps = lock.covers(&request.path)
                || (request.depth == LockDepth::Infinity && request.path.is_ancestor_of(&lock.path));
            overlaps && !(lock.scope == LockScope::Shared && request.scope == LockScope::Shared)
        })
    }
}

fn new_token() -> String {
    format!("{LOCK_TOKEN_SCHEME}{}", Uuid::new_v4())
}

fn chrono_duration(timeout: Duration) -> chrono::Duration {
    chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn path(value: &str) -> DavPath {
        DavPath::parse(value).expect("path")
    }

    fn request(value: &str, scope: LockScope, depth: LockDepth) -> LockRequest {
        LockRequest {
            path: path(value),
            owner: Some("tester".into()),
            timeout: Duration::from_secs(600),
            scope,
            depth,
            provisional: false,
        }
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_second_lock() {
        let manager = LockManager::new();
        manager
            .create_lock(request("/a.txt", LockScope::Exclusive, LockDepth::Zero))
            .await
            .expect("first lock");
        let result = manager
            .create_lock(request("/a.txt", LockScope::Exclusive, LockDepth::Zero))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shared_locks_coexist() {
        let manager = LockManager::new();
        for _ in 0..2 {
            manager
                .create_lock(request("/a.txt", LockScope::Shared, LockDepth::Zero))
                .await
                .expect("shared lock");
        }
        let result = manager
            .create_lock(request("/a.txt", LockScope::Exclusive, LockDepth::Zero))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn depth_infinity_covers_descendants() {
        let manager = LockManager::new();
        let lock = manager
            .create_lock(request("/parent", LockScope::Exclusive, LockDepth::Infinity))
            .await
            .expect("lock");
        let child = path("/parent/child.txt");
        assert!(manager.check_write(&child, false, &[]).await.is_err());
        assert!(manager.check_write(&child, false, &[lock.token.clone()]).await.is_ok());
        assert!(manager.validate_token(&child, &lock.token).await);
        assert!(manager.check_write(&path("/parent2/x"), false, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn depth_infinity_lock_conflicts_with_locked_descendant() {
        let manager = LockManager::new();
        manager
            .create_lock(request("/parent/child.txt", LockScope::Exclusive, LockDepth::Zero))
            .await
            .expect("child lock");
        let result = manager
            .create_lock(request("/parent", LockScope::Exclusive, LockDepth::Infinity))
            .await;
        assert!(result.is_err());
        let shallow = manager
            .create_lock(request("/parent", LockScope::Exclusive, LockDepth::Zero))
            .await;
        assert!(shallow.is_ok());
    }

    #[tokio::test]
    async fn deep_check_sees_descendant_locks() {
        let manager = LockManager::new();
        manager
            .create_lock(request("/dir/file.txt", LockScope::Exclusive, LockDepth::Zero))
            .await
            .expect("lock");
        assert!(manager.check_write(&path("/dir"), false, &[]).await.is_ok());
        assert!(manager.check_write(&path("/dir"), true, &[]).await.is_err());
    }

    #[tokio::test]
    async fn deleted_token_is_gone() {
        let manager = LockManager::new();
        let lock = manager
            .create_lock(request("/a", LockScope::Exclusive, LockDepth::Zero))
            .await
            .expect("lock");
        assert!(lock.token.starts_with(LOCK_TOKEN_SCHEME));
        assert!(manager.delete_lock(&lock.token).await);
        assert!(!manager.delete_lock(&lock.token).await);
        assert!(!manager.validate_token(&path("/a"), &lock.token).await);
    }

    #[tokio::test]
    async fn expired_locks_are_treated_as_absent() {
        let manager = LockManager::new();
        let mut req = request("/a", LockScope::Exclusive, LockDepth::Zero);
        req.timeout = Duration::ZERO;
        manager.create_lock(req).await.expect("lock");
        assert!(manager.check_write(&path("/a"), false, &[]).await.is_ok());
        assert!(manager.get_all_locks().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_creates_only_one_wins() {
        let manager = Arc::new(LockManager::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .create_lock(request("/race", LockScope::Exclusive, LockDepth::Infinity))
                    .await
                    .is_ok()
            }));
        }
        let mut wins = 0;
        for task in tasks {
            if task.await.expect("join") {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn provisional_locks_can_be_discarded_until_confirmed() {
        let manager = LockManager::new();
        let mut req = request("/new.txt", LockScope::Exclusive, LockDepth::Zero);
        req.provisional = true;
        let first = manager.create_lock(req.clone()).await.expect("lock");
        assert!(manager.discard_provisional(&first.token).await);

        let second = manager.create_lock(req).await.expect("lock");
        manager.confirm_provisional(&path("/new.txt")).await;
        assert!(!manager.discard_provisional(&second.token).await);
        assert!(manager.get_lock(&second.token).await.is_some());
    }

    #[tokio::test]
    async fn locks_survive_restart() {
        let temp = tempdir().expect("tempdir");
        let file = temp.path().join("locks.json");
        let token = {
            let manager = LockManager::load(LockStore::new(file.clone()))
                .await
                .expect("load");
            manager
                .create_lock(request("/keep", LockScope::Exclusive, LockDepth::Infinity))
                .await
                .expect("lock")
                .token
        };

        let restored = LockManager::load(LockStore::new(file)).await.expect("reload");
        assert!(restored.validate_token(&path("/keep/inner"), &token).await);
    }
}
