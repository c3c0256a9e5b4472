//! 元数据缓存：文件夹列表与单节点查询，带 TTL 与并发请求合并。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::path::DavPath;
use crate::store::{Node, NodeUid, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Listing(NodeUid),
    Node(DavPath),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Listing(uid) => write!(f, "listing:{uid}"),
            CacheKey::Node(path) => write!(f, "node:{path}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Listing(Arc<Vec<Node>>),
    Node(Node),
}

type FetchResult = Result<CacheValue, StoreError>;
type Flight = Arc<OnceCell<FetchResult>>;

#[derive(Debug)]
struct CacheEntry {
    value: CacheValue,
    inserted: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    inflight: HashMap<CacheKey, Flight>,
    /// 每次失效都会递增。
    generation: u64,
}

/// 带过期时间的元数据缓存，由单个服务实例持有。
#[derive(Debug)]
pub struct MetadataCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl MetadataCache {
    /// `ttl` 为 0 时禁用缓存；`max_entries` 为 0 表示不限条目数。
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        if !self.is_enabled() {
            return None;
        }
        let state = self.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.inserted.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: CacheKey, value: CacheValue) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        self.insert_locked(&mut state, key, value);
    }

    /// 当前失效代数；配合 [`MetadataCache::put_if_current`] 使用。
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// 仅当读取 `generation` 之后没有发生失效时才写入 `value`。
    pub fn put_if_current(&self, key: CacheKey, value: CacheValue, generation: u64) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        if state.generation == generation {
            self.insert_locked(&mut state, key, value);
        }
    }

    /// 返回 `key` 的缓存值；未命中时并发调用者共享同一次 `fetch`。
    ///
    /// 若获取期间该键被失效，结果仍交给等待者，但不会写入缓存。
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        if !self.is_enabled() {
            return fetch().await;
        }

        let flight = {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get(&key)
                && entry.inserted.elapsed() < self.ttl
            {
                return Ok(entry.value.clone());
            }
            state
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = flight.get_or_init(fetch).await.clone();

        let mut state = self.lock();
        let owns_flight = matches!(
            state.inflight.get(&key),
            Some(current) if Arc::ptr_eq(current, &flight)
        );
        if owns_flight {
            state.inflight.remove(&key);
            if let Ok(value) = &result {
                self.insert_locked(&mut state, key, value.clone());
            }
        }
        result
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut state = self.lock();
        state.entries.remove(key);
        state.inflight.remove(key);
        state.generation += 1;
    }

    pub fn invalidate_listing(&self, folder: &NodeUid) {
        self.invalidate(&CacheKey::Listing(folder.clone()));
    }

    /// 删除 `prefix` 本身及其下所有路径的节点条目。
    pub fn invalidate_prefix(&self, prefix: &DavPath) {
        let matches = |key: &CacheKey| matches!(key, CacheKey::Node(path) if path.starts_with(prefix));
        let mut state = self.lock();
        state.entries.retain(|key, _| !matches(key));
        state.inflight.retain(|key, _| !matches(key));
        state.generation += 1;
    }

    /// 移除 `path` 本身、其下所有路径及其全部祖先的节点条目。
    pub fn invalidate_path(&self, path: &DavPath) {
        self.invalidate_prefix(path);
        for ancestor in path.ancestors() {
            self.invalidate(&CacheKey::Node(ancestor));
        }
    }

    pub fn purge(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.inflight.clear();
        state.generation += 1;
    }

    /// 清理过期条目，返回清理数量。
    pub fn prune_expired(&self) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.inserted.elapsed() < self.ttl);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn insert_locked(&self, state: &mut CacheState, key: CacheKey, value: CacheValue) {
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
        if self.max_entries == 0 || state.entries.len() <= self.max_entries {
            return;
        }
        state
            .entries
            .retain(|_, entry| entry.inserted.elapsed() < self.ttl);
        while state.entries.len() > self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else {
                break;
            };
            debug!(key = %oldest, "evicting metadata cache entry");
            state.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::store::{FOLDER_MIME_TYPE, NodeKind};

    fn folder(name: &str) -> Node {
        Node {
            uid: NodeUid::new(name),
            name: name.to_string(),
            kind: NodeKind::Folder,
            size: 0,
            mime_type: FOLDER_MIME_TYPE.to_string(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
            parent_uid: Some(NodeUid::new("root")),
        }
    }

    fn node_key(path: &str) -> CacheKey {
        CacheKey::Node(DavPath::parse(path).expect("path"))
    }

    #[tokio::test]
    async fn concurrent_fetches_are_coalesced() {
        let cache = Arc::new(MetadataCache::new(Duration::from_secs(30), 0));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(CacheKey::Listing(NodeUid::new("root")), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(CacheValue::Listing(Arc::new(vec![folder("a")])))
                    })
                    .await
            }));
        }
        for task in tasks {
            let value = task.await.expect("join").expect("fetch");
            assert!(matches!(value, CacheValue::Listing(list) if list.len() == 1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_misses() {
        let cache = MetadataCache::new(Duration::ZERO, 0);
        cache.put(node_key("/a"), CacheValue::Node(folder("a")));
        assert!(cache.get(&node_key("/a")).is_none());

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_fetch(node_key("/a"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CacheValue::Node(folder("a")))
                })
                .await
                .expect("fetch");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = MetadataCache::new(Duration::from_secs(30), 0);
        let result = cache
            .get_or_fetch(node_key("/a"), || async {
                Err(StoreError::Transfer("timeout".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn invalidate_path_drops_descendants_and_ancestors() {
        let cache = MetadataCache::new(Duration::from_secs(30), 0);
        for path in ["/", "/a", "/a/b", "/a/b/c.txt", "/other"] {
            cache.put(node_key(path), CacheValue::Node(folder("x")));
        }
        cache.invalidate_path(&DavPath::parse("/a/b").expect("path"));
        assert!(cache.get(&node_key("/")).is_none());
        assert!(cache.get(&node_key("/a")).is_none());
        assert!(cache.get(&node_key("/a/b/c.txt")).is_none());
        assert!(cache.get(&node_key("/other")).is_some());
    }

    #[test]
    fn put_if_current_skips_after_invalidation() {
        let cache = MetadataCache::new(Duration::from_secs(30), 0);
        let generation = cache.generation();
        cache.invalidate(&node_key("/elsewhere"));
        cache.put_if_current(node_key("/a"), CacheValue::Node(folder("a")), generation);
        assert!(cache.get(&node_key("/a")).is_none());
    }

    #[test]
    fn purge_drops_everything() {
        let cache = MetadataCache::new(Duration::from_secs(30), 0);
        cache.put(node_key("/a"), CacheValue::Node(folder("a")));
        cache.put(node_key("/b"), CacheValue::Node(folder("b")));
        cache.purge();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn entry_cap_evicts_oldest() {
        let cache = MetadataCache::new(Duration::from_secs(30), 2);
        for name in ["a", "b", "c"] {
            cache.put(node_key(&format!("/{name}")), CacheValue::Node(folder(name)));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&node_key("/a")).is_none());
    }
}
