//! 路径解析：逐级列目录，把客户端路径映射到远端节点。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::cache::{CacheKey, CacheValue, MetadataCache};
use crate::error::DavError;
use crate::path::DavPath;
use crate::store::{FOLDER_MIME_TYPE, Node, NodeKind, RemoteNodeStore};

/// 借助元数据缓存将客户端路径映射到节点。
pub struct PathResolver {
    store: Arc<dyn RemoteNodeStore>,
    cache: Arc<MetadataCache>,
    /// 作为 `/` 对外提供的目录（相对存储根）。
    remote_path: DavPath,
    base: OnceCell<Node>,
    started_at: DateTime<Utc>,
}

impl PathResolver {
    pub fn new(
        store: Arc<dyn RemoteNodeStore>,
        cache: Arc<MetadataCache>,
        remote_path: DavPath,
    ) -> Self {
        Self {
            store,
            cache,
            remote_path,
            base: OnceCell::new(),
            started_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteNodeStore> {
        &self.store
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// 被挂载为 `/` 的节点。
    async fn base(&self) -> Result<Node, DavError> {
        self.base
            .get_or_try_init(|| async {
                let root_uid = self.store.root_uid().await?;
                let mut current = Node {
                    uid: root_uid,
                    name: String::new(),
                    kind: NodeKind::Folder,
                    size: 0,
                    mime_type: FOLDER_MIME_TYPE.to_string(),
                    created_at: self.started_at,
                    modified_at: self.started_at,
                    parent_uid: None,
                };
                for segment in self.remote_path.segments() {
                    current = self.child_named(&current, segment).await?;
                    if !current.is_folder() {
                        return Err(DavError::NotFound(format!(
                            "remote path {} is not a folder",
                            self.remote_path
                        )));
                    }
                }
                Ok::<Node, DavError>(current)
            })
            .await
            .cloned()
    }

    /// 通过缓存列出目录子项；并发调用者共享同一次获取。
    pub async fn list_children(&self, folder: &Node) -> Result<Arc<Vec<Node>>, DavError> {
        let uid = folder.uid.clone();
        let value = self
            .cache
            .get_or_fetch(CacheKey::Listing(uid.clone()), || async move {
                let children = self.store.list_folder(&uid).await?;
                Ok(CacheValue::Listing(Arc::new(children)))
            })
            .await?;
        match value {
            CacheValue::Listing(children) => Ok(children),
            CacheValue::Node(_) => Err(DavError::Internal(format!(
                "cache returned a node for listing:{}",
                folder.uid
            ))),
        }
    }

    async fn child_named(&self, folder: &Node, name: &str) -> Result<Node, DavError> {
        let children = self.list_children(folder).await?;
        let mut matches = children.iter().filter(|child| child.name == name);
        let Some(found) = matches.next() else {
            return Err(DavError::NotFound(name.to_string()));
        };
        if matches.next().is_some() {
            error!(folder = %folder.uid, name, "duplicate sibling names in backend listing");
            self.cache.purge();
            return Err(DavError::Consistency(format!(
                "folder {} has more than one child named {name:?}",
                folder.uid
            )));
        }
        Ok(found.clone())
    }

    /// 将 `path` 解析为节点，不存在时返回 `NotFound`。
    pub async fn resolve(&self, path: &DavPath) -> Result<Node, DavError> {
        let key = CacheKey::Node(path.clone());
        if let Some(CacheValue::Node(node)) = self.cache.get(&key) {
            return Ok(node);
        }

        let generation = self.cache.generation();
        let mut current = self.base().await?;
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            if !current.is_folder() {
                return Err(DavError::NotFound(path.to_string()));
            }
            current = match self.child_named(&current, segment).await {
                Ok(node) => node,
                Err(DavError::NotFound(_)) => return Err(DavError::NotFound(path.to_string())),
                Err(err) => return Err(err),
            };
            debug!(segment, depth = index, uid = %current.uid, "resolved path segment");
        }

        self.cache
            .put_if_current(key, CacheValue::Node(current.clone()), generation);
        Ok(current)
    }

    /// 解析除最后一段以外的所有路径段；单段路径返回根。
    pub async fn resolve_parent(&self, path: &DavPath) -> Result<Node, DavError> {
        match path.parent() {
            Some(parent) => self.resolve(&parent).await,
            None => Err(DavError::Forbidden("the root has no parent".into())),
        }
    }

    /// `resolve`，但把 NotFound 转为 `None`。
    pub async fn try_resolve(&self, path: &DavPath) -> Result<Option<Node>, DavError> {
        match self.resolve(path).await {
            Ok(node) => Ok(Some(node)),
            Err(DavError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// 丢弃 `parent` 内 `path` 变更所涉及的缓存状态。
    pub fn invalidate(&self, path: &DavPath, parent: &Node) {
        self.cache.invalidate_listing(&parent.uid);
        self.cache.invalidate_path(path);
    }
}
