//! 资源适配层：把 WebDAV 资源操作映射到 `RemoteNodeStore` 调用。

use futures_util::{StreamExt, stream};
use std::io;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::DavError;
use crate::path::DavPath;
use crate::resolver::PathResolver;
use crate::store::{ByteRange, ByteStream, Node, NodeUid, RemoteNodeStore};

/// 一次打开的读取：节点、实际返回的字节区间，以及恰好输出该长度的字节流。
pub struct ReadHandle {
    pub node: Node,
    pub range: Option<ByteRange>,
    pub length: u64,
    pub stream: ByteStream,
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub created: bool,
    pub node: Node,
}

pub struct ResourceAdapter {
    resolver: Arc<PathResolver>,
}

impl ResourceAdapter {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    fn store(&self) -> &Arc<dyn RemoteNodeStore> {
        self.resolver.store()
    }

    pub async fn exists(&self, path: &DavPath) -> Result<bool, DavError> {
        Ok(self.resolver.try_resolve(path).await?.is_some())
    }

    pub async fn stat(&self, path: &DavPath) -> Result<Node, DavError> {
        self.resolver.resolve(path).await
    }

    /// 列出集合的直接子节点；文件没有子节点。
    pub async fn list(&self, path: &DavPath) -> Result<Arc<Vec<Node>>, DavError> {
        let node = self.resolver.resolve(path).await?;
        if !node.is_folder() {
            return Ok(Arc::new(Vec::new()));
        }
        self.resolver.list_children(&node).await
    }

    /// 将容纳 `path` 的目录；父级不存在或不是目录时返回冲突。
    async fn writable_parent(&self, path: &DavPath) -> Result<Node, DavError> {
        let parent = match self.resolver.resolve_parent(path).await {
            Ok(parent) => parent,
            Err(DavError::NotFound(_)) => {
                return Err(DavError::Conflict(format!("parent of {path} does not exist")));
            }
            Err(err) => return Err(err),
        };
        if !parent.is_folder() {
            return Err(DavError::Conflict(format!("parent of {path} is not a collection")));
        }
        Ok(parent)
    }

    fn leaf_name(path: &DavPath) -> Result<&str, DavError> {
        path.name()
            .ok_or_else(|| DavError::Forbidden("the root cannot be modified".into()))
    }

    /// 创建集合或空文件。
    pub async fn create(&self, path: &DavPath, is_collection: bool) -> Result<Node, DavError> {
        if path.is_root() {
            return Err(DavError::MethodNotAllowed("the root already exists".into()));
        }
        let parent = self.writable_parent(path).await?;
        let name = Self::leaf_name(path)?;
        if self.resolver.try_resolve(path).await?.is_some() {
            return Err(DavError::MethodNotAllowed(format!("{path} already exists")));
        }

        if is_collection {
            self.store().create_folder(&parent.uid, name).await?;
        } else {
            let empty: ByteStream = stream::empty().boxed();
            self.store()
                .upload_file(&parent.uid, name, empty, Some(0))
                .await?;
        }
        self.resolver.invalidate(path, &parent);
        info!(path = %path, collection = is_collection, "resource created");
        self.resolver.resolve(path).await
    }

    /// 打开读取流；`range` 需已按节点大小校验。
    ///
    /// 返回的流恰好输出 `length` 字节：上游提前结束时以错误收尾并使该节点的缓存失效。
    pub async fn open_read(
        &self,
        path: &DavPath,
        range: Option<ByteRange>,
    ) -> Result<ReadHandle, DavError> {
        let node = self.resolver.resolve(path).await?;
        if node.is_folder() {
            return Err(DavError::NotFound(format!("{path} is a collection")));
        }
        let (raw, length) = match range {
            Some(range) => {
                if range.start > range.end || range.end >= node.size {
                    return Err(DavError::RangeNotSatisfiable(node.size));
                }
                (self.store().download_range(&node.uid, range).await?, range.len())
            }
            None => (self.store().download_file(&node.uid).await?, node.size),
        };
        let stream = exact_length(BoundedRead {
            inner: raw,
            remaining: length,
            resolver: self.resolver.clone(),
            path: path.clone(),
            parent: node.parent_uid.clone(),
        });
        Ok(ReadHandle {
            node,
            range,
            length,
            stream,
        })
    }

    /// 将 `content` 流式写入 `path` 处的文件，不存在则创建，存在则覆盖。
    pub async fn open_write(
        &self,
        path: &DavPath,
        content: ByteStream,
        expected_size: Option<u64>,
    ) -> Result<WriteOutcome, DavError> {
        let parent = self.writable_parent(path).await?;
        let name = Self::leaf_name(path)?;
        let existing = self.resolver.try_resolve(path).await?;
        if existing.as_ref().is_some_and(Node::is_folder) {
            return Err(DavError::MethodNotAllowed(format!("{path} is a collection")));
        }

        let result = self
            .store()
            .upload_file(&parent.uid, name, content, expected_size)
            .await;
        self.resolver.invalidate(path, &parent);
        result?;

        let node = self.resolver.resolve(path).await?;
        info!(path = %path, size = node.size, created = existing.is_none(), "resource written");
        Ok(WriteOutcome {
            created: existing.is_none(),
            node,
        })
    }

    /// 删除资源（集合连同其子树）。
    pub async fn remove(&self, path: &DavPath) -> Result<(), DavError> {
        if path.is_root() {
            return Err(DavError::Forbidden("the root cannot be deleted".into()));
        }
        let node = self.resolver.resolve(path).await?;
        let parent = self.resolver.resolve_parent(path).await?;
        self.store().delete_node(&node.uid).await?;
        self.resolver.invalidate(path, &parent);
        info!(path = %path, uid = %node.uid, "resource removed");
        Ok(())
    }

    /// 将 `source` 移动到 `dest`；`dest` 的父目录必须存在，`dest` 本身必须不存在。
    ///
    /// 同一父目录下只做重命名；否则先移动节点，名称变化时再重命名。
    /// 若重命名失败，节点会以旧名称留在新父目录下。
    pub async fn move_to(&self, source: &DavPath, dest: &DavPath) -> Result<(), DavError> {
        let node = self.resolver.resolve(source).await?;
        let source_parent = self.resolver.resolve_parent(source).await?;
        let dest_parent = self.writable_parent(dest).await?;
        let dest_name = Self::leaf_name(dest)?;

        if source_parent.uid == dest_parent.uid {
            if node.name != dest_name {
                let result = self.store().rename_node(&node.uid, dest_name).await;
                self.resolver.invalidate(source, &source_parent);
                self.resolver.invalidate(dest, &dest_parent);
                result?;
            }
        } else {
            let moved = self.store().move_node(&node.uid, &dest_parent.uid).await;
            self.resolver.invalidate(source, &source_parent);
            self.resolver.invalidate(dest, &dest_parent);
            moved?;

            if node.name != dest_name {
                let interim = dest_parent_path(dest).join(&node.name);
                self.resolver.invalidate(&interim, &dest_parent);
                if let Err(err) = self.store().rename_node(&node.uid, dest_name).await {
                    warn!(
                        uid = %node.uid,
                        source = %source,
                        left_at = %interim,
                        wanted = %dest,
                        error = %err,
                        "move completed but rename failed"
                    );
                    return Err(err.into());
                }
                self.resolver.invalidate(&interim, &dest_parent);
                self.resolver.invalidate(dest, &dest_parent);
            }
        }
        info!(source = %source, dest = %dest, uid = %node.uid, "resource moved");
        Ok(())
    }

    /// 远端存储不支持服务端复制。
    pub async fn copy(&self, source: &DavPath, dest: &DavPath) -> Result<(), DavError> {
        Err(DavError::Unsupported(format!("COPY {source} -> {dest}")))
    }
}

fn dest_parent_path(dest: &DavPath) -> DavPath {
    dest.parent().unwrap_or_else(DavPath::root)
}

struct BoundedRead {
    inner: ByteStream,
    remaining: u64,
    resolver: Arc<PathResolver>,
    path: DavPath,
    parent: Option<NodeUid>,
}

/// 截断多余字节；不足 `remaining` 即结束时返回 `UnexpectedEof`。
fn exact_length(read: BoundedRead) -> ByteStream {
    stream::unfold(Some(read), |state| async move {
        let mut state = state?;
        if state.remaining == 0 {
            return None;
        }
        match state.inner.next().await {
            Some(Ok(chunk)) => {
                let take = (chunk.len() as u64).min(state.remaining) as usize;
                state.remaining -= take as u64;
                Some((Ok(chunk.slice(..take)), Some(state)))
            }
            Some(Err(err)) => Some((Err(err), None)),
            None => {
                warn!(
                    path = %state.path,
                    missing = state.remaining,
                    "backend content shorter than its metadata"
                );
                let cache = state.resolver.cache();
                cache.invalidate_path(&state.path);
                if let Some(parent) = &state.parent {
                    cache.invalidate_listing(parent);
                }
                Some((
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} ended {} bytes early", state.path, state.remaining),
                    )),
                    None,
                ))
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::TryStreamExt;
    use std::time::Duration;

    use crate::cache::MetadataCache;
    use crate::store::{LocalNodeStore, MemoryNodeStore, StoreError};

    fn path(value: &str) -> DavPath {
        DavPath::parse(value).expect("path")
    }

    fn adapter_over(store: Arc<dyn RemoteNodeStore>) -> ResourceAdapter {
        let cache = Arc::new(MetadataCache::new(Duration::from_secs(60), 0));
        let resolver = Arc::new(PathResolver::new(store, cache, DavPath::root()));
        ResourceAdapter::new(resolver)
    }

    fn body(data: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    async fn read_all(handle: ReadHandle) -> Vec<u8> {
        let chunks: Vec<Bytes> = handle.stream.try_collect().await.expect("read");
        chunks.concat()
    }

    #[tokio::test]
    async fn write_then_stat_sees_new_size() {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_file("doc.txt", b"old").await;
        let adapter = adapter_over(store);

        assert_eq!(adapter.stat(&path("/doc.txt")).await.expect("stat").size, 3);
        let outcome = adapter
            .open_write(&path("/doc.txt"), body(b"newer content"), Some(13))
            .await
            .expect("write");
        assert!(!outcome.created);
        assert_eq!(adapter.stat(&path("/doc.txt")).await.expect("stat").size, 13);
        let listed = adapter.list(&DavPath::root()).await.expect("list");
        assert_eq!(listed[0].size, 13);
    }

    #[tokio::test]
    async fn write_into_missing_parent_conflicts() {
        let adapter = adapter_over(Arc::new(MemoryNodeStore::new()));
        let result = adapter.open_write(&path("/nope/a.txt"), body(b"x"), None).await;
        assert!(matches!(result, Err(DavError::Conflict(_))));
    }

    #[tokio::test]
    async fn create_rules() {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_file("file.txt", b"x").await;
        let adapter = adapter_over(store);

        let folder = adapter.create(&path("/new"), true).await.expect("mkcol");
        assert!(folder.is_folder());
        assert!(matches!(
            adapter.create(&path("/new"), true).await,
            Err(DavError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            adapter.create(&path("/missing/child"), true).await,
            Err(DavError::Conflict(_))
        ));
        assert!(matches!(
            adapter.create(&path("/file.txt/child"), true).await,
            Err(DavError::Conflict(_))
        ));
        let empty = adapter.create(&path("/new/empty.bin"), false).await.expect("create");
        assert_eq!(empty.size, 0);
    }

    #[tokio::test]
    async fn ranged_read_matches_reported_length() {
        let store = Arc::new(MemoryNodeStore::new());
        store
            .seed_file("alpha.txt", b"abcdefghijklmnopqrstuvwxyz0123456789")
            .await;
        let adapter = adapter_over(store);

        let handle = adapter
            .open_read(&path("/alpha.txt"), Some(ByteRange { start: 10, end: 19 }))
            .await
            .expect("open");
        assert_eq!(handle.length, 10);
        assert_eq!(read_all(handle).await, b"klmnopqrst");

        let result = adapter
            .open_read(&path("/alpha.txt"), Some(ByteRange { start: 30, end: 40 }))
            .await;
        assert!(matches!(result, Err(DavError::RangeNotSatisfiable(36))));
    }

    #[tokio::test]
    async fn folders_cannot_be_read() {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_folder("dir").await;
        let adapter = adapter_over(store);
        assert!(matches!(
            adapter.open_read(&path("/dir"), None).await,
            Err(DavError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn move_across_parents_with_rename() {
        let store = Arc::new(MemoryNodeStore::new());
        let uid = store.seed_file("a/one.txt", b"1").await;
        store.seed_folder("b").await;
        let adapter = adapter_over(store);

        adapter.stat(&path("/a/one.txt")).await.expect("warm cache");
        adapter
            .move_to(&path("/a/one.txt"), &path("/b/two.txt"))
            .await
            .expect("move");
        assert!(!adapter.exists(&path("/a/one.txt")).await.expect("exists"));
        assert_eq!(adapter.stat(&path("/b/two.txt")).await.expect("stat").uid, uid);
    }

    #[tokio::test]
    async fn remove_drops_cached_entries() {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_file("dir/inner.txt", b"1").await;
        let adapter = adapter_over(store);

        adapter.stat(&path("/dir/inner.txt")).await.expect("warm cache");
        adapter.remove(&path("/dir")).await.expect("remove");
        assert!(!adapter.exists(&path("/dir")).await.expect("exists"));
        assert!(!adapter.exists(&path("/dir/inner.txt")).await.expect("exists"));
        assert!(matches!(
            adapter.remove(&DavPath::root()).await,
            Err(DavError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn copy_is_unsupported() {
        let adapter = adapter_over(Arc::new(MemoryNodeStore::new()));
        let result = adapter.copy(&path("/a"), &path("/b")).await;
        assert!(matches!(result, Err(DavError::Unsupported(_))));
    }

    /// Delegates to a memory store but fails every rename.
    struct RenameFails(MemoryNodeStore);

    #[async_trait]
    impl RemoteNodeStore for RenameFails {
        async fn root_uid(&self) -> Result<NodeUid, StoreError> {
            self.0.root_uid().await
        }
        async fn list_folder(&self, folder: &NodeUid) -> Result<Vec<Node>, StoreError> {
            self.0.list_folder(folder).await
        }
        async fn create_folder(&self, parent: &NodeUid, name: &str) -> Result<NodeUid, StoreError> {
            self.0.create_folder(parent, name).await
        }
        async fn upload_file(
            &self,
            parent: &NodeUid,
            name: &str,
            content: ByteStream,
            size_hint: Option<u64>,
        ) -> Result<NodeUid, StoreError> {
            self.0.upload_file(parent, name, content, size_hint).await
        }
        async fn download_file(&self, uid: &NodeUid) -> Result<ByteStream, StoreError> {
            self.0.download_file(uid).await
        }
        async fn delete_node(&self, uid: &NodeUid) -> Result<(), StoreError> {
            self.0.delete_node(uid).await
        }
        async fn rename_node(&self, _: &NodeUid, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Transfer("rename rejected".into()))
        }
        async fn move_node(&self, uid: &NodeUid, new_parent: &NodeUid) -> Result<(), StoreError> {
            self.0.move_node(uid, new_parent).await
        }
    }

    #[tokio::test]
    async fn failed_rename_after_move_is_visible() {
        let inner = MemoryNodeStore::new();
        inner.seed_file("a/one.txt", b"1").await;
        inner.seed_folder("b").await;
        let adapter = adapter_over(Arc::new(RenameFails(inner)));

        adapter.list(&path("/b")).await.expect("warm listing");
        let result = adapter.move_to(&path("/a/one.txt"), &path("/b/two.txt")).await;
        assert!(matches!(result, Err(DavError::Backend(_))));
        assert!(adapter.exists(&path("/b/one.txt")).await.expect("exists"));
        assert!(!adapter.exists(&path("/a/one.txt")).await.expect("exists"));
    }

    #[tokio::test]
    async fn short_backend_read_fails_and_drops_cached_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LocalNodeStore::new(temp.path().to_path_buf());
        let adapter = adapter_over(Arc::new(store));
        let payload: &'static [u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        adapter
            .open_write(&path("/alpha.txt"), body(payload), Some(36))
            .await
            .expect("write");
        assert_eq!(adapter.stat(&path("/alpha.txt")).await.expect("stat").size, 36);

        std::fs::write(temp.path().join("alpha.txt"), &payload[..10]).expect("truncate");

        let handle = adapter.open_read(&path("/alpha.txt"), None).await.expect("open");
        assert_eq!(handle.length, 36);
        let result: Result<Vec<Bytes>, _> = handle.stream.try_collect().await;
        let err = result.expect_err("short read must fail");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        assert_eq!(adapter.stat(&path("/alpha.txt")).await.expect("stat").size, 10);
    }

    #[tokio::test]
    async fn ranged_read_emits_exact_length() {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_file("alpha.txt", b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789").await;
        let adapter = adapter_over(store);
        let handle = adapter
            .open_read(&path("/alpha.txt"), Some(ByteRange { start: 10, end: 19 }))
            .await
            .expect("open");
        assert_eq!(handle.length, 10);
        assert_eq!(read_all(handle).await, b"KLMNOPQRST");
    }
}
