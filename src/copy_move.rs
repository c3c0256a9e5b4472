//! COPY / MOVE 前置条件检查与执行。

use axum::http::{HeaderMap, StatusCode};
use tracing::info;

use crate::adapter::ResourceAdapter;
use crate::error::DavError;
use crate::headers::{parse_destination, parse_overwrite};
use crate::path::DavPath;
use crate::store::Node;
use crate::webdav_lock::LockManager;

/// 已通过全部前置条件检查的 COPY 或 MOVE。
#[derive(Debug, Clone)]
pub struct Transfer {
    pub source: DavPath,
    pub dest: DavPath,
    pub overwrite: bool,
    pub source_node: Node,
    /// 当前位于 `dest` 的节点，执行时会被替换。
    pub replaced: Option<Node>,
}

/// 按顺序检查 Destination、源、Overwrite、目标位置与目标现状。
pub async fn check_transfer(
    adapter: &ResourceAdapter,
    source: &DavPath,
    headers: &HeaderMap,
    prefix: &str,
    assume_overwrite: bool,
) -> Result<Transfer, DavError> {
    let dest = parse_destination(headers, prefix)?;
    let source_node = adapter.stat(source).await?;
    let overwrite = parse_overwrite(headers, assume_overwrite)?;

    if dest.starts_with(source) {
        return Err(DavError::Forbidden(format!(
            "destination {dest} is {source} or inside it"
        )));
    }

    let dest_parent = dest.parent().unwrap_or_else(DavPath::root);
    match adapter.resolver().try_resolve(&dest_parent).await? {
        Some(parent) if parent.is_folder() => {}
        Some(_) => {
            return Err(DavError::Conflict(format!(
                "destination parent {dest_parent} is not a collection"
            )));
        }
        None => {
            return Err(DavError::Conflict(format!(
                "destination parent {dest_parent} does not exist"
            )));
        }
    }

    let replaced = adapter.resolver().try_resolve(&dest).await?;
    if let Some(existing) = &replaced {
        if existing.is_folder() && !adapter.list(&dest).await?.is_empty() {
            return Err(DavError::Forbidden(format!(
                "destination {dest} is a non-empty collection"
            )));
        }
        if !overwrite {
            return Err(DavError::PreconditionFailed(format!(
                "destination {dest} exists and Overwrite is F"
            )));
        }
    }

    Ok(Transfer {
        source: source.clone(),
        dest,
        overwrite,
        source_node,
        replaced,
    })
}

/// 执行已检查的 MOVE：替换了已有资源返回 204，否则返回 201。
pub async fn execute_move(
    adapter: &ResourceAdapter,
    locks: &LockManager,
    transfer: &Transfer,
) -> Result<StatusCode, DavError> {
    if transfer.replaced.is_some() {
        adapter.remove(&transfer.dest).await?;
        locks.remove_tree(&transfer.dest).await;
    }
    adapter.move_to(&transfer.source, &transfer.dest).await?;
    let dropped = locks.remove_tree(&transfer.source).await;
    info!(
        source = %transfer.source,
        dest = %transfer.dest,
        replaced = transfer.replaced.is_some(),
        dropped_locks = dropped,
        "move finished"
    );
    Ok(if transfer.replaced.is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    })
}

/// COPY 在通过全部前置检查后交给适配层，后者总是拒绝。
pub async fn execute_copy(adapter: &ResourceAdapter, transfer: &Transfer) -> Result<StatusCode, DavError> {
    adapter.copy(&transfer.source, &transfer.dest).await?;
    Ok(StatusCode::CREATED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::MetadataCache;
    use crate::resolver::PathResolver;
    use crate::store::MemoryNodeStore;

    async fn fixture() -> ResourceAdapter {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_file("a.txt", b"aaa").await;
        store.seed_file("b.txt", b"bbb").await;
        store.seed_file("full/inner.txt", b"x").await;
        store.seed_folder("empty").await;
        store.seed_folder("dir/sub").await;
        let cache = Arc::new(MetadataCache::new(Duration::from_secs(30), 0));
        ResourceAdapter::new(Arc::new(PathResolver::new(store, cache, DavPath::root())))
    }

    fn headers(dest: &'static str, overwrite: Option<&'static str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("destination", HeaderValue::from_static(dest));
        if let Some(value) = overwrite {
            map.insert("overwrite", HeaderValue::from_static(value));
        }
        map
    }

    fn path(value: &str) -> DavPath {
        DavPath::parse(value).expect("path")
    }

    async fn check(
        adapter: &ResourceAdapter,
        source: &str,
        dest: &'static str,
        overwrite: Option<&'static str>,
    ) -> Result<Transfer, DavError> {
        check_transfer(adapter, &path(source), &headers(dest, overwrite), "", false).await
    }

    #[tokio::test]
    async fn existing_destination_without_overwrite_is_412() {
        let adapter = fixture().await;
        let result = check(&adapter, "/a.txt", "/b.txt", Some("F")).await;
        assert!(matches!(result, Err(DavError::PreconditionFailed(_))));
        let result = check(&adapter, "/a.txt", "/b.txt", None).await;
        assert!(matches!(result, Err(DavError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn copy_checks_run_before_unsupported() {
        let adapter = fixture().await;
        let result = check(&adapter, "/a.txt", "/b.txt", Some("F")).await;
        assert!(matches!(result, Err(DavError::PreconditionFailed(_))));

        let transfer = check(&adapter, "/a.txt", "/c.txt", None).await.expect("checks");
        let result = execute_copy(&adapter, &transfer).await;
        assert!(matches!(result, Err(DavError::Unsupported(_))));
    }

    #[tokio::test]
    async fn non_empty_collection_destination_is_403() {
        let adapter = fixture().await;
        let result = check(&adapter, "/a.txt", "/full", Some("T")).await;
        assert!(matches!(result, Err(DavError::Forbidden(_))));
    }

    #[tokio::test]
    async fn destination_inside_source_is_403() {
        let adapter = fixture().await;
        let result = check(&adapter, "/dir", "/dir/sub/moved", Some("T")).await;
        assert!(matches!(result, Err(DavError::Forbidden(_))));
        let result = check(&adapter, "/dir", "/dir", Some("T")).await;
        assert!(matches!(result, Err(DavError::Forbidden(_))));
    }

    #[tokio::test]
    async fn missing_source_and_parent() {
        let adapter = fixture().await;
        let result = check(&adapter, "/ghost.txt", "/x.txt", None).await;
        assert!(matches!(result, Err(DavError::NotFound(_))));
        let result = check(&adapter, "/a.txt", "/nowhere/x.txt", None).await;
        assert!(matches!(result, Err(DavError::Conflict(_))));
        let result = check(&adapter, "/a.txt", "/b.txt/x.txt", None).await;
        assert!(matches!(result, Err(DavError::Conflict(_))));
    }

    #[tokio::test]
    async fn move_reports_created_or_replaced() {
        let adapter = fixture().await;
        let locks = LockManager::new();

        let transfer = check(&adapter, "/a.txt", "/c.txt", None).await.expect("checks");
        let status = execute_move(&adapter, &locks, &transfer).await.expect("move");
        assert_eq!(status, StatusCode::CREATED);

        let transfer = check(&adapter, "/c.txt", "/b.txt", Some("T")).await.expect("checks");
        let status = execute_move(&adapter, &locks, &transfer).await.expect("move");
        assert_eq!(status, StatusCode::NO_CONTENT);
        let node = adapter.stat(&path("/b.txt")).await.expect("stat");
        assert_eq!(node.size, 3);
        assert!(!adapter.exists(&path("/c.txt")).await.expect("exists"));
    }

    #[tokio::test]
    async fn empty_collection_can_be_replaced() {
        let adapter = fixture().await;
        let transfer = check(&adapter, "/a.txt", "/empty", Some("T")).await.expect("checks");
        assert!(transfer.replaced.is_some());
        let status = execute_move(&adapter, &LockManager::new(), &transfer)
            .await
            .expect("move");
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!adapter.stat(&path("/empty")).await.expect("stat").is_folder());
    }

    #[tokio::test]
    async fn assume_overwrite_changes_default() {
        let adapter = fixture().await;
        let transfer = check_transfer(&adapter, &path("/a.txt"), &headers("/b.txt", None), "", true)
            .await
            .expect("checks");
        assert!(transfer.overwrite);
    }
}
