//! 本地目录实现的节点存储：为路径分配稳定的不透明 uid。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::{
    ByteRange, ByteStream, FOLDER_MIME_TYPE, Node, NodeKind, NodeUid, RemoteNodeStore,
    StoreError, validate_name,
};
use crate::atomic::{AtomicFile, TEMP_PREFIX};

const ROOT_UID: &str = "root";

/// uid 与相对路径的双向映射。
#[derive(Debug, Default)]
struct IdTable {
    by_uid: HashMap<NodeUid, PathBuf>,
    by_path: HashMap<PathBuf, NodeUid>,
}

impl IdTable {
    fn uid_for(&mut self, relative: &Path) -> NodeUid {
        if relative.as_os_str().is_empty() {
            return NodeUid::new(ROOT_UID);
        }
        if let Some(uid) = self.by_path.get(relative) {
            return uid.clone();
        }
        let uid = NodeUid::new(Uuid::new_v4().to_string());
        self.by_uid.insert(uid.clone(), relative.to_path_buf());
        self.by_path.insert(relative.to_path_buf(), uid.clone());
        uid
    }

    fn path_of(&self, uid: &NodeUid) -> Option<PathBuf> {
        if uid.as_str() == ROOT_UID {
            return Some(PathBuf::new());
        }
        self.by_uid.get(uid).cloned()
    }

    /// 将 `from` 及其子路径整体重映射到 `to`。
    fn relocate(&mut self, from: &Path, to: &Path) {
        let moved: Vec<(NodeUid, PathBuf)> = self
            .by_uid
            .iter()
            .filter(|(_, path)| path.starts_with(from))
            .map(|(uid, path)| {
                let rest = path.strip_prefix(from).unwrap_or(Path::new(""));
                (uid.clone(), to.join(rest))
            })
            .collect();
        for (uid, new_path) in moved {
            if let Some(old_path) = self.by_uid.insert(uid.clone(), new_path.clone()) {
                self.by_path.remove(&old_path);
            }
            self.by_path.insert(new_path, uid);
        }
    }

    fn forget(&mut self, prefix: &Path) {
        self.by_uid.retain(|_, path| !path.starts_with(prefix));
        self.by_path.retain(|path, _| !path.starts_with(prefix));
    }
}

/// 基于本地目录的 [`RemoteNodeStore`]。
#[derive(Debug)]
pub struct LocalNodeStore {
    root: PathBuf,
    ids: Mutex<IdTable>,
}

impl LocalNodeStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ids: Mutex::new(IdTable::default()),
        }
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn ids(&self) -> Result<std::sync::MutexGuard<'_, IdTable>, StoreError> {
        self.ids
            .lock()
            .map_err(|_| StoreError::Io("id table poisoned".into()))
    }

    fn relative_of(&self, uid: &NodeUid) -> Result<PathBuf, StoreError> {
        self.ids()?
            .path_of(uid)
            .ok_or_else(|| StoreError::NotFound(uid.to_string()))
    }

    /// 将 `uid` 解析为绝对路径，途经符号链接时拒绝。
    async fn absolute_of(&self, uid: &NodeUid) -> Result<PathBuf, StoreError> {
        let relative = self.relative_of(uid)?;
        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component.as_os_str());
            let metadata = fs::symlink_metadata(&current)
                .await
                .map_err(|err| map_io(err, uid))?;
            if metadata.file_type().is_symlink() {
                return Err(StoreError::NotFound(uid.to_string()));
            }
        }
        Ok(current)
    }

    async fn folder_path(&self, uid: &NodeUid) -> Result<(PathBuf, PathBuf), StoreError> {
        let absolute = self.absolute_of(uid).await?;
        let metadata = fs::metadata(&absolute)
            .await
            .map_err(|err| map_io(err, uid))?;
        if !metadata.is_dir() {
            return Err(StoreError::NotAFolder(uid.to_string()));
        }
        Ok((self.relative_of(uid)?, absolute))
    }
}

fn map_io(err: std::io::Error, subject: impl std::fmt::Display) -> StoreError {
    match err.kind() {
        ErrorKind::NotFound => StoreError::NotFound(subject.to_string()),
        ErrorKind::AlreadyExists => StoreError::AlreadyExists(subject.to_string()),
        _ => StoreError::Io(err.to_string()),
    }
}

fn node_from_metadata(
    uid: NodeUid,
    name: String,
    parent_uid: Option<NodeUid>,
    metadata: &std::fs::Metadata,
) -> Node {
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    let created = metadata
        .created()
        .map(DateTime::from)
        .unwrap_or(modified);
    let (kind, size, mime_type) = if metadata.is_dir() {
        (NodeKind::Folder, 0, FOLDER_MIME_TYPE.to_string())
    } else {
        (
            NodeKind::File,
            metadata.len(),
            mime_guess::from_path(&name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        )
    };
    Node {
        uid,
        name,
        kind,
        size,
        mime_type,
        created_at: created,
        modified_at: modified,
        parent_uid,
    }
}

#[async_trait]
impl RemoteNodeStore for LocalNodeStore {
    async fn root_uid(&self) -> Result<NodeUid, StoreError> {
        Ok(NodeUid::new(ROOT_UID))
    }

    async fn list_folder(&self, folder: &NodeUid) -> Result<Vec<Node>, StoreError> {
        let (relative, absolute) = self.folder_path(folder).await?;
        let mut dir = fs::read_dir(&absolute).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let metadata = entry.metadata().await?;
            let uid = self.ids()?.uid_for(&relative.join(&name));
            entries.push(node_from_metadata(
                uid,
                name,
                Some(folder.clone()),
                &metadata,
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_folder(&self, parent: &NodeUid, name: &str) -> Result<NodeUid, StoreError> {
        validate_name(name)?;
        let (relative, absolute) = self.folder_path(parent).await?;
        fs::create_dir(absolute.join(name))
            .await
            .map_err(|err| map_io(err, name))?;
        Ok(self.ids()?.uid_for(&relative.join(name)))
    }

    async fn upload_file(
        &self,
        parent: &NodeUid,
        name: &str,
        mut content: ByteStream,
        _size_hint: Option<u64>,
    ) -> Result<NodeUid, StoreError> {
        validate_name(name)?;
        let (relative, absolute) = self.folder_path(parent).await?;
        let target = absolute.join(name);
        if let Ok(metadata) = fs::symlink_metadata(&target).await
            && !metadata.is_file()
        {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let write_result: Result<(), StoreError> = async {
            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(|err| StoreError::Transfer(err.to_string()))?;
                if !chunk.is_empty() {
                    atomic.write_all(&chunk).await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(err) = write_result {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await?;
        Ok(self.ids()?.uid_for(&relative.join(name)))
    }

    async fn download_file(&self, uid: &NodeUid) -> Result<ByteStream, StoreError> {
        let absolute = self.absolute_of(uid).await?;
        let file = File::open(&absolute)
            .await
            .map_err(|err| map_io(err, uid))?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn download_range(
        &self,
        uid: &NodeUid,
        range: ByteRange,
    ) -> Result<ByteStream, StoreError> {
        let absolute = self.absolute_of(uid).await?;
        let mut file = File::open(&absolute)
            .await
            .map_err(|err| map_io(err, uid))?;
        file.seek(SeekFrom::Start(range.start)).await?;
        Ok(ReaderStream::new(file.take(range.len())).boxed())
    }

    async fn delete_node(&self, uid: &NodeUid) -> Result<(), StoreError> {
        let relative = self.relative_of(uid)?;
        if relative.as_os_str().is_empty() {
            return Err(StoreError::InvalidName("cannot delete root".into()));
        }
        let absolute = self.absolute_of(uid).await?;
        let metadata = fs::metadata(&absolute)
            .await
            .map_err(|err| map_io(err, uid))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&absolute).await?;
        } else {
            fs::remove_file(&absolute).await?;
        }
        self.ids()?.forget(&relative);
        Ok(())
    }

    async fn rename_node(&self, uid: &NodeUid, new_name: &str) -> Result<(), StoreError> {
        validate_name(new_name)?;
        let relative = self.relative_of(uid)?;
        let Some(parent) = relative.parent() else {
            return Err(StoreError::InvalidName("cannot rename root".into()));
        };
        let destination = parent.join(new_name);
        let absolute = self.absolute_of(uid).await?;
        let target = self.root.join(&destination);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StoreError::AlreadyExists(new_name.to_string()));
        }
        fs::rename(&absolute, &target).await?;
        self.ids()?.relocate(&relative, &destination);
        Ok(())
    }

    async fn move_node(&self, uid: &NodeUid, new_parent: &NodeUid) -> Result<(), StoreError> {
        let relative = self.relative_of(uid)?;
        let Some(name) = relative.file_name().map(|name| name.to_os_string()) else {
            return Err(StoreError::InvalidName("cannot move root".into()));
        };
        let (parent_relative, parent_absolute) = self.folder_path(new_parent).await?;
        if parent_relative.starts_with(&relative) {
            return Err(StoreError::InvalidName(
                "cannot move a folder into itself".into(),
            ));
        }
        let absolute = self.absolute_of(uid).await?;
        let target = parent_absolute.join(&name);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StoreError::AlreadyExists(name.to_string_lossy().to_string()));
        }
        fs::rename(&absolute, &target).await?;
        self.ids()?.relocate(&relative, &parent_relative.join(&name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::TryStreamExt;
    use futures_util::stream;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, LocalNodeStore) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, LocalNodeStore::new(root))
    }

    fn body(content: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(content))]).boxed()
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .expect("read stream")
    }

    #[tokio::test]
    async fn uid_survives_rename_and_move() {
        let (_temp, store) = make_store();
        let root = store.root_uid().await.expect("root");
        let docs = store.create_folder(&root, "docs").await.expect("mkdir");
        let archive = store.create_folder(&root, "archive").await.expect("mkdir");
        let file = store
            .upload_file(&docs, "a.txt", body(b"hello"), Some(5))
            .await
            .expect("upload");

        store.rename_node(&file, "b.txt").await.expect("rename");
        store.move_node(&docs, &archive).await.expect("move");

        let docs_listing = store.list_folder(&docs).await.expect("list");
        assert_eq!(docs_listing.len(), 1);
        assert_eq!(docs_listing[0].uid, file);
        assert_eq!(docs_listing[0].name, "b.txt");
        assert!(store.root_path().join("archive/docs/b.txt").exists());
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_no_temp_file() {
        let (_temp, store) = make_store();
        let root = store.root_uid().await.expect("root");
        let stalled: ByteStream = stream::iter(vec![Ok(Bytes::from_static(b"first chunk"))])
            .chain(stream::pending())
            .boxed();

        let upload = store.upload_file(&root, "stalled.bin", stalled, None);
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(200), upload).await;
        assert!(outcome.is_err());

        let entries: Vec<String> = std::fs::read_dir(store.root_path())
            .expect("read root")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert!(entries.is_empty(), "unexpected entries: {entries:?}");
    }

    #[tokio::test]
    async fn ranged_download_seeks() {
        let (_temp, store) = make_store();
        let root = store.root_uid().await.expect("root");
        let file = store
            .upload_file(
                &root,
                "alpha.txt",
                body(b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789"),
                Some(36),
            )
            .await
            .expect("upload");
        let stream = store
            .download_range(&file, ByteRange { start: 26, end: 35 })
            .await
            .expect("download");
        assert_eq!(read_all(stream).await, b"0123456789");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn listing_skips_symlinks() {
        use std::os::unix::fs::symlink;

        let (temp, store) = make_store();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, store.root_path().join("link")).expect("symlink");

        let root = store.root_uid().await.expect("root");
        let listing = store.list_folder(&root).await.expect("list");
        assert!(listing.is_empty());
    }
}
