//! 进程内节点存储：用于测试与 `--backend memory`。

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::{
    ByteStream, FOLDER_MIME_TYPE, Node, NodeKind, NodeUid, RemoteNodeStore, StoreError,
    validate_name,
};

const ROOT_UID: &str = "root";

struct Entry {
    node: Node,
    content: Bytes,
}

/// 以 uid 为键的内存目录树，下载只支持整个对象。
pub struct MemoryNodeStore {
    entries: Mutex<HashMap<NodeUid, Entry>>,
    list_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        let now = Utc::now();
        let root = Node {
            uid: NodeUid::new(ROOT_UID),
            name: String::new(),
            kind: NodeKind::Folder,
            size: 0,
            mime_type: FOLDER_MIME_TYPE.to_string(),
            created_at: now,
            modified_at: now,
            parent_uid: None,
        };
        let mut entries = HashMap::new();
        entries.insert(
            root.uid.clone(),
            Entry {
                node: root,
                content: Bytes::new(),
            },
        );
        Self {
            entries: Mutex::new(entries),
            list_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
        }
    }

    /// `list_folder` 被调用的次数。
    pub fn list_folder_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// `download_file` 被调用的次数。
    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<NodeUid, Entry>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Io("memory store poisoned".into()))?;
        f(&mut entries)
    }
}

fn require_folder(entries: &HashMap<NodeUid, Entry>, uid: &NodeUid) -> Result<(), StoreError> {
    match entries.get(uid) {
        Some(entry) if entry.node.is_folder() => Ok(()),
        Some(_) => Err(StoreError::NotAFolder(uid.to_string())),
        None => Err(StoreError::NotFound(uid.to_string())),
    }
}

fn find_child<'a>(
    entries: &'a HashMap<NodeUid, Entry>,
    parent: &NodeUid,
    name: &str,
) -> Option<&'a Node> {
    entries
        .values()
        .map(|entry| &entry.node)
        .find(|node| node.parent_uid.as_ref() == Some(parent) && node.name == name)
}

fn collect_subtree(entries: &HashMap<NodeUid, Entry>, uid: &NodeUid, out: &mut Vec<NodeUid>) {
    out.push(uid.clone());
    let children: Vec<NodeUid> = entries
        .values()
        .filter(|entry| entry.node.parent_uid.as_ref() == Some(uid))
        .map(|entry| entry.node.uid.clone())
        .collect();
    for child in children {
        collect_subtree(entries, &child, out);
    }
}

#[async_trait]
impl RemoteNodeStore for MemoryNodeStore {
    async fn root_uid(&self) -> Result<NodeUid, StoreError> {
        Ok(NodeUid::new(ROOT_UID))
    }

    async fn list_folder(&self, folder: &NodeUid) -> Result<Vec<Node>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.with_entries(|entries| {
            require_folder(entries, folder)?;
            let mut children: Vec<Node> = entries
                .values()
                .filter(|entry| entry.node.parent_uid.as_ref() == Some(folder))
                .map(|entry| entry.node.clone())
                .collect();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(children)
        })
    }

    async fn create_folder(&self, parent: &NodeUid, name: &str) -> Result<NodeUid, StoreError> {
        validate_name(name)?;
        self.with_entries(|entries| {
            require_folder(entries, parent)?;
            if find_child(entries, parent, name).is_some() {
                return Err(StoreError::AlreadyExists(name.to_string()));
            }
            let now = Utc::now();
            let uid = NodeUid::new(Uuid::new_v4().to_string());
            let node = Node {
                uid: uid.clone(),
                name: name.to_string(),
                kind: NodeKind::Folder,
                size: 0,
                mime_type: FOLDER_MIME_TYPE.to_string(),
                created_at: now,
                modified_at: now,
                parent_uid: Some(parent.clone()),
            };
            entries.insert(
                uid.clone(),
                Entry {
                    node,
                    content: Bytes::new(),
                },
            );
            Ok(uid)
        })
    }

    async fn upload_file(
        &self,
        parent: &NodeUid,
        name: &str,
        mut content: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<NodeUid, StoreError> {
        validate_name(name)?;
        self.with_entries(|entries| require_folder(entries, parent))?;

        let mut buffer = BytesMut::with_capacity(size_hint.unwrap_or(0).min(1 << 20) as usize);
        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(|err| StoreError::Transfer(err.to_string()))?;
            buffer.extend_from_slice(&chunk);
        }
        let content = buffer.freeze();

        self.with_entries(|entries| {
            require_folder(entries, parent)?;
            let now = Utc::now();
            if let Some(existing) = find_child(entries, parent, name) {
                if existing.is_folder() {
                    return Err(StoreError::AlreadyExists(name.to_string()));
                }
                let uid = existing.uid.clone();
                if let Some(entry) = entries.get_mut(&uid) {
                    entry.node.size = content.len() as u64;
                    entry.node.modified_at = now;
                    entry.content = content;
                }
                return Ok(uid);
            }
            let uid = NodeUid::new(Uuid::new_v4().to_string());
            let node = Node {
                uid: uid.clone(),
                name: name.to_string(),
                kind: NodeKind::File,
                size: content.len() as u64,
                mime_type: mime_guess::from_path(name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
                created_at: now,
                modified_at: now,
                parent_uid: Some(parent.clone()),
            };
            entries.insert(uid.clone(), Entry { node, content });
            Ok(uid)
        })
    }

    async fn download_file(&self, uid: &NodeUid) -> Result<ByteStream, StoreError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.with_entries(|entries| match entries.get(uid) {
            Some(entry) if entry.node.is_folder() => {
                Err(StoreError::InvalidName(format!("{uid} is a folder")))
            }
            Some(entry) => Ok(entry.content.clone()),
            None => Err(StoreError::NotFound(uid.to_string())),
        })?;
        // 按 64 KiB 分块输出，模拟网络下载。
        let chunks: Vec<std::io::Result<Bytes>> = (0..content.len())
            .step_by(64 * 1024)
            .map(|start| Ok(content.slice(start..(start + 64 * 1024).min(content.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn delete_node(&self, uid: &NodeUid) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            let Some(entry) = entries.get(uid) else {
                return Err(StoreError::NotFound(uid.to_string()));
            };
            if entry.node.parent_uid.is_none() {
                return Err(StoreError::InvalidName("cannot delete root".into()));
            }
            let mut doomed = Vec::new();
            collect_subtree(entries, uid, &mut doomed);
            for uid in doomed {
                entries.remove(&uid);
            }
            Ok(())
        })
    }

    async fn rename_node(&self, uid: &NodeUid, new_name: &str) -> Result<(), StoreError> {
        validate_name(new_name)?;
        self.with_entries(|entries| {
            let parent = match entries.get(uid) {
                Some(entry) => entry.node.parent_uid.clone(),
                None => return Err(StoreError::NotFound(uid.to_string())),
            };
            let Some(parent) = parent else {
                return Err(StoreError::InvalidName("cannot rename root".into()));
            };
            if let Some(existing) = find_child(entries, &parent, new_name)
                && existing.uid != *uid
            {
                return Err(StoreError::AlreadyExists(new_name.to_string()));
            }
            if let Some(entry) = entries.get_mut(uid) {
                entry.node.name = new_name.to_string();
                entry.node.modified_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn move_node(&self, uid: &NodeUid, new_parent: &NodeUid) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            require_folder(entries, new_parent)?;
            let name = match entries.get(uid) {
                Some(entry) => entry.node.name.clone(),
                None => return Err(StoreError::NotFound(uid.to_string())),
            };
            let mut subtree = Vec::new();
            collect_subtree(entries, uid, &mut subtree);
            if subtree.contains(new_parent) {
                return Err(StoreError::InvalidName("cannot move a folder into itself".into()));
            }
            if find_child(entries, new_parent, &name).is_some() {
                return Err(StoreError::AlreadyExists(name));
            }
            if let Some(entry) = entries.get_mut(uid) {
                entry.node.parent_uid = Some(new_parent.clone());
            }
            Ok(())
        })
    }
}

/// 测试用的目录树预置工具。
#[cfg(test)]
impl MemoryNodeStore {
    /// 沿 `path`（不带前导斜杠）逐级创建目录，返回最后一级的 uid。
    pub async fn seed_folder(&self, path: &str) -> NodeUid {
        let mut current = NodeUid::new(ROOT_UID);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let existing = self
                .list_folder(&current)
                .await
                .expect("list seed folder")
                .into_iter()
                .find(|node| node.name == segment);
            current = match existing {
                Some(node) => node.uid,
                None => self
                    .create_folder(&current, segment)
                    .await
                    .expect("create seed folder"),
            };
        }
        current
    }

    /// 在 `path` 写入文件，按需创建父目录。
    pub async fn seed_file(&self, path: &str, content: &'static [u8]) -> NodeUid {
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (self.seed_folder(parent).await, name),
            None => (NodeUid::new(ROOT_UID), path),
        };
        let body = stream::iter(vec![Ok(Bytes::from_static(content))]).boxed();
        self.upload_file(&parent, name, body, Some(content.len() as u64))
            .await
            .expect("upload seed file")
    }
}
