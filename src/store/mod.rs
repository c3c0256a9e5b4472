//! 远端节点存储接口：以不透明 uid 寻址的文件/文件夹树。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

pub mod local;
pub mod memory;

pub use local::LocalNodeStore;
pub use memory::MemoryNodeStore;

/// 目录对外报告的 MIME 类型。
pub const FOLDER_MIME_TYPE: &str = "httpd/unix-directory";

/// 下载/上传使用的字节流。
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// 后端分配的节点标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUid(String);

impl NodeUid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// 远端文件或文件夹的元数据快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub uid: NodeUid,
    pub name: String,
    pub kind: NodeKind,
    /// 文件的精确字节数，目录恒为 0。
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// 仅存储根为 `None`。
    pub parent_uid: Option<NodeUid>,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// 闭区间字节范围 `start..=end`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("node already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid node name: {0}")]
    InvalidName(String),
    #[error("node is not a folder: {0}")]
    NotAFolder(String),
    #[error("backend i/o failure: {0}")]
    Io(String),
    #[error("backend transfer failed: {0}")]
    Transfer(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// WebDAV 层对远端网盘所需的最小原语集合。
///
/// 每个方法对应一次后端往返。实现按原样上报失败，重试策略（如有）放在该 trait 之后。
#[async_trait]
pub trait RemoteNodeStore: Send + Sync + 'static {
    /// 返回存储根目录的 uid。
    async fn root_uid(&self) -> Result<NodeUid, StoreError>;

    /// 列出文件夹的直接子节点。
    async fn list_folder(&self, folder: &NodeUid) -> Result<Vec<Node>, StoreError>;

    /// 在父目录下创建文件夹。
    async fn create_folder(&self, parent: &NodeUid, name: &str) -> Result<NodeUid, StoreError>;

    /// 以 `name` 为名将 `content` 上传到 `parent` 下。
    ///
    /// 已存在同名文件时替换其内容并保留 uid。
    async fn upload_file(
        &self,
        parent: &NodeUid,
        name: &str,
        content: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<NodeUid, StoreError>;

    /// 下载完整文件内容。
    async fn download_file(&self, uid: &NodeUid) -> Result<ByteStream, StoreError>;

    /// 只下载 `range` 指定的部分。
    ///
    /// 默认实现下载整个对象并丢弃区间外的字节；支持随机读取的存储应覆盖此方法。
    async fn download_range(
        &self,
        uid: &NodeUid,
        range: ByteRange,
    ) -> Result<ByteStream, StoreError> {
        let full = self.download_file(uid).await?;
        Ok(slice_stream(full, range))
    }

    async fn delete_node(&self, uid: &NodeUid) -> Result<(), StoreError>;

    async fn rename_node(&self, uid: &NodeUid, new_name: &str) -> Result<(), StoreError>;

    async fn move_node(&self, uid: &NodeUid, new_parent: &NodeUid) -> Result<(), StoreError>;
}

/// 从完整字节流中截取 `range`，到达范围末尾后立即停止读取上游。
pub fn slice_stream(inner: ByteStream, range: ByteRange) -> ByteStream {
    let start = range.start;
    let end = range.end.saturating_add(1);
    stream::unfold((inner, 0u64), move |(mut inner, mut offset)| async move {
        if offset >= end {
            return None;
        }
        loop {
            match inner.next().await? {
                Err(err) => return Some((Err(err), (inner, end))),
                Ok(chunk) => {
                    let chunk_start = offset;
                    let chunk_end = offset + chunk.len() as u64;
                    offset = chunk_end;
                    if chunk_end <= start {
                        continue;
                    }
                    let from = (start.saturating_sub(chunk_start)) as usize;
                    let to = (end.min(chunk_end) - chunk_start) as usize;
                    if from >= to {
                        continue;
                    }
                    return Some((Ok(chunk.slice(from..to)), (inner, offset)));
                }
            }
        }
    })
    .boxed()
}

/// 校验节点名称：非空，且不含路径分隔符或相对路径片段。
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
