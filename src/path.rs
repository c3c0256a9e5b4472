//! 客户端可见路径：规范化、祖先关系与 href 编码。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DavError;

/// 规范化且已百分号解码的资源路径，例如 `/a/b.txt`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct DavPath {
    segments: Vec<String>,
}

impl DavPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// 解析请求 URL 路径（已去除挂载前缀），逐段做百分号解码。
    pub fn parse(raw: &str) -> Result<Self, DavError> {
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            if segment.is_empty() {
                continue;
            }
            let decoded = urlencoding::decode(segment)
                .map_err(|_| DavError::InvalidRequest("path is not valid UTF-8".into()))?;
            match decoded.as_ref() {
                "." => continue,
                ".." => return Err(DavError::InvalidRequest("relative path segment".into())),
                value if value.contains(['/', '\\', '\0']) => {
                    return Err(DavError::InvalidRequest("invalid path segment".into()));
                }
                value => segments.push(value.to_string()),
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// 最后一段名称；根路径返回 `None`。
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<DavPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: &str) -> DavPath {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    /// `self` 等于 `other` 或位于其下时为真。
    pub fn starts_with(&self, other: &DavPath) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// `self` 是 `other` 的严格祖先时为真。
    pub fn is_ancestor_of(&self, other: &DavPath) -> bool {
        other.segments.len() > self.segments.len() && other.starts_with(self)
    }

    /// 所有严格祖先，由近及远，以根结束。
    pub fn ancestors(&self) -> impl Iterator<Item = DavPath> + '_ {
        (0..self.segments.len()).rev().map(|len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// 生成带挂载前缀、逐段编码的 href；集合以 `/` 结尾。
    pub fn href(&self, prefix: &str, collection: bool) -> String {
        let mut href = prefix.trim_end_matches('/').to_string();
        for segment in &self.segments {
            href.push('/');
            href.push_str(&urlencoding::encode(segment));
        }
        if collection || self.is_root() {
            href.push('/');
        }
        href
    }
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl From<DavPath> for String {
    fn from(path: DavPath) -> Self {
        path.to_string()
    }
}

/// 从已解码的规范形式（如持久化的锁记录）恢复路径。
impl From<String> for DavPath {
    fn from(value: String) -> Self {
        Self {
            segments: value
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// 将配置的挂载前缀规范化为 `""` 或 `/segment[/segment]`。
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// 去除挂载前缀；不在挂载点下的路径返回 `None`。
pub fn strip_mount<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
