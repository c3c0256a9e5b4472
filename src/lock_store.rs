//! 锁状态的 JSON 持久化。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::atomic::write_atomic;
use crate::webdav_lock::Lock;

const LOCK_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    version: u32,
    /// Keyed by lock token.
    locks: BTreeMap<String, Lock>,
}

#[derive(Debug, Clone)]
pub struct LockStore {
    path: PathBuf,
}

impl LockStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部锁记录；文件不存在时返回空。
    pub async fn load(&self) -> io::Result<Vec<Lock>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let file: LockFile = serde_json::from_slice(&raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        if file.version != LOCK_FILE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported lock file version {}", file.version),
            ));
        }
        Ok(file.locks.into_values().collect())
    }

    /// 原子地替换锁文件。
    pub async fn save(&self, locks: &[Lock]) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let file = LockFile {
            version: LOCK_FILE_VERSION,
            locks: locks
                .iter()
                .map(|lock| (lock.token.clone(), lock.clone()))
                .collect(),
        };
        let contents = serde_json::to_vec_pretty(&file)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        write_atomic(&self.path, &contents).await
    }

    /// 删除锁文件（如存在）。
    pub async fn reset(&self) -> io::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
