//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// 写入中临时文件的前缀，目录列举时会跳过。
pub const TEMP_PREFIX: &str = ".axo-tmp.";

/// 可用于原子替换的临时文件封装。
///
/// 未完成 `finalize` 即被丢弃时（例如请求被取消），临时文件会被删除。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory")
        })?;
        let temp_path = parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file: Some(file),
            finished: false,
        })
    }

    /// 追加写入一段数据。
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data).await,
            None => Err(io::Error::other("temp file already closed")),
        }
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.temp_path).await;
        self.finished = true;
    }

    /// 同步并原子替换目标文件；失败时临时文件由 `Drop` 清理。
    pub async fn finalize(mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().await?;
        }

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    fs::rename(&self.temp_path, &self.target).await?;
                    self.finished = true;
                    return Ok(());
                }
            }
            return Err(err);
        }
        self.finished = true;

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        if let Err(err) = std::fs::remove_file(&self.temp_path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.temp_path.display(), error = %err, "temp file left behind");
        }
    }
}

/// 一次性原子写入整个文件内容。
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = AtomicFile::new(target).await?;
    if let Err(err) = file.write_all(contents).await {
        file.cleanup().await;
        return Err(err);
    }
    file.finalize().await
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
