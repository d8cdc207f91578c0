//! 数据后端：文件字节的存取。
//!
//! `FileBackend` 把字节落到本地磁盘，`StreamBackend` 不做任何持久化，
//! 只在上传方与唯一的下载方之间转发。`DataBackends` 按上传模式选择后端。

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::models::{File, Upload};

pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("file `{0}` not found in data backend")]
    NotFound(String),
    #[error("invalid storage identifier `{0}`")]
    InvalidId(String),
    #[error("stream `{0}` was closed before any download")]
    Unclaimed(String),
    #[error("no data backend configured for {0:?} mode")]
    Unavailable(StorageMode),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DataResult<T> = Result<T, DataError>;

#[async_trait]
pub trait DataBackend: Send + Sync {
    /// 持续读取 `reader` 直到结束或出错。读取出错时不得保留任何数据。
    async fn add_file(&self, file: &File, reader: DataReader) -> DataResult<()>;

    async fn get_file(&self, file: &File) -> DataResult<DataReader>;

    /// 文件不存在时不应报错。
    async fn remove_file(&self, file: &File) -> DataResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageMode {
    Normal,
    Stream,
}

impl StorageMode {
    pub fn of(upload: &Upload) -> Self {
        if upload.stream {
            StorageMode::Stream
        } else {
            StorageMode::Normal
        }
    }
}

/// 按上传模式索引的数据后端集合。
#[derive(Clone, Default)]
pub struct DataBackends {
    backends: HashMap<StorageMode, Arc<dyn DataBackend>>,
}

impl DataBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mode: StorageMode, backend: Arc<dyn DataBackend>) -> Self {
        self.backends.insert(mode, backend);
        self
    }

    pub fn for_mode(&self, mode: StorageMode) -> DataResult<Arc<dyn DataBackend>> {
        self.backends
            .get(&mode)
            .cloned()
            .ok_or(DataError::Unavailable(mode))
    }

    pub fn for_upload(&self, upload: &Upload) -> DataResult<Arc<dyn DataBackend>> {
        self.for_mode(StorageMode::of(upload))
    }

}

/// 本地磁盘数据后端，文件位于 `root/{upload 前两位}/{upload}/{file}`。
#[derive(Clone, Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, file: &File) -> DataResult<PathBuf> {
        ensure_safe_id(&file.upload_id)?;
        ensure_safe_id(&file.id)?;
        let shard: String = file.upload_id.chars().take(2).collect();
        Ok(self
            .root
            .join(shard)
            .join(&file.upload_id)
            .join(&file.id))
    }
}

/// 先写入同目录下的 `.part` 文件，完整落盘后再改名，失败时不留下半截文件。
async fn store_file(path: &Path, reader: &mut DataReader) -> io::Result<u64> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".part");
    let staged = PathBuf::from(staged);

    let result = async {
        let mut handle = fs::File::create(&staged).await?;
        let written = tokio::io::copy(reader, &mut handle).await?;
        handle.sync_all().await?;
        drop(handle);
        fs::rename(&staged, path).await?;
        Ok::<_, io::Error>(written)
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&staged).await;
    }
    result
}

fn ensure_safe_id(id: &str) -> DataResult<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DataError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl DataBackend for FileBackend {
    async fn add_file(&self, file: &File, mut reader: DataReader) -> DataResult<()> {
        let path = self.file_path(file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let written = store_file(&path, &mut reader).await?;
        debug!(path = ?path, bytes = written, "file stored");
        Ok(())
    }

    async fn get_file(&self, file: &File) -> DataResult<DataReader> {
        let path = self.file_path(file)?;
        match fs::File::open(&path).await {
            Ok(handle) => Ok(Box::new(handle)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(DataError::NotFound(file.id.clone()))
            }
            Err(err) => Err(DataError::Io(err)),
        }
    }

    async fn remove_file(&self, file: &File) -> DataResult<()> {
        let path = self.file_path(file)?;
        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = ?path, "removed physical file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "file already missing");
            }
            Err(err) => return Err(DataError::Io(err)),
        }

        // 上传目录为空时顺带清理，非空或失败都忽略。
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

/// 流式数据后端：`add_file` 先等待唯一的下载方领取读端，再把数据直接转发给它。
pub struct StreamBackend {
    pending: Mutex<HashMap<String, PendingStream>>,
    buffer_size: usize,
}

/// 等待下载方领取的读端，领取时通过 `claimed` 唤醒上传方。
struct PendingStream {
    downstream: DuplexStream,
    claimed: oneshot::Sender<()>,
}

impl StreamBackend {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            buffer_size,
        }
    }

    fn key(file: &File) -> String {
        format!("{}/{}", file.upload_id, file.id)
    }

    fn take(&self, key: &str) -> Option<PendingStream> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

/// 上传结束（或被取消）时撤销尚未被领取的读端。
struct PendingGuard<'a> {
    backend: &'a StreamBackend,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.backend.take(&self.key);
    }
}

#[async_trait]
impl DataBackend for StreamBackend {
    async fn add_file(&self, file: &File, mut reader: DataReader) -> DataResult<()> {
        let key = Self::key(file);
        let (mut writer, downstream) = tokio::io::duplex(self.buffer_size);
        let (claimed, on_claimed) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), PendingStream { downstream, claimed });
        let _guard = PendingGuard { backend: self, key };

        info!(file_id = %file.id, "stream waiting for download");
        // 读端被移除而没有被领取时发送端随之释放。
        on_claimed
            .await
            .map_err(|_| DataError::Unclaimed(file.id.clone()))?;

        let copied = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
        let written = copied?;
        debug!(file_id = %file.id, bytes = written, "stream relayed");
        Ok(())
    }

    async fn get_file(&self, file: &File) -> DataResult<DataReader> {
        let pending = self
            .take(&Self::key(file))
            .ok_or_else(|| DataError::NotFound(file.id.clone()))?;
        // 上传方已经放弃时发送失败，此时读端只会读到 EOF。
        pending
            .claimed
            .send(())
            .map_err(|_| DataError::Unclaimed(file.id.clone()))?;
        Ok(Box::new(pending.downstream))
    }

    async fn remove_file(&self, file: &File) -> DataResult<()> {
        self.take(&Self::key(file));
        Ok(())
    }
}
