//! 元数据后端接口与内存实现。
//!
//! 所有修改文件状态的调用都是比较并交换：只有存储中的状态与调用方给出的
//! 预期状态一致时才会生效，否则返回 `StatusMismatch` 且不改动存储。

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{File, FileStatus, Token, Upload, User};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid file status {actual}, expected {expected}")]
    StatusMismatch {
        expected: FileStatus,
        actual: FileStatus,
    },
    #[error("invalid file status transition {from} -> {to}")]
    InvalidTransition { from: FileStatus, to: FileStatus },
    #[error("metadata backend error: {0}")]
    Backend(String),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// 元数据后端需要实现的最小接口。
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    async fn create_upload(&self, upload: &Upload) -> MetadataResult<()>;

    /// 不存在时返回 `None`。
    async fn get_upload(&self, id: &str) -> MetadataResult<Option<Upload>>;

    /// 软删除上传并把其下所有文件标记为已移除。
    async fn remove_upload(&self, id: &str) -> MetadataResult<()>;

    async fn create_file(&self, file: &File) -> MetadataResult<()>;

    async fn get_file(&self, id: &str) -> MetadataResult<Option<File>>;

    async fn get_files(&self, upload_id: &str) -> MetadataResult<Vec<File>>;

    /// 保存整份文件记录，前提是存储中的状态仍为 `expected`。
    async fn update_file(&self, file: &File, expected: FileStatus) -> MetadataResult<()>;

    /// 仅修改状态，成功后同步更新调用方持有的 `file.status`。
    async fn update_file_status(
        &self,
        file: &mut File,
        expected: FileStatus,
        status: FileStatus,
    ) -> MetadataResult<()>;

    /// 将文件标记为移除：从未上传过的槽位直接进入 `deleted`，
    /// 已（部分）上传的进入 `removed`，终态文件保持不变。
    async fn remove_file(&self, file: &mut File) -> MetadataResult<()> {
        match file.status {
            FileStatus::Missing => {
                self.update_file_status(file, FileStatus::Missing, FileStatus::Deleted)
                    .await
            }
            FileStatus::Uploading | FileStatus::Uploaded => {
                let current = file.status;
                self.update_file_status(file, current, FileStatus::Removed)
                    .await
            }
            FileStatus::Removed | FileStatus::Deleted => Ok(()),
        }
    }

    async fn count_upload_files(&self, upload_id: &str) -> MetadataResult<usize>;

    async fn create_user(&self, user: &User) -> MetadataResult<()>;

    async fn get_user(&self, id: &str) -> MetadataResult<Option<User>>;

    async fn create_token(&self, token: &Token) -> MetadataResult<()>;

    async fn get_token(&self, token: &str) -> MetadataResult<Option<Token>>;
}

#[derive(Default)]
struct MemoryStore {
    uploads: HashMap<String, Upload>,
    files: HashMap<String, File>,
    users: HashMap<String, User>,
    tokens: HashMap<String, Token>,
}

/// 进程内元数据后端，重启后数据丢失。
#[derive(Default)]
pub struct MemoryMetadata {
    store: RwLock<MemoryStore>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_transition(
    stored: &File,
    expected: FileStatus,
    next: FileStatus,
) -> MetadataResult<()> {
    if stored.status != expected {
        return Err(MetadataError::StatusMismatch {
            expected,
            actual: stored.status,
        });
    }
    if expected != next && !expected.allows(next) {
        return Err(MetadataError::InvalidTransition {
            from: expected,
            to: next,
        });
    }
    Ok(())
}

#[async_trait]
impl MetadataBackend for MemoryMetadata {
    async fn create_upload(&self, upload: &Upload) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        if store.uploads.contains_key(&upload.id) {
            return Err(MetadataError::AlreadyExists(format!("upload {}", upload.id)));
        }
        let mut record = upload.clone();
        for file in record.files.drain(..) {
            store.files.insert(file.id.clone(), file);
        }
        store.uploads.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_upload(&self, id: &str) -> MetadataResult<Option<Upload>> {
        let store = self.store.read().await;
        Ok(store.uploads.get(id).cloned())
    }

    async fn remove_upload(&self, id: &str) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        if store.uploads.remove(id).is_none() {
            return Err(MetadataError::UploadNotFound(id.to_string()));
        }
        for file in store.files.values_mut().filter(|f| f.upload_id == id) {
            file.status = match file.status {
                FileStatus::Missing => FileStatus::Deleted,
                FileStatus::Uploading | FileStatus::Uploaded => FileStatus::Removed,
                other => other,
            };
        }
        Ok(())
    }

    async fn create_file(&self, file: &File) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        if !store.uploads.contains_key(&file.upload_id) {
            return Err(MetadataError::UploadNotFound(file.upload_id.clone()));
        }
        if store.files.contains_key(&file.id) {
            return Err(MetadataError::AlreadyExists(format!("file {}", file.id)));
        }
        store.files.insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn get_file(&self, id: &str) -> MetadataResult<Option<File>> {
        let store = self.store.read().await;
        Ok(store.files.get(id).cloned())
    }

    async fn get_files(&self, upload_id: &str) -> MetadataResult<Vec<File>> {
        let store = self.store.read().await;
        let mut files: Vec<File> = store
            .files
            .values()
            .filter(|file| file.upload_id == upload_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn update_file(&self, file: &File, expected: FileStatus) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        let stored = store
            .files
            .get_mut(&file.id)
            .ok_or_else(|| MetadataError::FileNotFound(file.id.clone()))?;
        check_transition(stored, expected, file.status)?;
        *stored = file.clone();
        Ok(())
    }

    async fn update_file_status(
        &self,
        file: &mut File,
        expected: FileStatus,
        status: FileStatus,
    ) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        let stored = store
            .files
            .get_mut(&file.id)
            .ok_or_else(|| MetadataError::FileNotFound(file.id.clone()))?;
        check_transition(stored, expected, status)?;
        stored.status = status;
        file.status = status;
        Ok(())
    }

    async fn count_upload_files(&self, upload_id: &str) -> MetadataResult<usize> {
        let store = self.store.read().await;
        Ok(store
            .files
            .values()
            .filter(|file| file.upload_id == upload_id)
            .count())
    }

    async fn create_user(&self, user: &User) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        if store.users.contains_key(&user.id) {
            return Err(MetadataError::AlreadyExists(format!("user {}", user.id)));
        }
        store.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &str) -> MetadataResult<Option<User>> {
        let store = self.store.read().await;
        Ok(store.users.get(id).cloned())
    }

    async fn create_token(&self, token: &Token) -> MetadataResult<()> {
        let mut store = self.store.write().await;
        if !store.users.contains_key(&token.user_id) {
            return Err(MetadataError::Backend(format!(
                "token owner {} does not exist",
                token.user_id
            )));
        }
        if store.tokens.contains_key(&token.token) {
            return Err(MetadataError::AlreadyExists("token".into()));
        }
        store.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn get_token(&self, token: &str) -> MetadataResult<Option<Token>> {
        let store = self.store.read().await;
        Ok(store.tokens.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend_with_file() -> (MemoryMetadata, File) {
        let backend = MemoryMetadata::new();
        let upload = Upload::new(60);
        backend.create_upload(&upload).await.expect("create upload");
        let file = File::new(&upload.id, "hello.txt");
        backend.create_file(&file).await.expect("create file");
        (backend, file)
    }

    #[tokio::test]
    async fn status_update_requires_expected_status() {
        let (backend, mut file) = backend_with_file().await;

        let result = backend
            .update_file_status(&mut file, FileStatus::Uploading, FileStatus::Uploaded)
            .await;
        assert!(matches!(
            result,
            Err(MetadataError::StatusMismatch {
                expected: FileStatus::Uploading,
                actual: FileStatus::Missing,
            })
        ));

        let stored = backend.get_file(&file.id).await.expect("get").expect("file");
        assert_eq!(stored.status, FileStatus::Missing);
        assert_eq!(file.status, FileStatus::Missing);

        backend
            .update_file_status(&mut file, FileStatus::Missing, FileStatus::Uploading)
            .await
            .expect("missing -> uploading");
        assert_eq!(file.status, FileStatus::Uploading);
    }

    #[tokio::test]
    async fn second_transition_from_same_status_is_rejected() {
        let (backend, mut file) = backend_with_file().await;
        let mut racer = file.clone();

        backend
            .update_file_status(&mut file, FileStatus::Missing, FileStatus::Uploading)
            .await
            .expect("first transition");
        let result = backend
            .update_file_status(&mut racer, FileStatus::Missing, FileStatus::Uploading)
            .await;
        assert!(matches!(result, Err(MetadataError::StatusMismatch { .. })));
    }

    #[tokio::test]
    async fn transition_outside_graph_is_rejected() {
        let (backend, mut file) = backend_with_file().await;
        let result = backend
            .update_file_status(&mut file, FileStatus::Missing, FileStatus::Uploaded)
            .await;
        assert!(matches!(result, Err(MetadataError::InvalidTransition { .. })));
        let stored = backend.get_file(&file.id).await.expect("get").expect("file");
        assert_eq!(stored.status, FileStatus::Missing);
    }

    #[tokio::test]
    async fn update_file_saves_fields_under_expected_status() {
        let (backend, mut file) = backend_with_file().await;
        backend
            .update_file_status(&mut file, FileStatus::Missing, FileStatus::Uploading)
            .await
            .expect("uploading");

        file.size = 42;
        file.md5 = "abc".into();
        file.status = FileStatus::Uploaded;
        backend
            .update_file(&file, FileStatus::Uploading)
            .await
            .expect("update");

        let stored = backend.get_file(&file.id).await.expect("get").expect("file");
        assert_eq!(stored.size, 42);
        assert_eq!(stored.status, FileStatus::Uploaded);

        let result = backend.update_file(&file, FileStatus::Uploading).await;
        assert!(matches!(result, Err(MetadataError::StatusMismatch { .. })));
    }

    #[tokio::test]
    async fn remove_file_depends_on_status() {
        let (backend, mut file) = backend_with_file().await;
        backend.remove_file(&mut file).await.expect("remove missing");
        assert_eq!(file.status, FileStatus::Deleted);

        let upload_id = file.upload_id.clone();
        let mut uploaded = File::new(&upload_id, "b.txt");
        uploaded.status = FileStatus::Uploaded;
        backend.create_file(&uploaded).await.expect("create");
        backend.remove_file(&mut uploaded).await.expect("remove uploaded");
        assert_eq!(uploaded.status, FileStatus::Removed);

        assert_eq!(backend.count_upload_files(&upload_id).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn remove_upload_marks_files() {
        let (backend, file) = backend_with_file().await;
        backend
            .remove_upload(&file.upload_id)
            .await
            .expect("remove upload");
        assert!(backend.get_upload(&file.upload_id).await.expect("get").is_none());
        let stored = backend.get_file(&file.id).await.expect("get").expect("file");
        assert_eq!(stored.status, FileStatus::Deleted);
    }
}
