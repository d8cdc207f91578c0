//! 上传、文件、用户与令牌的数据模型。

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const UPLOAD_ID_LENGTH: usize = 16;
pub const FILE_ID_LENGTH: usize = 16;
pub const UPLOAD_TOKEN_LENGTH: usize = 32;
pub const MAX_FILE_NAME_LENGTH: usize = 1024;
pub const DEFAULT_LOGIN: &str = "relay";

/// 文件生命周期状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Missing,
    Uploading,
    Uploaded,
    Removed,
    Deleted,
}

impl FileStatus {
    /// 判断状态图中是否存在 `self -> next` 这条边。
    pub fn allows(self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Missing, Uploading)
                | (Missing, Deleted)
                | (Uploading, Uploaded)
                | (Uploading, Deleted)
                | (Uploading, Removed)
                | (Uploaded, Removed)
                | (Uploaded, Deleted)
                | (Removed, Deleted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Missing => "missing",
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Removed => "removed",
            FileStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上传容器中的单个文件元数据。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: String,
    pub upload_id: String,
    #[serde(rename = "fileName")]
    pub name: String,
    #[serde(rename = "fileType")]
    pub mime_type: String,
    #[serde(rename = "fileSize")]
    pub size: u64,
    #[serde(rename = "fileMd5")]
    pub md5: String,
    pub status: FileStatus,
    #[serde(default)]
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

impl File {
    /// 为上传创建一个处于 `missing` 状态的新文件槽位。
    pub fn new(upload_id: &str, name: &str) -> Self {
        Self {
            id: random_id(FILE_ID_LENGTH),
            upload_id: upload_id.to_string(),
            name: name.to_string(),
            status: FileStatus::Missing,
            created_at: Utc::now(),
            ..Default::default()
        }
    }
}

/// 上传容器。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub id: String,
    pub creation: DateTime<Utc>,
    pub ttl: i64,
    pub expire_at: Option<DateTime<Utc>>,

    pub one_shot: bool,
    pub stream: bool,
    pub removable: bool,

    pub protected_by_password: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    pub protected_by_yubikey: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yubikey: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,

    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub admin: bool,
}

impl Upload {
    /// 生成 ID、创建时间与管理令牌，并按 TTL 计算过期时间。
    pub fn new(ttl: i64) -> Self {
        let creation = Utc::now();
        Self {
            id: random_id(UPLOAD_ID_LENGTH),
            creation,
            ttl,
            expire_at: expire_at(creation, ttl),
            upload_token: Some(random_id(UPLOAD_TOKEN_LENGTH)),
            ..Default::default()
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|expire_at| now >= expire_at)
    }

    /// 移除所有敏感字段，用于对外输出。
    pub fn sanitize(&mut self) {
        self.remote_ip = None;
        self.password = None;
        self.yubikey = None;
        self.upload_token = None;
        self.user = None;
        self.token = None;
    }
}

/// 创建上传时客户端提交的参数。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadParams {
    pub ttl: i64,
    pub one_shot: bool,
    pub stream: bool,
    pub removable: bool,
    pub login: Option<String>,
    pub password: Option<String>,
    pub yubikey: Option<String>,
    pub comments: String,
    pub files: Vec<FileParams>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileParams {
    #[serde(alias = "name")]
    pub file_name: String,
    pub reference: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub id: String,
    pub login: String,
    pub name: String,
    pub admin: bool,
    /// 单文件大小上限覆盖值，`0` 表示沿用服务端配置。
    pub max_file_size: u64,
    /// TTL 上限覆盖值，`0` 表示沿用服务端配置，`-1` 表示不限制。
    pub max_ttl: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Token {
    pub token: String,
    pub user_id: String,
    pub comment: String,
}

/// 根据创建时间与 TTL 计算过期时间，TTL 小于等于 0 时永不过期。
pub fn expire_at(creation: DateTime<Utc>, ttl: i64) -> Option<DateTime<Utc>> {
    (ttl > 0).then(|| creation + Duration::seconds(ttl))
}

/// 生成指定长度的随机字母数字串。
pub fn random_id(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Basic 认证头中 `login:password` 的 base64 值。
pub fn encode_basic_credentials(login: &str, password: &str) -> String {
    general_purpose::STANDARD.encode(format!("{login}:{password}"))
}

/// 对 Basic 认证头的取值做单向哈希，存储时只保留该值。
pub fn hash_credentials(encoded: &str) -> String {
    format!("{:x}", md5::compute(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_graph_only_moves_forward() {
        assert!(FileStatus::Missing.allows(FileStatus::Uploading));
        assert!(FileStatus::Uploading.allows(FileStatus::Uploaded));
        assert!(FileStatus::Uploading.allows(FileStatus::Deleted));
        assert!(FileStatus::Uploaded.allows(FileStatus::Removed));
        assert!(FileStatus::Removed.allows(FileStatus::Deleted));

        assert!(!FileStatus::Missing.allows(FileStatus::Uploaded));
        assert!(!FileStatus::Uploaded.allows(FileStatus::Uploading));
        assert!(!FileStatus::Removed.allows(FileStatus::Uploaded));
        assert!(!FileStatus::Deleted.allows(FileStatus::Missing));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&FileStatus::Uploaded).expect("serialize");
        assert_eq!(json, "\"uploaded\"");
        assert_eq!(FileStatus::Removed.to_string(), "removed");
    }

    #[test]
    fn upload_without_ttl_never_expires() {
        let upload = Upload::new(-1);
        assert!(upload.expire_at.is_none());
        assert!(!upload.is_expired(Utc::now() + Duration::days(3650)));

        let upload = Upload::new(60);
        assert!(!upload.is_expired(Utc::now()));
        assert!(upload.is_expired(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn sanitize_strips_secrets() {
        let mut upload = Upload::new(60);
        upload.password = Some("hash".into());
        upload.remote_ip = Some("127.0.0.1".into());
        upload.user = Some("user".into());
        upload.token = Some("token".into());
        upload.yubikey = Some("cccccccccccc".into());
        upload.sanitize();

        assert!(upload.upload_token.is_none());
        assert!(upload.password.is_none());
        assert!(upload.remote_ip.is_none());
        assert!(upload.user.is_none());
        assert!(upload.token.is_none());
        assert!(upload.yubikey.is_none());
    }

    #[test]
    fn credentials_hash_matches_basic_header_value() {
        let encoded = encode_basic_credentials("plik", "secret");
        assert_eq!(encoded, "cGxpazpzZWNyZXQ=");
        assert_eq!(
            hash_credentials(&encoded),
            format!("{:x}", md5::compute("cGxpazpzZWNyZXQ="))
        );
    }

    #[test]
    fn random_ids_have_requested_length() {
        let id = random_id(UPLOAD_TOKEN_LENGTH);
        assert_eq!(id.len(), UPLOAD_TOKEN_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
