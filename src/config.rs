//! CLI arguments, environment overrides and the immutable server configuration.

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use shadow_rs::formatcp;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::build;
use crate::models::{Token, User};

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_PER_UPLOAD: usize = 1000;
pub const DEFAULT_TTL_SECS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_MAX_TTL_SECS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_PIPE_CAPACITY: usize = 32;
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_YUBIKEY_API_URL: &str = "https://api.yubico.com/wsapi/2.0/verify";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid network `{0}` in upload whitelist")]
    InvalidNetwork(String),
    #[error("yubikey is enabled but no client id was provided")]
    MissingYubikeyClientId,
    #[error("unable to read users file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse users file: {0}")]
    Json(#[from] serde_json::Error),
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-relay", version = VERSION_INFO, about = "AxoRelay temporary file relay")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = 8080,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "AXO_TLS_SELF_SIGNED",
        default_value_t = false,
        help = "Serve HTTPS with a generated self-signed certificate when no cert is given"
    )]
    pub tls_self_signed: bool,
    #[arg(
        short = 'd',
        long,
        env = "AXO_DATA_DIR",
        default_value = ".axo/relay",
        help = "Directory for uploaded files"
    )]
    pub data_dir: String,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max file size in bytes (0 to disable)"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "AXO_MAX_FILE_PER_UPLOAD",
        default_value_t = DEFAULT_MAX_FILE_PER_UPLOAD,
        help = "Max number of files in a single upload"
    )]
    pub max_file_per_upload: usize,
    #[arg(
        long,
        env = "AXO_DEFAULT_TTL",
        default_value_t = DEFAULT_TTL_SECS,
        help = "Default upload TTL in seconds"
    )]
    pub default_ttl: i64,
    #[arg(
        long,
        env = "AXO_MAX_TTL",
        default_value_t = DEFAULT_MAX_TTL_SECS,
        allow_negative_numbers = true,
        help = "Max upload TTL in seconds (0 or -1 to allow uploads that never expire)"
    )]
    pub max_ttl: i64,
    #[arg(long, env = "AXO_ONE_SHOT", default_value_t = true, action = ArgAction::Set)]
    pub one_shot: bool,
    #[arg(long, env = "AXO_STREAM_MODE", default_value_t = true, action = ArgAction::Set)]
    pub stream_mode: bool,
    #[arg(long, env = "AXO_REMOVABLE", default_value_t = true, action = ArgAction::Set)]
    pub removable: bool,
    #[arg(long, env = "AXO_PROTECTED_BY_PASSWORD", default_value_t = true, action = ArgAction::Set)]
    pub protected_by_password: bool,
    #[arg(long, env = "AXO_NO_ANONYMOUS_UPLOADS", default_value_t = false)]
    pub no_anonymous_uploads: bool,
    #[arg(
        long,
        env = "AXO_UPLOAD_WHITELIST",
        value_delimiter = ',',
        help = "Comma separated networks allowed to create uploads"
    )]
    pub upload_whitelist: Vec<String>,
    #[arg(
        long,
        env = "AXO_ADMINS",
        value_delimiter = ',',
        help = "Comma separated user ids with server administrator rights"
    )]
    pub admins: Vec<String>,
    #[arg(long, env = "AXO_SOURCE_IP_HEADER", help = "Header carrying the client IP behind a reverse proxy")]
    pub source_ip_header: Option<String>,
    #[arg(long, env = "AXO_ENHANCED_WEB_SECURITY", default_value_t = false)]
    pub enhanced_web_security: bool,
    #[arg(long, env = "AXO_DEBUG", default_value_t = false)]
    pub debug: bool,
    #[arg(long, env = "AXO_SERVER_URL", help = "Public URL of the server")]
    pub server_url: Option<String>,
    #[arg(long, env = "AXO_DOWNLOAD_DOMAIN", help = "Dedicated domain for file downloads")]
    pub download_domain: Option<String>,
    #[arg(long, env = "AXO_YUBIKEY_ENABLED", default_value_t = false)]
    pub yubikey_enabled: bool,
    #[arg(long, env = "AXO_YUBIKEY_CLIENT_ID")]
    pub yubikey_client_id: Option<String>,
    #[arg(long, env = "AXO_YUBIKEY_API_URL", default_value = DEFAULT_YUBIKEY_API_URL)]
    pub yubikey_api_url: String,
    #[arg(
        long,
        env = "AXO_PIPE_CAPACITY",
        default_value_t = DEFAULT_PIPE_CAPACITY,
        help = "Chunks buffered between the request body and the data backend"
    )]
    pub pipe_capacity: usize,
    #[arg(long, env = "AXO_USERS_FILE", help = "JSON file with users and tokens to load at startup")]
    pub users_file: Option<String>,
}

/// 上传白名单中的网段，单个地址视为全长前缀。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask(self.prefix, 32) as u32;
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask(self.prefix, 128);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask(prefix: u8, bits: u32) -> u128 {
    let prefix = u32::from(prefix).min(bits);
    if prefix == 0 {
        return 0;
    }
    let full = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    full & !((1u128 << (bits - prefix)) - 1)
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNetwork(value.to_string());
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (value, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

/// 运行期只读配置，启动时由 [`Args`] 构建并通过 `Arc` 共享。
///
/// 序列化结果即 `/config` 接口的返回值，敏感或仅服务端使用的字段不输出。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub max_file_size: u64,
    pub max_file_per_upload: usize,
    pub default_ttl: i64,
    pub max_ttl: i64,
    pub one_shot: bool,
    pub stream_mode: bool,
    pub removable: bool,
    pub protected_by_password: bool,
    pub protected_by_yubikey: bool,
    pub no_anonymous_uploads: bool,
    pub enhanced_web_security: bool,
    pub download_domain: Option<String>,
    #[serde(skip)]
    pub server_url: Option<String>,
    #[serde(skip)]
    pub debug: bool,
    #[serde(skip)]
    pub upload_whitelist: Vec<IpNetwork>,
    #[serde(skip)]
    pub admins: Vec<String>,
    #[serde(skip)]
    pub source_ip_header: Option<String>,
    #[serde(skip)]
    pub yubikey_client_id: Option<String>,
    #[serde(skip)]
    pub yubikey_api_url: String,
    #[serde(skip)]
    pub pipe_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_file_per_upload: DEFAULT_MAX_FILE_PER_UPLOAD,
            default_ttl: DEFAULT_TTL_SECS,
            max_ttl: DEFAULT_MAX_TTL_SECS,
            one_shot: true,
            stream_mode: true,
            removable: true,
            protected_by_password: true,
            protected_by_yubikey: false,
            no_anonymous_uploads: false,
            enhanced_web_security: false,
            download_domain: None,
            server_url: None,
            debug: false,
            upload_whitelist: Vec::new(),
            admins: Vec::new(),
            source_ip_header: None,
            yubikey_client_id: None,
            yubikey_api_url: DEFAULT_YUBIKEY_API_URL.to_string(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let upload_whitelist = args
            .upload_whitelist
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(IpNetwork::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if args.yubikey_enabled && args.yubikey_client_id.is_none() {
            return Err(ConfigError::MissingYubikeyClientId);
        }

        Ok(Self {
            max_file_size: args.max_file_size,
            max_file_per_upload: args.max_file_per_upload,
            default_ttl: args.default_ttl,
            max_ttl: args.max_ttl,
            one_shot: args.one_shot,
            stream_mode: args.stream_mode,
            removable: args.removable,
            protected_by_password: args.protected_by_password,
            protected_by_yubikey: args.yubikey_enabled,
            no_anonymous_uploads: args.no_anonymous_uploads,
            enhanced_web_security: args.enhanced_web_security,
            download_domain: args.download_domain.clone(),
            server_url: args.server_url.clone(),
            debug: args.debug,
            upload_whitelist,
            admins: args
                .admins
                .iter()
                .map(|admin| admin.trim().to_string())
                .filter(|admin| !admin.is_empty())
                .collect(),
            source_ip_header: args.source_ip_header.clone(),
            yubikey_client_id: args.yubikey_client_id.clone(),
            yubikey_api_url: args.yubikey_api_url.clone(),
            pipe_capacity: args.pipe_capacity.max(1),
        })
    }

    /// 白名单为空时放行所有来源，无法识别来源 IP 时拒绝。
    pub fn is_whitelisted(&self, ip: Option<IpAddr>) -> bool {
        if self.upload_whitelist.is_empty() {
            return true;
        }
        ip.is_some_and(|ip| self.upload_whitelist.iter().any(|net| net.contains(ip)))
    }

    pub fn is_server_admin(&self, user: &User) -> bool {
        user.admin || self.admins.iter().any(|admin| admin == &user.id)
    }

    /// 下载链接前缀，优先使用独立下载域名。
    pub fn download_url_base(&self) -> String {
        self.download_domain
            .as_deref()
            .or(self.server_url.as_deref())
            .unwrap_or("")
            .trim_end_matches('/')
            .to_string()
    }
}

/// 启动时导入内存元数据后端的用户与令牌。
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserSeed {
    pub users: Vec<User>,
    pub tokens: Vec<Token>,
}

pub async fn load_user_seed(path: &Path) -> Result<UserSeed, ConfigError> {
    let content = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}
