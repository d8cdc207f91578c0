//! 请求级上下文。
//!
//! 每个请求拥有一个 [`RequestContext`]：配置与后端句柄在构建后只读，
//! 调用方身份、当前上传与文件等在中间件链中逐步填充的字段放在同一把读写锁后面。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::middleware;
use axum::response::Response;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::RelayConfig;
use crate::data::DataBackends;
use crate::http::resolve_client_ip;
use crate::metadata::MetadataBackend;
use crate::models::{File, Token, Upload, User};
use crate::yubikey::OtpVerifier;

/// 进程级共享状态，每个请求从这里派生自己的上下文。
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub metadata: Arc<dyn MetadataBackend>,
    pub data: DataBackends,
    pub otp: Option<Arc<dyn OtpVerifier>>,
}

impl AppState {
    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            config: self.config.clone(),
            metadata: self.metadata.clone(),
            data: self.data.clone(),
            otp: self.otp.clone(),
            state: RwLock::new(RequestState::default()),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RequestState {
    source_ip: Option<IpAddr>,
    whitelisted: bool,
    user: Option<User>,
    token: Option<Token>,
    is_admin: bool,
    upload: Option<Upload>,
    file: Option<File>,
    is_upload_admin: bool,
    quick: bool,
}

pub struct RequestContext {
    config: Arc<RelayConfig>,
    metadata: Arc<dyn MetadataBackend>,
    data: DataBackends,
    otp: Option<Arc<dyn OtpVerifier>>,
    state: RwLock<RequestState>,
}

impl RequestContext {
    fn read(&self) -> RwLockReadGuard<'_, RequestState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RequestState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataBackend> {
        &self.metadata
    }

    pub fn data(&self) -> &DataBackends {
        &self.data
    }

    pub fn otp(&self) -> Option<&Arc<dyn OtpVerifier>> {
        self.otp.as_ref()
    }

    pub fn source_ip(&self) -> Option<IpAddr> {
        self.read().source_ip
    }

    pub fn set_source_ip(&self, ip: Option<IpAddr>) {
        let mut state = self.write();
        state.source_ip = ip;
        state.whitelisted = self.config.is_whitelisted(ip);
    }

    pub fn is_whitelisted(&self) -> bool {
        self.read().whitelisted
    }

    pub fn user(&self) -> Option<User> {
        self.read().user.clone()
    }

    pub fn set_user(&self, user: Option<User>) {
        self.write().user = user;
    }

    pub fn token(&self) -> Option<Token> {
        self.read().token.clone()
    }

    pub fn set_token(&self, token: Option<Token>) {
        self.write().token = token;
    }

    /// 调用方是否为服务端管理员。
    pub fn is_admin(&self) -> bool {
        self.read().is_admin
    }

    pub fn set_admin(&self, is_admin: bool) {
        self.write().is_admin = is_admin;
    }

    pub fn upload(&self) -> Option<Upload> {
        self.read().upload.clone()
    }

    /// 路由保证上传中间件已运行，缺失时直接 panic 交给外层恢复。
    pub fn expect_upload(&self) -> Upload {
        match self.upload() {
            Some(upload) => upload,
            None => panic!("missing upload from context"),
        }
    }

    pub fn set_upload(&self, upload: Upload) {
        self.write().upload = Some(upload);
    }

    pub fn file(&self) -> Option<File> {
        self.read().file.clone()
    }

    pub fn expect_file(&self) -> File {
        match self.file() {
            Some(file) => file,
            None => panic!("missing file from context"),
        }
    }

    pub fn set_file(&self, file: File) {
        self.write().file = Some(file);
    }

    /// 调用方能否管理当前上传。
    pub fn is_upload_admin(&self) -> bool {
        self.read().is_upload_admin
    }

    pub fn set_upload_admin(&self, is_upload_admin: bool) {
        self.write().is_upload_admin = is_upload_admin;
    }

    pub fn is_quick(&self) -> bool {
        self.read().quick
    }

    pub fn set_quick(&self, quick: bool) {
        self.write().quick = quick;
    }

    /// 服务端上限与用户覆盖值中较小的一个，`0` 表示不限制。
    pub fn max_file_size(&self) -> u64 {
        let server = self.config.max_file_size;
        match self.read().user.as_ref().map(|user| user.max_file_size) {
            Some(limit) if limit > 0 && (server == 0 || limit < server) => limit,
            _ => server,
        }
    }

    /// 用户覆盖值优先，`<= 0` 表示允许永不过期。
    pub fn max_ttl(&self) -> i64 {
        match self.read().user.as_ref().map(|user| user.max_ttl) {
            Some(limit) if limit != 0 => limit,
            _ => self.config.max_ttl,
        }
    }
}

/// 为每个请求创建上下文并记录来源 IP。
pub async fn context_middleware(
    Extension(app): Extension<AppState>,
    mut request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let connect_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let source_ip = resolve_client_ip(
        request.headers(),
        app.config.source_ip_header.as_deref(),
        connect_ip,
    );

    let ctx = app.request_context();
    ctx.set_source_ip(source_ip);
    request.extensions_mut().insert(Arc::new(ctx));
    next.run(request).await
}
