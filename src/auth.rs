//! 调用方身份识别、上传管理员判定、密码校验与文件定位。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, Request, header};
use axum::middleware;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Span, debug, warn};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::models::{Token, Upload, User, hash_credentials};

pub const UPLOAD_TOKEN_HEADER: &str = "x-uploadtoken";
pub const API_TOKEN_HEADER: &str = "x-relaytoken";
pub const IMPERSONATE_HEADER: &str = "x-relay-impersonate";

const CREDENTIALS_REQUIRED: &str = "please provide valid credentials to access this upload";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// 识别 API 令牌对应的用户，并处理服务端管理员的身份模拟。
pub async fn authenticate(
    Extension(ctx): Extension<Arc<RequestContext>>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if let Some(value) = header_str(request.headers(), API_TOKEN_HEADER) {
        let token = ctx
            .metadata()
            .get_token(value)
            .await?
            .ok_or_else(|| ApiError::Forbidden("invalid token".into()))?;
        let user = ctx
            .metadata()
            .get_user(&token.user_id)
            .await?
            .ok_or_else(|| ApiError::Forbidden("invalid token".into()))?;
        debug!(user_id = %user.id, "authenticated with api token");
        ctx.set_admin(ctx.config().is_server_admin(&user));
        ctx.set_user(Some(user));
        ctx.set_token(Some(token));
    }

    if let Some(target) = header_str(request.headers(), IMPERSONATE_HEADER) {
        if !ctx.is_admin() {
            warn!(impersonate = %target, "impersonation attempt without administrator rights");
            return Err(ApiError::Forbidden(
                "you need administrator privileges".into(),
            ));
        }
        let user = ctx.metadata().get_user(target).await?.ok_or_else(|| {
            ApiError::Forbidden("unable to get user to impersonate : user does not exist".into())
        })?;
        debug!(user_id = %user.id, "impersonating user");
        ctx.set_user(Some(user));
    }

    Ok(next.run(request).await)
}

/// 依次检查上传管理令牌、作用域 API 令牌、服务端管理员与上传所有者，命中即返回。
pub fn resolve_upload_admin(
    upload: &Upload,
    upload_token: Option<&str>,
    token: Option<&Token>,
    is_server_admin: bool,
    user: Option<&User>,
) -> bool {
    if let (Some(presented), Some(stored)) = (upload_token, upload.upload_token.as_deref())
        && presented == stored
    {
        return true;
    }
    if let (Some(token), Some(scope)) = (token, upload.token.as_deref())
        && token.token == scope
    {
        return true;
    }
    if is_server_admin {
        return true;
    }
    matches!((user, upload.user.as_deref()), (Some(user), Some(owner)) if user.id == owner)
}

/// 受密码保护的上传要求 `Authorization: Basic <value>` 且 `md5(value)` 与存储值一致。
pub fn check_password(headers: &HeaderMap, upload: &Upload) -> Result<(), ApiError> {
    if !upload.protected_by_password {
        return Ok(());
    }

    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        warn!("missing authorization header");
        return Err(ApiError::credentials_required(CREDENTIALS_REQUIRED));
    };

    let mut parts = value.split(' ');
    let (Some(scheme), Some(encoded), None) = (parts.next(), parts.next(), parts.next()) else {
        warn!("invalid authorization header");
        return Err(ApiError::credentials_required(CREDENTIALS_REQUIRED));
    };
    if scheme != "Basic" {
        warn!(scheme, "invalid http authorization scheme");
        return Err(ApiError::credentials_required(CREDENTIALS_REQUIRED));
    }

    if upload.password.as_deref() != Some(hash_credentials(encoded).as_str()) {
        warn!("invalid credentials");
        return Err(ApiError::credentials_required(CREDENTIALS_REQUIRED));
    }
    Ok(())
}

/// 加载路径中的上传，判定管理员身份并执行密码校验。
pub async fn upload_middleware(
    Extension(ctx): Extension<Arc<RequestContext>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let upload_id = params
        .get("upload_id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::missing("upload id"))?;

    let upload = ctx
        .metadata()
        .get_upload(upload_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {upload_id} not found")))?;
    Span::current().record("upload_id", upload_id.as_str());

    if upload.is_expired(chrono::Utc::now()) {
        warn!(upload_id = %upload_id, "upload has expired");
        return Err(ApiError::NotFound(format!("upload {upload_id} has expired")));
    }

    let user = ctx.user();
    let token = ctx.token();
    let is_upload_admin = resolve_upload_admin(
        &upload,
        header_str(request.headers(), UPLOAD_TOKEN_HEADER),
        token.as_ref(),
        ctx.is_admin(),
        user.as_ref(),
    );

    if !is_upload_admin {
        check_password(request.headers(), &upload)?;
    }

    ctx.set_upload_admin(is_upload_admin);
    ctx.set_upload(upload);
    Ok(next.run(request).await)
}

/// 加载路径中的文件并校验它属于当前上传且文件名一致。
pub async fn file_middleware(
    Extension(ctx): Extension<Arc<RequestContext>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let upload = ctx.expect_upload();

    let file_id = params
        .get("file_id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::missing("file id"))?;
    let file_name = params
        .get("file_name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::missing("file name"))?;

    let file = ctx
        .metadata()
        .get_file(file_id)
        .await?
        .filter(|file| file.upload_id == upload.id)
        .ok_or_else(|| ApiError::NotFound(format!("file {file_id} not found")))?;
    Span::current().record("file_id", file_id.as_str());

    if &file.name != file_name {
        warn!(expected = %file.name, actual = %file_name, "file name mismatch");
        return Err(ApiError::NotFound(format!("file {file_name} not found")));
    }

    ctx.set_file(file);
    Ok(next.run(request).await)
}
