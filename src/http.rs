//! HTTP 辅助工具：客户端 IP、CORS、安全头、内部错误渲染与 panic 恢复。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::middleware;
use std::any::Any;
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any as AnyOrigin, CorsLayer};
use tracing::{error, warn};

use crate::context::AppState;
use crate::error::{INTERNAL_ERROR_MESSAGE, InternalErrorDetail};

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; img-src 'self'; media-src 'self'; style-src 'unsafe-inline'; sandbox";

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AnyOrigin)
            .allow_headers(AnyOrigin),
    )
}

/// 从指定的代理头（默认 `x-forwarded-for`）解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap, header_name: &str) -> Option<IpAddr> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 只有配置了代理头时才信任它，否则使用连接地址。
pub fn resolve_client_ip(
    headers: &HeaderMap,
    source_ip_header: Option<&str>,
    connect_ip: Option<IpAddr>,
) -> Option<IpAddr> {
    source_ip_header
        .and_then(|name| extract_forwarded_ip(headers, name))
        .or(connect_ip)
}

/// 写入防嗅探、禁止嵌入与严格内容策略响应头。
pub fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
}

/// 禁止客户端与中间代理缓存。
pub fn apply_no_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// 启用增强安全策略时为所有响应添加安全头。
pub async fn add_security_headers(
    Extension(state): Extension<AppState>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let mut response = next.run(request).await;
    if state.config.enhanced_web_security {
        apply_security_headers(response.headers_mut());
    }
    response
}

/// 调试模式下把内部错误的完整描述写回响应体。
pub async fn render_internal_errors(
    Extension(state): Extension<AppState>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let mut response = next.run(request).await;
    if !state.config.debug {
        return response;
    }
    match response.extensions_mut().remove::<InternalErrorDetail>() {
        Some(InternalErrorDetail(detail)) => (response.status(), detail).into_response(),
        None => response,
    }
}

/// 把处理过程中的 panic 转成 500 响应，调试模式下附带 panic 信息。
pub fn panic_response(panic: Box<dyn Any + Send + 'static>, debug: bool) -> Response {
    let message = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %message, "request handler panicked");

    let body = if debug {
        format!("panic : {message}")
    } else {
        INTERNAL_ERROR_MESSAGE.to_string()
    };
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}
