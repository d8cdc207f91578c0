//! 版本信息、公开配置与健康检查处理器。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::context::RequestContext;
use crate::error::ApiError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    build_env: String,
}

/// 返回当前版本信息。
pub async fn get_version_info() -> Result<JsonResponse<VersionInfo>, ApiError> {
    let version_info = VersionInfo {
        version: crate::build::PKG_VERSION,
        commit: crate::build::SHORT_COMMIT,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
    };
    Ok(JsonResponse(version_info))
}

/// 返回客户端可见的服务端配置。
pub async fn get_config(
    Extension(ctx): Extension<Arc<RequestContext>>,
) -> JsonResponse<RelayConfig> {
    JsonResponse(ctx.config().clone())
}

pub async fn healthz() -> &'static str {
    "ok"
}
