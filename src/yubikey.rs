//! Yubikey 一次性口令校验：下载时的 OTP 中间件与 Yubico 验证客户端。

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, Method, Request};
use axum::middleware;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::models::random_id;

pub const OTP_LENGTH: usize = 44;
pub const DEVICE_PREFIX_LENGTH: usize = 12;
const NONCE_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("yubico request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected yubico response: {0}")]
    Response(String),
}

/// OTP 校验服务，返回设备 ID 与校验结果。
#[async_trait]
pub trait OtpVerifier: Send + Sync {
    async fn verify(&self, otp: &str) -> Result<(String, bool), OtpError>;
}

/// Yubico 官方 `wsapi/2.0/verify` 客户端。
pub struct YubicoClient {
    http: reqwest::Client,
    api_url: String,
    client_id: String,
}

impl YubicoClient {
    pub fn new(api_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            client_id: client_id.into(),
        }
    }
}

/// 解析 `key=value` 逐行格式的响应。
fn parse_verify_response(body: &str) -> HashMap<&str, &str> {
    body.lines()
        .filter_map(|line| line.trim().split_once('='))
        .collect()
}

#[async_trait]
impl OtpVerifier for YubicoClient {
    async fn verify(&self, otp: &str) -> Result<(String, bool), OtpError> {
        let nonce = random_id(NONCE_LENGTH);
        let body = self
            .http
            .get(&self.api_url)
            .query(&[
                ("id", self.client_id.as_str()),
                ("otp", otp),
                ("nonce", nonce.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let fields = parse_verify_response(&body);
        let status = fields
            .get("status")
            .ok_or_else(|| OtpError::Response("missing status".into()))?;
        let device_id = otp.chars().take(DEVICE_PREFIX_LENGTH).collect::<String>();
        debug!(status = %status, device_id = %device_id, "yubico verification");

        let echoed = fields.get("otp") == Some(&otp) && fields.get("nonce") == Some(&nonce.as_str());
        Ok((device_id, *status == "OK" && echoed))
    }
}

/// 上传声明了设备前缀时，下载必须附带有效的一次性口令。
pub async fn yubikey_middleware(
    Extension(ctx): Extension<Arc<RequestContext>>,
    method: Method,
    Path(params): Path<HashMap<String, String>>,
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(next.run(request).await);
    }

    let upload = ctx.expect_upload();
    let Some(prefix) = upload.yubikey.as_deref() else {
        return Ok(next.run(request).await);
    };

    if !ctx.config().protected_by_yubikey {
        warn!("yubikey upload requested but yubikey is disabled");
        return Err(ApiError::Forbidden(
            "yubikey are disabled on this server".into(),
        ));
    }

    let invalid = || ApiError::Unauthorized("invalid yubikey token".into(), HeaderMap::new());
    let otp = params.get("yubikey").map(String::as_str).unwrap_or("");
    if otp.len() != OTP_LENGTH {
        warn!(otp, "invalid yubikey token");
        return Err(invalid());
    }
    if otp.get(..DEVICE_PREFIX_LENGTH) != Some(prefix) {
        warn!(otp, "invalid yubikey device");
        return Err(invalid());
    }

    let verifier = ctx
        .otp()
        .ok_or_else(|| ApiError::internal("invalid yubikey token", "no otp verifier configured"))?;
    match verifier.verify(otp).await {
        Ok((_, true)) => Ok(next.run(request).await),
        Ok((_, false)) => {
            warn!(otp, "yubikey token rejected");
            Err(invalid())
        }
        Err(err) => Err(ApiError::internal("invalid yubikey token", err)),
    }
}
