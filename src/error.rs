//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::fmt::Display;
use tracing::error;

use crate::data::DataError;
use crate::metadata::MetadataError;

pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";
pub const BASIC_REALM: &str = r#"Basic realm="axo-relay""#;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// `detail` 只在调试模式下返回给客户端。
    Internal {
        message: String,
        detail: Option<String>,
    },
    Unauthorized(String, HeaderMap),
    Forbidden(String),
    PayloadTooLarge(String),
}

/// 内部错误的完整描述，挂在响应扩展上供调试模式渲染。
#[derive(Clone, Debug)]
pub struct InternalErrorDetail(pub String);

impl ApiError {
    pub fn missing(what: impl Display) -> Self {
        ApiError::BadRequest(format!("missing {what}"))
    }

    pub fn invalid(what: impl Display) -> Self {
        ApiError::BadRequest(format!("invalid {what}"))
    }

    pub fn internal(message: impl Into<String>, err: impl Display) -> Self {
        ApiError::Internal {
            message: message.into(),
            detail: Some(err.to_string()),
        }
    }

    /// 需要重新提供 Basic 凭据的 401。
    pub fn credentials_required(message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(BASIC_REALM),
        );
        ApiError::Unauthorized(message.into(), headers)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Forbidden(msg)
            | ApiError::PayloadTooLarge(msg) => (status, msg).into_response(),
            ApiError::Unauthorized(msg, headers) => (status, headers, msg).into_response(),
            ApiError::Internal { message, detail } => {
                let full = match detail {
                    Some(detail) => format!("{message} : {detail}"),
                    None => message,
                };
                error!(error = %full, "internal error");
                let mut response = (status, INTERNAL_ERROR_MESSAGE).into_response();
                response.extensions_mut().insert(InternalErrorDetail(full));
                response
            }
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::UploadNotFound(_) | MetadataError::FileNotFound(_) => {
                ApiError::NotFound(error.to_string())
            }
            MetadataError::StatusMismatch { .. } | MetadataError::InvalidTransition { .. } => {
                ApiError::BadRequest(error.to_string())
            }
            MetadataError::AlreadyExists(_) | MetadataError::Backend(_) => {
                ApiError::internal("metadata backend error", error)
            }
        }
    }
}

impl From<DataError> for ApiError {
    fn from(error: DataError) -> Self {
        match error {
            DataError::NotFound(_) => ApiError::NotFound(error.to_string()),
            DataError::Unavailable(_) => ApiError::BadRequest(error.to_string()),
            DataError::InvalidId(_) | DataError::Unclaimed(_) | DataError::Io(_) => {
                ApiError::internal("data backend error", error)
            }
        }
    }
}
