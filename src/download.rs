//! 单文件下载：可见性检查、一次性消费与安全响应头。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::http::apply_no_cache_headers;
use crate::metadata::MetadataError;
use crate::models::{File, FileStatus, Upload};
use crate::sniff::served_content_type;

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    dl: Option<String>,
}

impl DownloadQuery {
    /// 非空的 `dl` 参数表示以附件形式下载。
    pub fn attachment(&self) -> bool {
        self.dl.as_deref().is_some_and(|dl| !dl.is_empty())
    }
}

fn not_available(file: &File, status: FileStatus) -> ApiError {
    ApiError::NotFound(format!(
        "file {} ({}) is not available : {}",
        file.name, file.id, status
    ))
}

/// 流式上传只在 `uploading` 时可下载，普通上传只在 `uploaded` 时可下载。
pub fn retrievable_status(upload: &Upload) -> FileStatus {
    if upload.stream {
        FileStatus::Uploading
    } else {
        FileStatus::Uploaded
    }
}

/// `Content-Disposition` 的取值，文件名中的引号与换行会被替换。
pub fn content_disposition(file_name: &str, attachment: bool) -> HeaderValue {
    let safe_name: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let kind = if attachment { "attachment" } else { "inline" };
    HeaderValue::from_str(&format!("{kind}; filename=\"{safe_name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn download_headers(upload: &Upload, file: &File, attachment: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = served_content_type(&file.mime_type);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    // 流式文件的大小在传输结束前未知。
    if !upload.stream {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size));
        if let Ok(value) = HeaderValue::from_str(&fmt_http_date(SystemTime::from(file.created_at)))
        {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if upload.one_shot || upload.stream {
        apply_no_cache_headers(&mut headers);
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&file.name, attachment),
    );
    headers
}

/// 下载文件。`GET` 一次性上传时会在发送任何字节之前把文件标记为已移除。
pub async fn get_file(
    Extension(ctx): Extension<Arc<RequestContext>>,
    method: Method,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let upload = ctx.expect_upload();
    let mut file = ctx.expect_file();

    if file.status != retrievable_status(&upload) {
        return Err(not_available(&file, file.status));
    }

    let attachment = query.attachment();
    let headers = download_headers(&upload, &file, attachment);
    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers).into_response());
    }

    if upload.one_shot && !upload.stream {
        match ctx
            .metadata()
            .update_file_status(&mut file, FileStatus::Uploaded, FileStatus::Removed)
            .await
        {
            Ok(()) => {}
            Err(MetadataError::StatusMismatch { actual, .. }) => {
                warn!(file_id = %file.id, %actual, "one shot file already consumed");
                return Err(not_available(&file, actual));
            }
            Err(err) => return Err(ApiError::internal("unable to update file status", err)),
        }
    }

    let backend = ctx.data().for_upload(&upload)?;
    let reader = backend.get_file(&file).await.map_err(|err| {
        if upload.stream {
            // 另一个下载方已经领取了流。
            not_available(&file, FileStatus::Deleted)
        } else {
            ApiError::internal("unable to get file from data backend", err)
        }
    })?;

    info!(file_id = %file.id, one_shot = upload.one_shot, stream = upload.stream, "serving file");
    let body = AxumBody::from_stream(ReaderStream::new(reader));
    Ok((StatusCode::OK, headers, body).into_response())
}
