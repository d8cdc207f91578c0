//! zip 打包下载。
//!
//! 压缩在阻塞线程上进行，输出经有界通道逐块转发给响应体。
//! 响应头发出后才可能出现的错误只能截断响应，客户端会收到不完整的压缩包。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream;
use std::collections::{HashMap, HashSet};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{error, info};
use zip::write::{SimpleFileOptions, StreamWriter};
use zip::{CompressionMethod, ZipWriter};

use crate::context::RequestContext;
use crate::data::{DataBackend, DataReader};
use crate::download::{DownloadQuery, content_disposition};
use crate::error::ApiError;
use crate::http::{apply_no_cache_headers, apply_security_headers};
use crate::metadata::MetadataBackend;
use crate::models::{File, FileStatus, MAX_FILE_NAME_LENGTH, Upload};

const ARCHIVE_BUFFER_SIZE: usize = 32 * 1024;

/// 把压缩输出推入通道的同步写端。
struct ChannelWriter {
    sender: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive client went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn validate_archive_name(name: &str) -> Result<(), ApiError> {
    if !name.ends_with(".zip") {
        return Err(ApiError::invalid("file name, missing .zip extension"));
    }
    if name.len() > MAX_FILE_NAME_LENGTH {
        return Err(ApiError::invalid("file name, too long"));
    }
    Ok(())
}

fn archive_headers(upload: &Upload, name: &str, attachment: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(name, attachment));
    apply_security_headers(&mut headers);
    if upload.one_shot {
        apply_no_cache_headers(&mut headers);
    }
    headers
}

/// 下载上传中所有 `uploaded` 状态文件组成的 zip。
pub async fn get_archive(
    Extension(ctx): Extension<Arc<RequestContext>>,
    method: Method,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let upload = ctx.expect_upload();
    if upload.stream {
        return Err(ApiError::BadRequest(
            "archive feature is not available in stream mode".into(),
        ));
    }

    let name = params
        .get("file_name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::missing("archive name"))?;
    validate_archive_name(name)?;

    let files: Vec<File> = ctx
        .metadata()
        .get_files(&upload.id)
        .await?
        .into_iter()
        .filter(|file| file.status == FileStatus::Uploaded)
        .collect();
    if files.is_empty() {
        return Err(ApiError::BadRequest("nothing to archive".into()));
    }

    let headers = archive_headers(&upload, name, query.attachment());
    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers).into_response());
    }

    let backend = ctx.data().for_upload(&upload)?;
    let metadata = ctx.metadata().clone();
    let (sender, mut receiver) = mpsc::channel(ctx.config().pipe_capacity.max(1));
    info!(upload_id = %upload.id, files = files.len(), "serving archive");

    tokio::spawn(async move {
        if let Err(err) = write_archive(&upload, files, metadata, backend, sender.clone()).await {
            error!(upload_id = %upload.id, error = %err, "archive truncated");
            let _ = sender.send(Err(err)).await;
        }
    });

    let body = AxumBody::from_stream(stream::poll_fn(move |cx| receiver.poll_recv(cx)));
    Ok((StatusCode::OK, headers, body).into_response())
}

type ArchiveWriter = ZipWriter<StreamWriter<BufWriter<ChannelWriter>>>;

/// 压缩包内的条目名，重名文件加上文件 ID 前缀。
fn entry_names(files: &[File]) -> Vec<String> {
    let mut taken = HashSet::new();
    files
        .iter()
        .map(|file| {
            let mut name = file.name.clone();
            while !taken.insert(name.clone()) {
                name = format!("{}-{}", file.id, name);
            }
            name
        })
        .collect()
}

fn entry_options(file: &File) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(file.size >= u64::from(u32::MAX))
}

/// 在阻塞线程上操作压缩写端。出错时写端随闭包一起在阻塞线程上释放。
async fn on_blocking<F>(mut zip: ArchiveWriter, op: F) -> io::Result<ArchiveWriter>
where
    F: FnOnce(&mut ArchiveWriter) -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        op(&mut zip)?;
        Ok(zip)
    })
    .await
    .map_err(io::Error::other)?
}

/// 打开文件字节；一次性上传随后把文件标记为已移除，之后才写入任何数据。
async fn open_entry(
    upload: &Upload,
    file: &mut File,
    metadata: &dyn MetadataBackend,
    backend: &dyn DataBackend,
) -> io::Result<DataReader> {
    let reader = backend.get_file(file).await.map_err(io::Error::other)?;
    if upload.one_shot {
        metadata
            .update_file_status(file, FileStatus::Uploaded, FileStatus::Removed)
            .await
            .map_err(io::Error::other)?;
    }
    Ok(reader)
}

async fn write_archive(
    upload: &Upload,
    files: Vec<File>,
    metadata: Arc<dyn MetadataBackend>,
    backend: Arc<dyn DataBackend>,
    sender: mpsc::Sender<io::Result<Bytes>>,
) -> io::Result<()> {
    let writer = BufWriter::with_capacity(ARCHIVE_BUFFER_SIZE, ChannelWriter { sender });
    let mut zip = ZipWriter::new_stream(writer);
    let names = entry_names(&files);

    for (mut file, name) in files.into_iter().zip(names) {
        let options = entry_options(&file);
        zip = on_blocking(zip, move |zip| {
            zip.start_file(name, options).map_err(io::Error::other)
        })
        .await?;

        let reader = match open_entry(upload, &mut file, metadata.as_ref(), backend.as_ref()).await
        {
            Ok(reader) => reader,
            Err(err) => {
                // ZipWriter 析构时会写出目录区，只能在阻塞线程上释放。
                let _ = tokio::task::spawn_blocking(move || drop(zip)).await;
                return Err(err);
            }
        };
        let mut reader = SyncIoBridge::new(reader);
        zip = on_blocking(zip, move |zip| io::copy(&mut reader, zip).map(drop)).await?;
    }

    // 写端在这里释放，缓冲区中剩余的数据随之发出。
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        zip.finish().map_err(io::Error::other)?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}
