//! 文件写入流水线。
//!
//! 请求任务负责解析 multipart 并把管道读端交给数据后端；独立的预处理任务
//! 从 multipart 字段读取数据块，识别 MIME、计数、计算 MD5 并执行大小限制，
//! 再把数据块写入有界管道。管道满时预处理任务阻塞，内存占用与文件大小无关。
//! 预处理结果通过 oneshot 通道在后端写入返回之后取回。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use bytes::Bytes;
use futures_util::stream;
use multer::{Field, Multipart};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::models::{File, FileStatus, MAX_FILE_NAME_LENGTH};
use crate::sniff;

/// 预处理任务的最终结果。
#[derive(Debug)]
struct Preprocessed {
    mime_type: String,
    size: u64,
    md5: String,
}

#[derive(Debug, Error)]
enum PreprocessError {
    #[error("file too big (limit is set to {0} bytes)")]
    TooBig(u64),
    #[error("unable to read data from request body : {0}")]
    Read(String),
    #[error("data backend stopped reading")]
    PipeClosed,
    #[error("request cancelled")]
    Cancelled,
}

type Pipe = mpsc::Sender<io::Result<Bytes>>;

/// 向上传添加文件：路径中带文件 ID 时写入预先声明的文件，否则新建文件槽位。
pub async fn add_file(
    Extension(ctx): Extension<Arc<RequestContext>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let upload = ctx.expect_upload();
    if !ctx.is_upload_admin() {
        return Err(ApiError::Forbidden(
            "you are not allowed to add file to this upload".into(),
        ));
    }

    let field = first_file_field(request).await?;
    let file_name = field
        .file_name()
        .map(str::to_string)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::missing("file name from multipart form"))?;
    if file_name.len() > MAX_FILE_NAME_LENGTH {
        return Err(ApiError::invalid("file name, too long"));
    }

    let mut file = match ctx.file() {
        Some(file) => {
            if file.name != file_name {
                return Err(ApiError::invalid("file name"));
            }
            file
        }
        None => {
            // 计数检查与创建之间不是原子的，并发添加可能略微超过上限。
            let count = ctx.metadata().count_upload_files(&upload.id).await?;
            let limit = ctx.config().max_file_per_upload;
            if count >= limit {
                return Err(ApiError::BadRequest(format!(
                    "maximum number file per upload reached, limit is {limit}"
                )));
            }
            let file = File::new(&upload.id, &file_name);
            ctx.metadata().create_file(&file).await?;
            file
        }
    };
    Span::current().record("file_id", file.id.as_str());

    if file.status != FileStatus::Missing {
        return Err(ApiError::BadRequest(format!(
            "invalid file status {}, expected {}",
            file.status,
            FileStatus::Missing
        )));
    }
    ctx.metadata()
        .update_file_status(&mut file, FileStatus::Missing, FileStatus::Uploading)
        .await?;

    let backend = ctx.data().for_upload(&upload)?;
    let (pipe, receiver) = mpsc::channel(ctx.config().pipe_capacity.max(1));
    let (result_tx, result_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    // 请求被丢弃（客户端断开）时通知预处理任务退出。
    let _cancel_on_drop = cancel.clone().drop_guard();

    tokio::spawn(preprocess(
        field,
        pipe,
        result_tx,
        ctx.max_file_size(),
        file_name,
        cancel,
    ));

    info!(file_id = %file.id, name = %file.name, stream = upload.stream, "receiving file");
    let stored = backend.add_file(&file, Box::new(pipe_reader(receiver))).await;
    let outcome = result_rx
        .await
        .map_err(|err| ApiError::internal("unable to get file preprocessing result", err))?;

    let preprocessed = match (stored, outcome) {
        (_, Err(PreprocessError::TooBig(limit))) => {
            warn!(file_id = %file.id, limit, "file too big");
            return Err(ApiError::PayloadTooLarge(
                PreprocessError::TooBig(limit).to_string(),
            ));
        }
        (_, Err(err @ PreprocessError::Read(_))) => {
            return Err(ApiError::internal("unable to read file", err));
        }
        (Err(err), _) => return Err(ApiError::internal("unable to save file", err)),
        (Ok(()), Err(err)) => return Err(ApiError::internal("unable to save file", err)),
        (Ok(()), Ok(preprocessed)) => preprocessed,
    };

    file.mime_type = preprocessed.mime_type;
    file.size = preprocessed.size;
    file.md5 = preprocessed.md5;
    file.status = if upload.stream {
        FileStatus::Deleted
    } else {
        FileStatus::Uploaded
    };
    ctx.metadata()
        .update_file(&file, FileStatus::Uploading)
        .await
        .map_err(|err| ApiError::internal("unable to update file metadata", err))?;
    info!(file_id = %file.id, size = file.size, md5 = %file.md5, "file stored");

    if ctx.is_quick() {
        let url = format!(
            "{}/file/{}/{}/{}\n",
            ctx.config().download_url_base(),
            upload.id,
            file.id,
            urlencoding::encode(&file.name)
        );
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            url,
        )
            .into_response());
    }
    Ok(JsonResponse(file).into_response())
}

/// 跳过其它表单字段，返回第一个名为 `file` 的字段。
async fn first_file_field(request: Request<AxumBody>) -> Result<Field<'static>, ApiError> {
    let boundary = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("multipart form : missing content type".into()))
        .and_then(|content_type| {
            multer::parse_boundary(content_type)
                .map_err(|err| ApiError::BadRequest(format!("multipart form : {err}")))
        })?;

    let mut multipart = Multipart::new(request.into_body().into_data_stream(), boundary);
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => return Ok(field),
            Ok(Some(field)) => debug!(name = ?field.name(), "skipping multipart field"),
            Ok(None) => return Err(ApiError::missing("file from multipart form")),
            Err(err) => return Err(ApiError::BadRequest(format!("multipart form : {err}"))),
        }
    }
}

/// 管道读端，数据后端按普通 `AsyncRead` 消费。
fn pipe_reader(
    mut receiver: mpsc::Receiver<io::Result<Bytes>>,
) -> StreamReader<impl futures_util::Stream<Item = io::Result<Bytes>> + Send + Unpin, Bytes> {
    StreamReader::new(stream::poll_fn(move |cx| receiver.poll_recv(cx)))
}

async fn preprocess(
    mut field: Field<'static>,
    pipe: Pipe,
    result: oneshot::Sender<Result<Preprocessed, PreprocessError>>,
    max_file_size: u64,
    file_name: String,
    cancel: CancellationToken,
) {
    let outcome = relay_chunks(&mut field, &pipe, max_file_size, &file_name, &cancel).await;
    if let Err(err) = &outcome {
        // 以错误关闭管道，后端必须放弃已写入的数据。
        let _ = pipe.send(Err(io::Error::other(err.to_string()))).await;
    }
    drop(pipe);
    let _ = result.send(outcome);
}

async fn relay_chunks(
    field: &mut Field<'static>,
    pipe: &Pipe,
    max_file_size: u64,
    file_name: &str,
    cancel: &CancellationToken,
) -> Result<Preprocessed, PreprocessError> {
    let mut digest = md5::Context::new();
    let mut size: u64 = 0;
    let mut mime_type = None;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(PreprocessError::Cancelled),
            chunk = field.chunk() => chunk,
        };
        let chunk = match chunk {
            Ok(Some(chunk)) if chunk.is_empty() => continue,
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => return Err(PreprocessError::Read(err.to_string())),
        };

        if mime_type.is_none() {
            mime_type = Some(sniff::sniff(&chunk, file_name));
        }
        size += chunk.len() as u64;
        if max_file_size > 0 && size > max_file_size {
            return Err(PreprocessError::TooBig(max_file_size));
        }
        digest.consume(&chunk);

        tokio::select! {
            _ = cancel.cancelled() => return Err(PreprocessError::Cancelled),
            sent = pipe.send(Ok(chunk)) => sent.map_err(|_| PreprocessError::PipeClosed)?,
        }
    }

    Ok(Preprocessed {
        mime_type: mime_type.unwrap_or_else(|| sniff::sniff(&[], file_name)),
        size,
        md5: format!("{:x}", digest.compute()),
    })
}
