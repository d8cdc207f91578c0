//! 测试辅助：基于临时目录的完整应用实例与请求构造工具。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::http::{Method, Request, header};
use axum::response::Response;
use http_body_util::BodyExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::app::build_router;
use crate::auth::UPLOAD_TOKEN_HEADER;
use crate::config::{DEFAULT_STREAM_BUFFER_SIZE, RelayConfig};
use crate::context::AppState;
use crate::data::{DataBackends, FileBackend, StorageMode, StreamBackend};
use crate::metadata::MemoryMetadata;
use crate::models::File;
use crate::yubikey::OtpVerifier;

const BOUNDARY: &str = "axo-relay-test-boundary";

#[derive(Clone)]
pub struct TestApp {
    pub state: AppState,
    pub metadata: Arc<MemoryMetadata>,
    router: Router,
    data_root: PathBuf,
    _temp: Arc<TempDir>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut RelayConfig)) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_root = temp.path().join("files");
        let files = FileBackend::new(&data_root);
        files.ensure_root().await.expect("data root");

        let mut config = RelayConfig::default();
        configure(&mut config);

        let metadata = Arc::new(MemoryMetadata::new());
        let state = AppState {
            config: Arc::new(config),
            metadata: metadata.clone(),
            data: DataBackends::new()
                .with(StorageMode::Normal, Arc::new(files))
                .with(
                    StorageMode::Stream,
                    Arc::new(StreamBackend::new(DEFAULT_STREAM_BUFFER_SIZE)),
                ),
            otp: None,
        };
        let router = build_router(state.clone(), None);

        Self {
            state,
            metadata,
            router,
            data_root,
            _temp: Arc::new(temp),
        }
    }

    /// 替换数据后端注册表并重建路由。
    pub fn with_data(mut self, data: DataBackends) -> Self {
        self.state.data = data;
        self.router = build_router(self.state.clone(), None);
        self
    }

    pub fn with_otp(mut self, otp: Arc<dyn OtpVerifier>) -> Self {
        self.state.otp = Some(otp);
        self.router = build_router(self.state.clone(), None);
        self
    }

    pub async fn send(&self, request: Request<AxumBody>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|err| panic!("request failed: {err}"))
    }

    /// 文件在磁盘后端上的路径，文件不存在时返回 `None`。
    pub fn data_file_path(&self, file: &File) -> Option<PathBuf> {
        let shard: String = file.upload_id.chars().take(2).collect();
        let path = self
            .data_root
            .join(shard)
            .join(&file.upload_id)
            .join(&file.id);
        path.is_file().then_some(path)
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec()
}

pub async fn body_string(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).expect("utf-8 body")
}

pub fn multipart_request(
    method: Method,
    path: &str,
    upload_token: Option<&str>,
    file_name: &str,
    content: &[u8],
) -> Request<AxumBody> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    let mut builder = Request::builder().method(method).uri(path).header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
    );
    if let Some(token) = upload_token {
        builder = builder.header(UPLOAD_TOKEN_HEADER, token);
    }
    builder.body(AxumBody::from(body)).expect("multipart request")
}

pub fn json_request(method: Method, path: &str, body: &serde_json::Value) -> Request<AxumBody> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(AxumBody::from(body.to_string()))
        .expect("json request")
}
