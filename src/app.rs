//! 路由与中间件装配。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::any::Any;
use std::net::SocketAddr;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::context::{AppState, context_middleware};
use crate::http::{add_security_headers, build_cors_layer, panic_response, render_internal_errors};
use crate::{archive, auth, download, ingest, upload, version, yubikey};

/// 文件路由：`/file/...` 与 `/stream/...` 共用同一组处理器。
fn file_routes(prefix: &str) -> Router {
    let file_path = format!("/{prefix}/{{upload_id}}/{{file_id}}/{{file_name}}");
    Router::new()
        .route(
            &file_path,
            get(download::get_file)
                .post(ingest::add_file)
                .delete(upload::remove_file),
        )
        .route(
            &format!("{file_path}/yubikey/{{yubikey}}"),
            get(download::get_file),
        )
        .route_layer(middleware::from_fn(yubikey::yubikey_middleware))
        .route_layer(middleware::from_fn(auth::file_middleware))
        .route_layer(middleware::from_fn(auth::upload_middleware))
}

fn upload_routes() -> Router {
    Router::new()
        .route(
            "/upload/{upload_id}",
            get(upload::get_upload).delete(upload::remove_upload),
        )
        .route("/file/{upload_id}", post(ingest::add_file))
        .route("/stream/{upload_id}", post(ingest::add_file))
        .route_layer(middleware::from_fn(auth::upload_middleware))
}

fn archive_routes() -> Router {
    Router::new()
        .route("/archive/{upload_id}/{file_name}", get(archive::get_archive))
        .route(
            "/archive/{upload_id}/{file_name}/yubikey/{yubikey}",
            get(archive::get_archive),
        )
        .route_layer(middleware::from_fn(yubikey::yubikey_middleware))
        .route_layer(middleware::from_fn(auth::upload_middleware))
}

/// 构建完整的应用路由。
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let debug = state.config.debug;

    let mut app = Router::new()
        .route("/", post(upload::quick_upload))
        .route("/version", get(version::get_version_info))
        .route("/config", get(version::get_config))
        .route("/healthz", get(version::healthz))
        .route("/upload", post(upload::create_upload))
        .merge(upload_routes())
        .merge(archive_routes())
        .merge(file_routes("file"))
        .merge(file_routes("stream"))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(auth::authenticate))
        .layer(middleware::from_fn(context_middleware))
        .layer(middleware::from_fn(render_internal_errors))
        .layer(middleware::from_fn(add_security_headers))
        .layer(Extension(state))
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| panic_response(panic, debug),
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                        upload_id = tracing::field::Empty,
                        file_id = tracing::field::Empty,
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use axum::http::{Method, Request, StatusCode};
    use std::io;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    use crate::data::{DataBackend, DataBackends, DataError, DataReader, DataResult, StorageMode};
    use crate::models::File;
    use crate::testing::{TestApp, body_string, multipart_request};

    /// 读完输入后总是报告写入失败的后端。
    struct BrokenBackend;

    #[async_trait]
    impl DataBackend for BrokenBackend {
        async fn add_file(&self, _file: &File, mut reader: DataReader) -> DataResult<()> {
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).await?;
            Err(DataError::Io(io::Error::other("disk on fire")))
        }

        async fn get_file(&self, file: &File) -> DataResult<DataReader> {
            Err(DataError::NotFound(file.id.clone()))
        }

        async fn remove_file(&self, _file: &File) -> DataResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn healthz_and_unknown_upload() {
        let app = TestApp::new().await;
        let response = app
            .send(
                Request::builder()
                    .uri("/healthz")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");

        let response = app
            .send(
                Request::builder()
                    .uri("/upload/doesnotexist")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "upload doesnotexist not found");
    }

    #[tokio::test]
    async fn expired_upload_is_not_found() {
        let app = TestApp::new().await;
        let mut upload = crate::models::Upload::new(60);
        upload.expire_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        crate::metadata::MetadataBackend::create_upload(app.metadata.as_ref(), &upload)
            .await
            .expect("create");

        let response = app
            .send(
                Request::builder()
                    .uri(format!("/upload/{}", upload.id))
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_string(response).await,
            format!("upload {} has expired", upload.id)
        );
    }

    #[tokio::test]
    async fn internal_errors_show_detail_only_in_debug() {
        for debug in [false, true] {
            let app = TestApp::with_config(|config| config.debug = debug)
                .await
                .with_data(DataBackends::new().with(StorageMode::Normal, Arc::new(BrokenBackend)));
            let upload = crate::models::Upload::new(3600);
            crate::metadata::MetadataBackend::create_upload(app.metadata.as_ref(), &upload)
                .await
                .expect("create");

            let response = app
                .send(multipart_request(
                    Method::POST,
                    &format!("/file/{}", upload.id),
                    upload.upload_token.as_deref(),
                    "a.txt",
                    b"data",
                ))
                .await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = body_string(response).await;
            if debug {
                assert_eq!(body, "unable to save file : disk on fire");
            } else {
                assert_eq!(body, "internal server error");
            }
        }
    }
}
