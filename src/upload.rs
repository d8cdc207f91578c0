//! 上传容器的创建、查询与删除，以及单个文件的删除与快速上传。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::Extension;
use axum::http::Request;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use std::sync::Arc;
use tracing::{Span, error, info, warn};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::ingest;
use crate::models::{
    DEFAULT_LOGIN, File, FileStatus, MAX_FILE_NAME_LENGTH, Upload, UploadParams,
    encode_basic_credentials, hash_credentials,
};
use crate::yubikey::DEVICE_PREFIX_LENGTH;

/// 按服务端策略校验创建参数并生成上传记录（尚未持久化）。
pub fn build_upload(ctx: &RequestContext, params: UploadParams) -> Result<Upload, ApiError> {
    let config = ctx.config();

    if !ctx.is_whitelisted() {
        warn!(source_ip = ?ctx.source_ip(), "upload from untrusted source");
        return Err(ApiError::Forbidden("untrusted source IP address".into()));
    }
    let user = ctx.user();
    if config.no_anonymous_uploads && user.is_none() {
        return Err(ApiError::Forbidden("anonymous uploads are disabled".into()));
    }

    let ttl = if params.ttl == 0 {
        config.default_ttl
    } else {
        params.ttl
    };
    if ttl < -1 {
        return Err(ApiError::invalid(format!("ttl {ttl}")));
    }
    let max_ttl = ctx.max_ttl();
    if max_ttl > 0 {
        if ttl <= 0 {
            return Err(ApiError::BadRequest(format!(
                "cannot set infinite ttl (maximum allowed is {max_ttl})"
            )));
        }
        if ttl > max_ttl {
            return Err(ApiError::BadRequest(format!(
                "invalid ttl, maximum allowed is {max_ttl}"
            )));
        }
    }

    let mut upload = Upload::new(ttl);

    if params.one_shot && !config.one_shot {
        return Err(ApiError::BadRequest(
            "one shot uploads are not enabled".into(),
        ));
    }
    if params.stream && !config.stream_mode {
        return Err(ApiError::BadRequest("stream mode is not enabled".into()));
    }
    if params.removable && !config.removable {
        return Err(ApiError::BadRequest(
            "removable uploads are not enabled".into(),
        ));
    }
    upload.stream = params.stream;
    upload.one_shot = params.one_shot || params.stream;
    upload.removable = params.removable;

    if let Some(password) = params.password.filter(|password| !password.is_empty()) {
        if !config.protected_by_password {
            return Err(ApiError::BadRequest(
                "password protection is not enabled".into(),
            ));
        }
        let login = params
            .login
            .filter(|login| !login.is_empty())
            .unwrap_or_else(|| DEFAULT_LOGIN.to_string());
        upload.password = Some(hash_credentials(&encode_basic_credentials(
            &login, &password,
        )));
        upload.login = Some(login);
        upload.protected_by_password = true;
    }

    if let Some(prefix) = params.yubikey.filter(|prefix| !prefix.is_empty()) {
        if !config.protected_by_yubikey {
            return Err(ApiError::BadRequest(
                "yubikey are disabled on this server".into(),
            ));
        }
        if prefix.len() != DEVICE_PREFIX_LENGTH {
            return Err(ApiError::invalid("yubikey prefix"));
        }
        upload.yubikey = Some(prefix);
        upload.protected_by_yubikey = true;
    }

    if params.files.len() > config.max_file_per_upload {
        return Err(ApiError::BadRequest(format!(
            "too many files, limit is {}",
            config.max_file_per_upload
        )));
    }
    for declared in params.files {
        if declared.file_name.is_empty() {
            return Err(ApiError::missing("file name"));
        }
        if declared.file_name.len() > MAX_FILE_NAME_LENGTH {
            return Err(ApiError::invalid("file name, too long"));
        }
        let mut file = File::new(&upload.id, &declared.file_name);
        file.reference = declared.reference;
        upload.files.push(file);
    }

    upload.user = user.map(|user| user.id);
    upload.token = ctx.token().map(|token| token.token);
    upload.remote_ip = ctx.source_ip().map(|ip| ip.to_string());
    upload.comments = params.comments;
    Ok(upload)
}

/// 创建上传。管理令牌只在这次响应中返回。
pub async fn create_upload(
    Extension(ctx): Extension<Arc<RequestContext>>,
    body: Bytes,
) -> Result<JsonResponse<Upload>, ApiError> {
    let params: UploadParams = if body.iter().all(u8::is_ascii_whitespace) {
        UploadParams::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            ApiError::BadRequest(format!("unable to deserialize request body : {err}"))
        })?
    };

    let upload = build_upload(&ctx, params)?;
    ctx.metadata().create_upload(&upload).await?;
    Span::current().record("upload_id", upload.id.as_str());
    info!(
        upload_id = %upload.id,
        files = upload.files.len(),
        one_shot = upload.one_shot,
        stream = upload.stream,
        "upload created"
    );

    let upload_token = upload.upload_token.clone();
    let mut response = upload;
    response.sanitize();
    response.upload_token = upload_token;
    response.admin = true;
    Ok(JsonResponse(response))
}

/// 返回上传元数据及其文件列表。
pub async fn get_upload(
    Extension(ctx): Extension<Arc<RequestContext>>,
) -> Result<JsonResponse<Upload>, ApiError> {
    let mut upload = ctx.expect_upload();
    upload.files = ctx.metadata().get_files(&upload.id).await?;
    upload.sanitize();
    upload.admin = ctx.is_upload_admin();
    Ok(JsonResponse(upload))
}

/// 删除数据后端中的字节并把文件推进到 `deleted`，失败只记录日志。
async fn purge_file(ctx: &RequestContext, upload: &Upload, file: &mut File) {
    let backend = match ctx.data().for_upload(upload) {
        Ok(backend) => backend,
        Err(err) => {
            error!(file_id = %file.id, error = %err, "unable to purge file");
            return;
        }
    };
    if let Err(err) = backend.remove_file(file).await {
        error!(file_id = %file.id, error = %err, "unable to delete file from data backend");
        return;
    }
    if let Err(err) = ctx
        .metadata()
        .update_file_status(file, FileStatus::Removed, FileStatus::Deleted)
        .await
    {
        error!(file_id = %file.id, error = %err, "unable to mark file as deleted");
    }
}

fn ensure_can_remove(ctx: &RequestContext, upload: &Upload, what: &str) -> Result<(), ApiError> {
    if ctx.is_upload_admin() || upload.removable {
        return Ok(());
    }
    Err(ApiError::Forbidden(format!(
        "you are not allowed to remove {what}"
    )))
}

/// 删除整个上传，其下已上传的文件随后被清理。
pub async fn remove_upload(
    Extension(ctx): Extension<Arc<RequestContext>>,
) -> Result<Response, ApiError> {
    let upload = ctx.expect_upload();
    ensure_can_remove(&ctx, &upload, "this upload")?;

    let files = ctx.metadata().get_files(&upload.id).await?;
    ctx.metadata().remove_upload(&upload.id).await?;
    info!(upload_id = %upload.id, "upload removed");

    for mut file in files {
        if matches!(file.status, FileStatus::Uploading | FileStatus::Uploaded) {
            file.status = FileStatus::Removed;
            purge_file(&ctx, &upload, &mut file).await;
        }
    }
    Ok("ok".into_response())
}

/// 删除单个文件。
pub async fn remove_file(
    Extension(ctx): Extension<Arc<RequestContext>>,
) -> Result<Response, ApiError> {
    let upload = ctx.expect_upload();
    let mut file = ctx.expect_file();
    ensure_can_remove(&ctx, &upload, "files from this upload")?;

    ctx.metadata().remove_file(&mut file).await?;
    info!(file_id = %file.id, status = %file.status, "file removed");
    if file.status == FileStatus::Removed {
        purge_file(&ctx, &upload, &mut file).await;
    }
    Ok("ok".into_response())
}

/// 快速上传：一次请求内创建上传并写入文件，响应为下载链接。
pub async fn quick_upload(
    Extension(ctx): Extension<Arc<RequestContext>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let upload = build_upload(&ctx, UploadParams::default())?;
    ctx.metadata().create_upload(&upload).await?;
    Span::current().record("upload_id", upload.id.as_str());
    info!(upload_id = %upload.id, "quick upload created");

    ctx.set_upload(upload);
    ctx.set_upload_admin(true);
    ctx.set_quick(true);
    ingest::add_file(Extension(ctx), request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method, StatusCode, header};

    use crate::auth::{API_TOKEN_HEADER, IMPERSONATE_HEADER, UPLOAD_TOKEN_HEADER};
    use crate::metadata::MetadataBackend;
    use crate::models::{Token, User};
    use crate::testing::{TestApp, body_string, json_request, multipart_request};

    async fn create(app: &TestApp, body: serde_json::Value, headers: &[(&str, &str)]) -> Response {
        let mut request = json_request(Method::POST, "/upload", &body);
        for (name, value) in headers {
            request.headers_mut().insert(
                header::HeaderName::from_bytes(name.as_bytes()).expect("name"),
                HeaderValue::from_str(value).expect("value"),
            );
        }
        app.send(request).await
    }

    async fn created(response: Response) -> Upload {
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_string(response).await).expect("upload json")
    }

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> Request<AxumBody> {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(AxumBody::empty()).expect("request")
    }

    async fn seed_user(app: &TestApp, id: &str, token: &str, admin: bool) {
        app.metadata
            .create_user(&User {
                id: id.into(),
                login: id.into(),
                admin,
                ..Default::default()
            })
            .await
            .expect("user");
        app.metadata
            .create_token(&Token {
                token: token.into(),
                user_id: id.into(),
                comment: String::new(),
            })
            .await
            .expect("token");
    }

    #[tokio::test]
    async fn create_returns_admin_token_once() {
        let app = TestApp::new().await;
        let upload = created(
            create(
                &app,
                serde_json::json!({"files": [{"fileName": "a.txt", "reference": "1"}]}),
                &[],
            )
            .await,
        )
        .await;
        assert!(upload.admin);
        let token = upload.upload_token.clone().expect("upload token");
        assert_eq!(upload.files.len(), 1);
        assert_eq!(upload.files[0].status, FileStatus::Missing);
        assert_eq!(upload.ttl, app.state.config.default_ttl);

        let response = app
            .send(request(Method::GET, &format!("/upload/{}", upload.id), &[]))
            .await;
        let fetched = created(response).await;
        assert!(fetched.upload_token.is_none());
        assert!(!fetched.admin);
        assert_eq!(fetched.files.len(), 1);

        let response = app
            .send(request(
                Method::GET,
                &format!("/upload/{}", upload.id),
                &[(UPLOAD_TOKEN_HEADER, &token)],
            ))
            .await;
        assert!(created(response).await.admin);
    }

    #[tokio::test]
    async fn ttl_and_features_are_validated() {
        let app = TestApp::with_config(|config| {
            config.max_ttl = 3600;
            config.removable = false;
        })
        .await;

        let response = create(&app, serde_json::json!({"ttl": -1}), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_string(response).await,
            "cannot set infinite ttl (maximum allowed is 3600)"
        );

        let response = create(&app, serde_json::json!({"ttl": 7200}), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = create(&app, serde_json::json!({"removable": true}), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = create(&app, serde_json::json!({"yubikey": "cccccccccccc"}), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let upload = created(create(&app, serde_json::json!({"ttl": 60, "stream": true}), &[]).await).await;
        assert!(upload.stream);
        assert!(upload.one_shot);
        assert_eq!(upload.ttl, 60);
    }

    #[tokio::test]
    async fn whitelist_and_anonymous_policy() {
        let app = TestApp::with_config(|config| {
            config.upload_whitelist = vec!["10.0.0.0/8".parse().expect("network")];
        })
        .await;
        let response = create(&app, serde_json::json!({}), &[]).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, "untrusted source IP address");

        let app = TestApp::with_config(|config| config.no_anonymous_uploads = true).await;
        let response = create(&app, serde_json::json!({}), &[]).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        seed_user(&app, "alice", "alice-token", false).await;
        let upload = created(
            create(&app, serde_json::json!({}), &[(API_TOKEN_HEADER, "alice-token")]).await,
        )
        .await;
        let stored = app
            .metadata
            .get_upload(&upload.id)
            .await
            .expect("get")
            .expect("upload");
        assert_eq!(stored.user.as_deref(), Some("alice"));
        assert_eq!(stored.token.as_deref(), Some("alice-token"));
    }

    #[tokio::test]
    async fn password_protected_upload_requires_credentials() {
        let app = TestApp::new().await;
        let upload = created(
            create(
                &app,
                serde_json::json!({"login": "plik", "password": "secret"}),
                &[],
            )
            .await,
        )
        .await;
        assert!(upload.protected_by_password);
        assert!(upload.password.is_none());
        let path = format!("/upload/{}", upload.id);

        let response = app.send(request(Method::GET, &path, &[])).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            r#"Basic realm="axo-relay""#
        );

        let response = app
            .send(request(
                Method::GET,
                &path,
                &[("authorization", "Digest cGxpazpzZWNyZXQ=")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .send(request(
                Method::GET,
                &path,
                &[("authorization", "Basic cGxpazpzZWNyZXQ=")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let token = upload.upload_token.expect("upload token");
        let response = app
            .send(request(Method::GET, &path, &[(UPLOAD_TOKEN_HEADER, &token)]))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scoping_token_is_admin_for_other_acting_user() {
        let app = TestApp::new().await;
        seed_user(&app, "user-a", "token-a", false).await;
        seed_user(&app, "user-b", "token-t", false).await;
        seed_user(&app, "root", "token-root", true).await;

        let mut upload = Upload::new(3600);
        upload.user = Some("user-a".into());
        upload.token = Some("token-t".into());
        app.metadata.create_upload(&upload).await.expect("create");
        let path = format!("/upload/{}", upload.id);

        let response = app
            .send(request(Method::GET, &path, &[(API_TOKEN_HEADER, "token-t")]))
            .await;
        assert!(created(response).await.admin);

        let response = app
            .send(request(Method::GET, &path, &[(API_TOKEN_HEADER, "token-a")]))
            .await;
        assert!(created(response).await.admin);

        let response = app.send(request(Method::GET, &path, &[])).await;
        assert!(!created(response).await.admin);

        let response = app
            .send(request(
                Method::GET,
                &path,
                &[(API_TOKEN_HEADER, "token-b-unknown")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .send(request(
                Method::GET,
                &path,
                &[(API_TOKEN_HEADER, "token-t"), (IMPERSONATE_HEADER, "user-a")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .send(request(
                Method::GET,
                &path,
                &[
                    (API_TOKEN_HEADER, "token-root"),
                    (IMPERSONATE_HEADER, "user-b"),
                ],
            ))
            .await;
        assert!(created(response).await.admin);
    }

    #[tokio::test]
    async fn remove_file_purges_bytes() {
        let app = TestApp::new().await;
        let upload = created(
            create(&app, serde_json::json!({"files": [{"fileName": "a.txt"}]}), &[]).await,
        )
        .await;
        let token = upload.upload_token.clone().expect("upload token");
        let file = upload.files[0].clone();
        let path = format!("/file/{}/{}/{}", upload.id, file.id, file.name);

        let response = app
            .send(multipart_request(Method::POST, &path, Some(&token), "a.txt", b"bytes"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.send(request(Method::DELETE, &path, &[])).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .send(request(Method::DELETE, &path, &[(UPLOAD_TOKEN_HEADER, &token)]))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let stored = app.metadata.get_file(&file.id).await.expect("get").expect("file");
        assert_eq!(stored.status, FileStatus::Deleted);
        assert!(app.data_file_path(&stored).is_none());

        let response = app.send(request(Method::GET, &path, &[])).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn removable_upload_can_be_removed_by_anyone() {
        let app = TestApp::new().await;
        let upload = created(
            create(
                &app,
                serde_json::json!({"removable": true, "files": [{"fileName": "a.txt"}]}),
                &[],
            )
            .await,
        )
        .await;
        let file = upload.files[0].clone();

        let response = app
            .send(request(Method::DELETE, &format!("/upload/{}", upload.id), &[]))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .send(request(Method::GET, &format!("/upload/{}", upload.id), &[]))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let stored = app.metadata.get_file(&file.id).await.expect("get").expect("file");
        assert_eq!(stored.status, FileStatus::Deleted);
    }

    #[tokio::test]
    async fn quick_upload_url_escapes_file_name() {
        let app = TestApp::with_config(|config| {
            config.server_url = Some("https://relay.example.com".into());
        })
        .await;
        let response = app
            .send(multipart_request(
                Method::POST,
                "/",
                None,
                "my file#1.txt",
                b"quick",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let url = body_string(response).await;
        assert!(url.ends_with("/my%20file%231.txt\n"), "{url}");

        let path = url.trim_end().trim_start_matches("https://relay.example.com");
        let response = app.send(request(Method::GET, path, &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "quick");
    }

    #[tokio::test]
    async fn quick_upload_returns_download_url() {
        let app = TestApp::with_config(|config| {
            config.server_url = Some("https://relay.example.com".into());
        })
        .await;
        let response = app
            .send(multipart_request(Method::POST, "/", None, "note.txt", b"quick"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let url = body_string(response).await;
        assert!(url.starts_with("https://relay.example.com/file/"));
        assert!(url.ends_with("/note.txt\n"));

        let path = url.trim_end().trim_start_matches("https://relay.example.com");
        let response = app.send(request(Method::GET, path, &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "quick");
    }
}
