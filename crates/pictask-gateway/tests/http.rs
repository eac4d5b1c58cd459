use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use pictask_core::lite::jwt::{CommitCapability, Hs256CommitCapabilityConfig};
use pictask_core::lite::memqueue::MemQueue;
use pictask_core::{CommitRequest, Signer, TaskId, COMMIT_CAPABILITY_HEADER};
use pictask_gateway::identity::{IdentityConfig, IdentityStore, MAX_PASSWORD_BYTES};
use pictask_gateway::store::TaskState;
use pictask_gateway::{router, AppState, GatewayConfig, GatewayServer, DEADLINE_EXCEEDED};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::util::ServiceExt;

const BOUNDARY: &str = "pictask-test-boundary";

struct Harness {
    app: axum::Router,
    state: AppState,
    signer: CommitCapability,
}

fn signer() -> anyhow::Result<CommitCapability> {
    Ok(CommitCapability::from_hs256_config(
        Hs256CommitCapabilityConfig {
            issuer: "pictask-worker".to_string(),
            audience: "pictask.commit".to_string(),
            current_kid: "test".to_string(),
            current_secret: "test-secret".to_string(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(60),
        },
    )?)
}

fn setup_with(cfg: GatewayConfig) -> anyhow::Result<Harness> {
    let signer = signer()?;
    let identity = IdentityStore::new(IdentityConfig {
        bcrypt_cost: 4,
        session_ttl: None,
    })?;
    let verifier: Arc<dyn Signer> = Arc::new(signer.clone());
    let state = AppState::new(cfg, Arc::new(MemQueue::new()), identity, Some(verifier));
    Ok(Harness {
        app: router(state.clone()),
        state,
        signer,
    })
}

fn setup() -> anyhow::Result<Harness> {
    setup_with(GatewayConfig::default())
}

async fn send(
    app: &axum::Router,
    request: Request<Body>,
) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, headers, bytes))
}

fn json_request(
    method: &str,
    uri: &str,
    session: Option<&str>,
    body: &serde_json::Value,
) -> anyhow::Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {session}"));
    }
    Ok(builder.body(Body::from(serde_json::to_vec(body)?))?)
}

fn get_request(uri: &str, session: Option<&str>) -> anyhow::Result<Request<Body>> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(session) = session {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {session}"));
    }
    Ok(builder.body(Body::empty())?)
}

fn commit_request(commit: &CommitRequest, token: Option<&str>) -> anyhow::Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/internal/commit")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(COMMIT_CAPABILITY_HEADER, token);
    }
    Ok(builder.body(Body::from(serde_json::to_vec(commit)?))?)
}

fn multipart_request(session: &str, image: &[u8], filter: &str) -> anyhow::Result<Request<Body>> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"image\"; filename=\"in.png\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(image);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"filtername\"\r\n\r\n");
    body.extend_from_slice(filter.as_bytes());
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Ok(Request::builder()
        .method("POST")
        .uri("/task")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::AUTHORIZATION, format!("Bearer {session}"))
        .body(Body::from(body))?)
}

async fn register_and_login(app: &axum::Router, username: &str) -> anyhow::Result<String> {
    let creds = serde_json::json!({ "username": username, "password": "secret" });
    let (status, _, _) = send(app, json_request("POST", "/register", None, &creds)?).await?;
    anyhow::ensure!(status == StatusCode::CREATED, "register: {status}");

    let (status, headers, _) = send(app, json_request("POST", "/login", None, &creds)?).await?;
    anyhow::ensure!(status == StatusCode::OK, "login: {status}");
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| anyhow::anyhow!("login did not return a bearer token"))?;
    Ok(bearer.to_string())
}

async fn submit_json(app: &axum::Router, session: &str, image: &[u8]) -> anyhow::Result<TaskId> {
    use base64::Engine as _;
    let body = serde_json::json!({
        "image_base64": base64::engine::general_purpose::STANDARD.encode(image),
        "filter_name": "blur",
    });
    let (status, _, bytes) = send(app, json_request("POST", "/task", Some(session), &body)?).await?;
    anyhow::ensure!(status == StatusCode::OK, "submit: {status}");
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    let task_id = body["task_id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing task_id in {body}"))?;
    Ok(TaskId::from(task_id))
}

async fn status_of(app: &axum::Router, session: &str, task_id: &TaskId) -> anyhow::Result<String> {
    let uri = format!("/status/{task_id}");
    let (status, _, bytes) = send(app, get_request(&uri, Some(session))?).await?;
    anyhow::ensure!(status == StatusCode::OK, "status: {status}");
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    Ok(body["status"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn register_login_and_submit() -> anyhow::Result<()> {
    let h = setup()?;
    let creds = serde_json::json!({ "username": "alice", "password": "secret" });

    let (status, _, _) = send(&h.app, json_request("POST", "/register", None, &creds)?).await?;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) = send(&h.app, json_request("POST", "/register", None, &creds)?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(body["error"].as_str(), Some("user already exists"));

    let wrong = serde_json::json!({ "username": "alice", "password": "wrong" });
    let (status, headers, _) = send(&h.app, json_request("POST", "/login", None, &wrong)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.get(header::AUTHORIZATION).is_none());

    let (status, headers, _) = send(&h.app, json_request("POST", "/login", None, &creds)?).await?;
    assert_eq!(status, StatusCode::OK);
    let session = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing bearer"))?;

    let task_id = submit_json(&h.app, &session, &[9u8; 10]).await?;
    assert_eq!(status_of(&h.app, &session, &task_id).await?, "in_progress");
    Ok(())
}

#[tokio::test]
async fn register_rejects_missing_fields_and_bad_json() -> anyhow::Result<()> {
    let h = setup()?;

    let missing = serde_json::json!({ "username": "bob" });
    let (status, _, _) = send(&h.app, json_request("POST", "/register", None, &missing)?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))?;
    let (status, _, _) = send(&h.app, request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn client_endpoints_require_a_session() -> anyhow::Result<()> {
    let h = setup()?;
    let body = serde_json::json!({ "image_base64": "AAEC", "filter_name": "blur" });

    let (status, _, _) = send(&h.app, json_request("POST", "/task", None, &body)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&h.app, json_request("POST", "/task", Some("forged"), &body)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&h.app, get_request("/status/t1", None)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&h.app, get_request("/result/t1", Some("forged"))?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn unknown_task_is_not_found() -> anyhow::Result<()> {
    let h = setup()?;
    let session = register_and_login(&h.app, "carol").await?;

    let (status, _, _) = send(&h.app, get_request("/status/ghost", Some(&session))?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&h.app, get_request("/result/ghost", Some(&session))?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn multipart_submit_then_commit_serves_result_bytes() -> anyhow::Result<()> {
    let h = setup()?;
    let session = register_and_login(&h.app, "dave").await?;

    let (status, _, bytes) = send(&h.app, multipart_request(&session, &[7u8; 10], "blur")?).await?;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    let task_id = TaskId::from(body["task_id"].as_str().unwrap_or_default());

    let (status, _, _) = send(&h.app, get_request(&format!("/result/{task_id}"), Some(&session))?)
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND, "result must not be served before ready");

    let result: Vec<u8> = (100u8..120).collect();
    let token = h.signer.issue(&task_id)?;
    let commit = CommitRequest::ready(task_id.clone(), &result);
    let (status, _, body) = send(&h.app, commit_request(&commit, Some(&token))?).await?;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(body["disposition"].as_str(), Some("applied"));

    assert_eq!(status_of(&h.app, &session, &task_id).await?, "ready");
    let (status, headers, bytes) =
        send(&h.app, get_request(&format!("/result/{task_id}"), Some(&session))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/octet-stream")
    );
    assert_eq!(bytes.to_vec(), result);
    Ok(())
}

#[tokio::test]
async fn multipart_without_filter_name_is_rejected() -> anyhow::Result<()> {
    let h = setup()?;
    let session = register_and_login(&h.app, "erin").await?;

    let (status, _, _) = send(&h.app, multipart_request(&session, &[1u8; 4], "")?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn oversized_upload_is_rejected() -> anyhow::Result<()> {
    let h = setup_with(GatewayConfig {
        max_upload_bytes: 1024,
        ..GatewayConfig::default()
    })?;
    let session = register_and_login(&h.app, "frank").await?;

    use base64::Engine as _;
    let body = serde_json::json!({
        "image_base64": base64::engine::general_purpose::STANDARD.encode([0u8; 4096]),
        "filter_name": "blur",
    });
    let (status, _, _) = send(&h.app, json_request("POST", "/task", Some(&session), &body)?).await?;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    Ok(())
}

#[tokio::test]
async fn commit_requires_matching_capability() -> anyhow::Result<()> {
    let h = setup()?;
    let session = register_and_login(&h.app, "grace").await?;
    let task_id = submit_json(&h.app, &session, b"abc").await?;
    let commit = CommitRequest::ready(task_id.clone(), b"out");

    let (status, _, _) = send(&h.app, commit_request(&commit, None)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&h.app, commit_request(&commit, Some("not-a-jwt"))?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let other = h.signer.issue(&TaskId::from("someone-else"))?;
    let (status, _, _) = send(&h.app, commit_request(&commit, Some(&other))?).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(status_of(&h.app, &session, &task_id).await?, "in_progress");
    Ok(())
}

#[tokio::test]
async fn commit_dispositions_map_to_statuses() -> anyhow::Result<()> {
    let h = setup()?;
    let session = register_and_login(&h.app, "heidi").await?;
    let task_id = submit_json(&h.app, &session, b"abc").await?;
    let token = h.signer.issue(&task_id)?;

    let commit = CommitRequest::ready(task_id.clone(), b"out");
    let (status, _, _) = send(&h.app, commit_request(&commit, Some(&token))?).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&h.app, commit_request(&commit, Some(&token))?).await?;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(body["disposition"].as_str(), Some("duplicate"));

    let late = CommitRequest::failed(task_id.clone(), "late failure");
    let (status, _, _) = send(&h.app, commit_request(&late, Some(&token))?).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(status_of(&h.app, &session, &task_id).await?, "ready");

    let ghost = TaskId::from("ghost");
    let ghost_token = h.signer.issue(&ghost)?;
    let (status, _, _) = send(
        &h.app,
        commit_request(&CommitRequest::failed(ghost, "x"), Some(&ghost_token))?,
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(&h.app, get_request("/status/ghost", Some(&session))?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND, "commit must not create tasks");
    Ok(())
}

#[tokio::test]
async fn register_rejects_passwords_past_bcrypt_limit() -> anyhow::Result<()> {
    let h = setup()?;
    let creds = serde_json::json!({
        "username": "ivan",
        "password": format!("{}-suffix", "p".repeat(MAX_PASSWORD_BYTES)),
    });
    let (status, _, body) = send(&h.app, json_request("POST", "/register", None, &creds)?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(body["error"].as_str(), Some("password too long"));
    Ok(())
}

#[tokio::test]
async fn commit_is_not_bound_by_upload_limit() -> anyhow::Result<()> {
    let h = setup_with(GatewayConfig {
        max_upload_bytes: 1024,
        ..GatewayConfig::default()
    })?;
    let session = register_and_login(&h.app, "judy").await?;
    let task_id = submit_json(&h.app, &session, b"abc").await?;

    // Filtered output routinely outgrows the upload once PNG-encoded and base64-wrapped.
    let result: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let token = h.signer.issue(&task_id)?;
    let commit = CommitRequest::ready(task_id.clone(), &result);
    let (status, _, _) = send(&h.app, commit_request(&commit, Some(&token))?).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _, bytes) =
        send(&h.app, get_request(&format!("/result/{task_id}"), Some(&session))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes.to_vec(), result);
    Ok(())
}

#[tokio::test]
async fn oversized_commit_is_payload_too_large() -> anyhow::Result<()> {
    let h = setup_with(GatewayConfig {
        max_commit_bytes: 1024,
        ..GatewayConfig::default()
    })?;
    let session = register_and_login(&h.app, "ken").await?;
    let task_id = submit_json(&h.app, &session, b"abc").await?;

    let token = h.signer.issue(&task_id)?;
    let commit = CommitRequest::ready(task_id.clone(), &[5u8; 4096]);
    let (status, _, _) = send(&h.app, commit_request(&commit, Some(&token))?).await?;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(status_of(&h.app, &session, &task_id).await?, "in_progress");
    Ok(())
}

#[tokio::test]
async fn reaper_fails_tasks_past_their_deadline() -> anyhow::Result<()> {
    let h = setup_with(GatewayConfig {
        reaper_poll: Duration::from_millis(10),
        task_deadline: Some(Duration::from_millis(50)),
        ..GatewayConfig::default()
    })?;
    let server =
        GatewayServer::start(h.state.clone(), SocketAddr::from(([127, 0, 0, 1], 0)), true).await?;

    let session = register_and_login(&h.app, "lena").await?;
    let task_id = submit_json(&h.app, &session, b"abc").await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = status_of(&h.app, &session, &task_id).await?;
        if status == "failed" {
            break;
        }
        anyhow::ensure!(status == "in_progress", "unexpected status {status}");
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "reaper never failed the task");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = h
        .state
        .gateway
        .store()
        .get(&task_id)
        .ok_or_else(|| anyhow::anyhow!("task disappeared"))?;
    assert_eq!(
        record.state,
        TaskState::Failed {
            error: Some(DEADLINE_EXCEEDED.to_string())
        }
    );

    let token = h.signer.issue(&task_id)?;
    let late = CommitRequest::ready(task_id.clone(), b"too late");
    let (status, _, _) = send(&h.app, commit_request(&late, Some(&token))?).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(status_of(&h.app, &session, &task_id).await?, "failed");

    server.shutdown().await?;
    Ok(())
}
