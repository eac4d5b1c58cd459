//! pictask dispatch gateway.
//!
//! Exposes the client endpoints (register, login, submit, status, result) backed by the volatile
//! task and identity stores, plus the worker-only commit endpoint that moves a task from
//! `in_progress` to a terminal state.

pub mod identity;
pub mod lifecycle;
pub mod store;

use anyhow::Context;
use axum::{
    extract::{
        multipart::MultipartError, rejection::JsonRejection, DefaultBodyLimit, FromRequest,
        Multipart, Path, Request, State,
    },
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use identity::{IdentityError, IdentityStore, UserId};
use lifecycle::{CommitError, Gateway, LifecycleConfig, SubmitError};
use pictask_core::{
    decode_base64_payload, CommitRequest, Queue, Signer, TaskId, TaskStatus,
    COMMIT_CAPABILITY_HEADER, DEFAULT_FILTER_QUEUE,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{CommitDisposition, TaskStore};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Commit bodies carry a base64 PNG, which can be several times larger than the uploaded image.
pub const DEFAULT_MAX_COMMIT_BYTES: usize = 128 * 1024 * 1024;

/// Error text recorded on tasks failed by the deadline reaper.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub queue_name: String,
    pub publish_timeout: Duration,
    /// Body limit for `POST /task`.
    pub max_upload_bytes: usize,
    /// Body limit for the worker-only `POST /internal/commit`.
    pub max_commit_bytes: usize,
    pub reaper_poll: Duration,

    /// Tasks still `in_progress` after this long are failed. `None` disables the check.
    pub task_deadline: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_FILTER_QUEUE.to_string(),
            publish_timeout: Duration::from_secs(5),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_commit_bytes: DEFAULT_MAX_COMMIT_BYTES,
            reaper_poll: Duration::from_secs(1),
            task_deadline: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub identity: Arc<IdentityStore>,
    /// `None` accepts unauthenticated commits (local development only).
    pub commit_verifier: Option<Arc<dyn Signer>>,
    pub cfg: GatewayConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gateway", &self.gateway)
            .field("identity", &self.identity)
            .field("commit_verifier", &self.commit_verifier.is_some())
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl AppState {
    pub fn new(
        cfg: GatewayConfig,
        queue: Arc<dyn Queue>,
        identity: IdentityStore,
        commit_verifier: Option<Arc<dyn Signer>>,
    ) -> Self {
        let gateway = Gateway::new(
            Arc::new(TaskStore::new()),
            queue,
            LifecycleConfig {
                queue_name: cfg.queue_name.clone(),
                publish_timeout: cfg.publish_timeout,
            },
        );
        Self {
            gateway,
            identity: Arc::new(identity),
            commit_verifier,
            cfg,
        }
    }
}

#[derive(Debug)]
pub struct GatewayServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl GatewayServer {
    pub async fn start(
        state: AppState,
        bind: SocketAddr,
        enable_reaper: bool,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind gateway to {bind}"))?;
        let addr = listener.local_addr().context("gateway local_addr")?;

        if state.commit_verifier.is_none() {
            tracing::warn!(
                event = "pictask.gateway.commit.unauthenticated",
                "commit capability verification disabled; any caller can commit task results"
            );
        }

        let state = Arc::new(state);
        let app = build_router(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_gateway(
            listener,
            app,
            state,
            shutdown_tx.clone(),
            shutdown_rx,
            enable_reaper,
        ));

        tracing::info!(
            event = "pictask.gateway.started",
            addr = %addr,
            "gateway listening"
        );

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join gateway task")??;
        Ok(())
    }
}

async fn run_gateway(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    enable_reaper: bool,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<anyhow::Result<()>>>::new();
    if enable_reaper {
        bg.push(tokio::spawn(reaper_loop(state.clone(), shutdown_rx.clone())));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    let server_res = server.await;
    let _ = shutdown_tx.send(true);

    for h in bg {
        let _ = h.await;
    }

    server_res.context("gateway serve")?;
    Ok(())
}

/// Router over the given state, without binding a listener.
pub fn router(state: AppState) -> Router {
    build_router(Arc::new(state))
}

fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.cfg.max_upload_bytes);
    let commit_limit = DefaultBodyLimit::max(state.cfg.max_commit_bytes);
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/task", post(submit_task).layer(upload_limit))
        .route("/status/:task_id", get(task_status))
        .route("/result/:task_id", get(task_result))
        .route("/internal/commit", post(commit_task).layer(commit_limit))
        .with_state(state)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// JSON alternative to the multipart upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageRequest {
    pub image_base64: String,
    pub filter_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub disposition: CommitDisposition,
}

async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AuthUserRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = payload.map_err(|_| ApiError::bad_request("invalid request body"))?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("missing username or password"));
    }

    match state.identity.register(&req.username, &req.password).await {
        Ok(user_id) => {
            tracing::info!(
                event = "pictask.gateway.user.registered",
                user_id = %user_id,
                "user registered"
            );
            Ok(StatusCode::CREATED)
        }
        Err(IdentityError::AlreadyExists) => Err(ApiError::bad_request("user already exists")),
        Err(IdentityError::PasswordTooLong) => Err(ApiError::bad_request("password too long")),
        Err(err) => Err(ApiError::internal(err)),
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AuthUserRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, [(HeaderName, String); 1])> {
    let Json(req) = payload.map_err(|_| ApiError::bad_request("invalid request body"))?;

    let user_id = state
        .identity
        .authenticate(&req.username, &req.password)
        .await
        .map_err(|err| match err {
            IdentityError::InvalidCredentials => {
                ApiError::unauthorized("invalid username or password")
            }
            other => ApiError::internal(other),
        })?;

    let session_id = state.identity.create_session(&user_id);
    tracing::debug!(
        event = "pictask.gateway.user.login",
        user_id = %user_id,
        "session created"
    );
    Ok((
        StatusCode::OK,
        [(header::AUTHORIZATION, format!("Bearer {session_id}"))],
    ))
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<TaskResponse>> {
    let user_id = require_session(&state.identity, &headers)?;
    let upload = read_upload(request).await?;

    let task_id = state
        .gateway
        .submit(&upload.image, &upload.filter_name)
        .await
        .map_err(|err| match err {
            SubmitError::EmptyPayload => ApiError::bad_request("missing image"),
            SubmitError::MissingOperation => ApiError::bad_request("missing filter name"),
            SubmitError::Unavailable(_) => ApiError::unavailable("task queue unavailable"),
            SubmitError::Encode(err) => ApiError::internal(err),
        })?;

    tracing::debug!(
        event = "pictask.gateway.task.accepted",
        user_id = %user_id,
        task_id = %task_id,
        "task accepted"
    );
    Ok(Json(TaskResponse { task_id }))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    require_session(&state.identity, &headers)?;
    let status = state
        .gateway
        .status(&TaskId::from(task_id))
        .ok_or_else(|| ApiError::not_found("task not found"))?;
    Ok(Json(StatusResponse { status }))
}

async fn task_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<([(HeaderName, &'static str); 1], Vec<u8>)> {
    require_session(&state.identity, &headers)?;
    let bytes = state
        .gateway
        .result(&TaskId::from(task_id))
        .ok_or_else(|| ApiError::not_found("result not found"))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

async fn commit_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CommitRequest>, JsonRejection>,
) -> ApiResult<Json<CommitResponse>> {
    let Json(req) = payload.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            tracing::warn!(
                event = "pictask.gateway.commit.too_large",
                "commit body exceeds max_commit_bytes"
            );
            ApiError::payload_too_large("commit body too large")
        } else {
            ApiError::bad_request("invalid commit body")
        }
    })?;
    if let Some(verifier) = &state.commit_verifier {
        require_commit_capability(verifier.as_ref(), &headers, &req.id)?;
    }

    let task_id = req.id.clone();
    let disposition = state.gateway.commit(req).map_err(|err| {
        tracing::warn!(
            event = "pictask.gateway.commit.invalid",
            task_id = %task_id,
            error = %err,
            "invalid commit"
        );
        match err {
            CommitError::NotTerminal => ApiError::bad_request("commit status must be terminal"),
            CommitError::MissingResult => ApiError::bad_request("missing result"),
            CommitError::InvalidResult(_) => ApiError::bad_request("invalid result encoding"),
        }
    })?;

    match disposition {
        CommitDisposition::Applied | CommitDisposition::Duplicate => {
            Ok(Json(CommitResponse { disposition }))
        }
        CommitDisposition::Conflict => Err(ApiError::conflict("task already has an outcome")),
        CommitDisposition::Unknown => Err(ApiError::conflict("unknown task")),
    }
}

struct Upload {
    image: Vec<u8>,
    filter_name: String,
}

async fn read_upload(request: Request) -> ApiResult<Upload> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if is_multipart {
        return read_multipart(request).await;
    }

    let Json(req) = Json::<ImageRequest>::from_request(request, &())
        .await
        .map_err(|rejection| upload_rejected(rejection.status()))?;
    let image = decode_base64_payload(&req.image_base64)
        .map_err(|_| ApiError::bad_request("image is not valid base64"))?;
    Ok(Upload {
        image,
        filter_name: req.filter_name,
    })
}

async fn read_multipart(request: Request) -> ApiResult<Upload> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| upload_rejected(rejection.status()))?;

    let mut image = None;
    let mut filter_name = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_failed)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let bytes = field.bytes().await.map_err(multipart_failed)?;
                image = Some(bytes.to_vec());
            }
            Some("filtername") => {
                filter_name = Some(field.text().await.map_err(multipart_failed)?);
            }
            _ => {}
        }
    }

    Ok(Upload {
        image: image.ok_or_else(|| ApiError::bad_request("missing image"))?,
        filter_name: filter_name.ok_or_else(|| ApiError::bad_request("missing filter name"))?,
    })
}

fn multipart_failed(err: MultipartError) -> ApiError {
    upload_rejected(err.status())
}

fn upload_rejected(status: StatusCode) -> ApiError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("upload too large")
    } else {
        ApiError::bad_request("invalid upload")
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }

    fn bad_request(message: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: &'static str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn forbidden(message: &'static str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: &'static str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    fn payload_too_large(message: &'static str) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    fn unavailable(message: &'static str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(
            event = "pictask.gateway.internal_error",
            error = %err,
            "gateway internal error"
        );
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn require_session(identity: &IdentityStore, headers: &HeaderMap) -> ApiResult<UserId> {
    let session_id = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing session token"))?;

    identity
        .resolve_session(session_id)
        .map_err(|_| ApiError::unauthorized("invalid session token"))
}

fn require_commit_capability(
    signer: &dyn Signer,
    headers: &HeaderMap,
    task_id: &TaskId,
) -> ApiResult<()> {
    let token = headers
        .get(COMMIT_CAPABILITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing capability token"))?;

    let claims = signer.verify_commit_capability(token).map_err(|err| {
        tracing::warn!(
            event = "pictask.gateway.capability.invalid",
            error = %err,
            "invalid capability token"
        );
        ApiError::unauthorized("invalid capability token")
    })?;

    if claims.task_id != *task_id || claims.sub != format!("commit:{task_id}") {
        return Err(ApiError::forbidden("capability does not match request"));
    }

    Ok(())
}

async fn reaper_loop(
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let interval = state.cfg.reaper_poll;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        reap_once(&state);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

fn reap_once(state: &AppState) {
    let evicted = state.identity.evict_expired_sessions();
    if evicted > 0 {
        tracing::debug!(
            event = "pictask.gateway.reaper.sessions",
            evicted,
            "expired sessions evicted"
        );
    }

    let Some(deadline) = state.cfg.task_deadline else {
        return;
    };
    let deadline =
        chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::days(36_500));
    for task_id in state
        .gateway
        .store()
        .expire_in_progress(deadline, DEADLINE_EXCEEDED)
    {
        tracing::warn!(
            event = "pictask.gateway.reaper.deadline",
            task_id = %task_id,
            "task failed after exceeding its deadline"
        );
    }
}
