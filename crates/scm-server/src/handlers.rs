//! Request handlers of the control surface.
//!
//! Routes live under `<route_prefix>/1`:
//!
//! - `GET|POST /refresh/{id}`, `GET|POST /refresh` — trigger refreshes,
//!   the POST forms validating GitHub webhook payloads;
//! - `GET /status`, `GET /status/{id}` — aggregate the slave statuses
//!   collected over the broadcast bus;
//! - `GET /tarball/{id}` — stream the materialized source as `tar.gz`.
//!
//! Endpoints trigger work and return; they never wait for the slaves.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use scm::sources::SourceEngine;
use scm::{Registry, tarball};
use scm_auth::{GITHUB_EVENT_HEADER, GITHUB_SIGNATURE_HEADER, Identity, SCM_SECRET_HEADER};
use scm_config::{Settings, SourceKind, SourceStatus};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state of the router.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub settings: Arc<Settings>,
}

/// Build the router of a node.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/refresh", get(refresh_all).post(refresh_all_webhook))
        .route("/refresh/{id}", get(refresh_view).post(refresh_webhook))
        .route("/status", get(slaves_status))
        .route("/status/{id}", get(source_status))
        .route("/tarball/{id}", get(tarball_view))
        .with_state(state.clone());

    let prefix = state.settings.route_prefix.trim_end_matches('/');
    Router::new()
        .route("/health", get(health))
        .nest(&format!("{prefix}/1"), api)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    ""
}

/// An error response: status code plus a `detail` body.
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl From<scm::Error> for ApiError {
    fn from(error: scm::Error) -> Self {
        let status = match &error {
            scm::Error::AuthRejected(_) => StatusCode::FORBIDDEN,
            scm::Error::NotFound(_) => StatusCode::NOT_FOUND,
            scm::Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            scm::Error::Provider(_)
            | scm::Error::Fetch(_)
            | scm::Error::Reconcile { .. }
            | scm::Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SourceRefPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl RefreshResponse {
    fn ok() -> Self {
        Self {
            status: 200,
            ignored: None,
            reason: None,
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: 200,
            ignored: Some(true),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct RefreshAllResponse {
    status: u16,
    nb_refresh: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct SlaveEntry {
    sources: BTreeMap<String, SourceStatus>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    slaves: BTreeMap<String, SlaveEntry>,
}

#[derive(Debug, Serialize)]
struct SourceStatusResponse {
    statuses: Vec<SourceStatus>,
}

fn identify(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Identity {
    let scm_secret = headers
        .get(SCM_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    let signature = headers
        .get(GITHUB_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    scm_auth::identify(
        scm_secret,
        signature,
        body,
        state.settings.secret.as_deref(),
        state.settings.github_secret.as_deref(),
    )
}

/// Resolve a source id under the caller's identity.
///
/// Unknown ids are 404; so are filtered ids unless the caller holds the
/// master-level credential. A known id with no credential at all is 403.
async fn get_source_checked(
    state: &AppState,
    identity: Identity,
    id: &str,
) -> Result<(Arc<SourceEngine>, bool), ApiError> {
    let Some((engine, filtered)) = state.registry.get_source_with_filtered(id).await else {
        return Err(scm::Error::NotFound(id.to_string()).into());
    };
    if filtered && !identity.can_access_master() {
        return Err(scm::Error::NotFound(id.to_string()).into());
    }
    if !identity.can_access_source() {
        return Err(scm::Error::AuthRejected(format!("no access to source {id}")).into());
    }
    Ok((engine, filtered))
}

fn require_master_access(identity: Identity) -> Result<(), ApiError> {
    if identity.can_access_master() {
        Ok(())
    } else {
        Err(scm::Error::AuthRejected("master-level credential required".to_string()).into())
    }
}

fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

async fn refresh_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<axum::Json<RefreshResponse>, ApiError> {
    let identity = identify(&state, &headers, b"");
    get_source_checked(&state, identity, &id).await?;
    state.registry.refresh(&id).await?;
    Ok(axum::Json(RefreshResponse::ok()))
}

async fn refresh_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::Json<RefreshResponse>, ApiError> {
    let identity = identify(&state, &headers, &body);
    let (engine, _) = get_source_checked(&state, identity, &id).await?;

    let Some(declaration) = engine.declaration().cloned() else {
        return Err(ApiError::internal(format!(
            "non GIT source {id} cannot be refreshed by a webhook"
        )));
    };
    if declaration.kind != SourceKind::Git {
        return Err(ApiError::internal(format!(
            "non GIT source {id} cannot be refreshed by a webhook"
        )));
    }

    if headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        != Some("push")
    {
        info!("ignoring webhook notif for a non-push event on {id}");
        return Ok(axum::Json(RefreshResponse::ignored("Not a push")));
    }

    let payload: SourceRefPayload = serde_json::from_slice(&body).unwrap_or_default();
    let Some(git_ref) = payload.git_ref else {
        return Err(ApiError::internal(format!(
            "webhook for {id} is missing the ref"
        )));
    };
    if git_ref != format!("refs/heads/{}", declaration.branch()) {
        info!(
            "ignoring webhook notif for non-matching branch {} on {id}",
            declaration.branch()
        );
        return Ok(axum::Json(RefreshResponse::ignored(format!(
            "Not {} branch",
            sanitize_branch(declaration.branch())
        ))));
    }

    state.registry.refresh(&id).await?;
    Ok(axum::Json(RefreshResponse::ok()))
}

async fn refresh_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::Json<RefreshAllResponse>, ApiError> {
    let identity = identify(&state, &headers, b"");
    require_master_access(identity)?;

    let mut nb_refresh = 0;
    for id in state.registry.source_ids().await {
        state.registry.refresh(&id).await?;
        nb_refresh += 1;
    }
    Ok(axum::Json(RefreshAllResponse {
        status: 200,
        nb_refresh,
        ignored: None,
        reason: None,
    }))
}

async fn refresh_all_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::Json<RefreshAllResponse>, ApiError> {
    let identity = identify(&state, &headers, &body);
    require_master_access(identity)?;

    if headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        != Some("push")
    {
        info!("ignoring webhook notif for a non-push event");
        return Ok(axum::Json(RefreshAllResponse {
            status: 200,
            nb_refresh: 0,
            ignored: Some(true),
            reason: Some("Not a push".to_string()),
        }));
    }

    let payload: SourceRefPayload = serde_json::from_slice(&body).unwrap_or_default();
    let Some(git_ref) = payload.git_ref else {
        return Err(ApiError::internal("webhook is missing the ref"));
    };

    let mut nb_refresh = 0;
    for id in state.registry.source_ids().await {
        let Some((engine, _)) = state.registry.get_source_with_filtered(&id).await else {
            continue;
        };
        let Some(declaration) = engine.declaration() else {
            continue;
        };
        if declaration.kind != SourceKind::Git {
            continue;
        }
        if git_ref != format!("refs/heads/{}", declaration.branch()) {
            info!(
                "ignoring webhook notif for non-matching branch {git_ref}!=refs/heads/{} on {id}",
                declaration.branch()
            );
            continue;
        }
        state.registry.refresh(&id).await?;
        nb_refresh += 1;
    }
    Ok(axum::Json(RefreshAllResponse {
        status: 200,
        nb_refresh,
        ignored: None,
        reason: None,
    }))
}

async fn slaves_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::Json<StatusResponse>, ApiError> {
    let identity = identify(&state, &headers, b"");
    require_master_access(identity)?;

    let replies = scm::status::slaves_status(
        state.registry.bus(),
        state.settings.broadcast_timeout(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("{error:#}")))?;

    let mut slaves = BTreeMap::new();
    for slave in replies.into_iter().flatten() {
        let Some(hostname) = slave.hostname else {
            continue;
        };
        let mut sources = slave.sources;
        for status in sources.values_mut() {
            status.strip_node_info();
        }
        slaves.insert(hostname, SlaveEntry { sources });
    }
    Ok(axum::Json(StatusResponse { slaves }))
}

async fn source_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<axum::Json<SourceStatusResponse>, ApiError> {
    let identity = identify(&state, &headers, b"");
    get_source_checked(&state, identity, &id).await?;

    let replies = scm::status::source_status(
        state.registry.bus(),
        &id,
        state.settings.broadcast_timeout(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("{error:#}")))?;

    let mut statuses: Vec<SourceStatus> = Vec::new();
    for mut status in replies.into_iter().flatten() {
        if status.filtered == Some(true) {
            continue;
        }
        status.strip_node_info();
        if !statuses.contains(&status) {
            statuses.push(status);
        }
    }
    Ok(axum::Json(SourceStatusResponse { statuses }))
}

async fn tarball_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identify(&state, &headers, b"");
    let (engine, _) = get_source_checked(&state, identity, &id).await?;

    if !engine.is_loaded() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Not loaded yet"));
    }
    let path = engine.target_path();
    if !path.is_dir() {
        error!(
            "the path {} does not exist, for the source {id}",
            path.display()
        );
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "Not loaded yet: path didn't exist",
        ));
    }

    let entries =
        tarball::ordered_entries(&path).map_err(|error| ApiError::internal(format!("{error:#}")))?;
    let mut child =
        tarball::spawn_tar(&path, &entries).map_err(|error| ApiError::internal(format!("{error:#}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ApiError::internal("no stdout handle for tar"))?;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                error!("error building the tarball of {id}: tar exited with {status}");
            }
            Err(error) => error!("error building the tarball of {id}: {error}"),
            Ok(_) => {}
        }
    });

    let body = Body::from_stream(tokio_util::io::ReaderStream::new(stdout));
    Response::builder()
        .header(CONTENT_TYPE, "application/x-gtar")
        .body(body)
        .map_err(|error| ApiError::internal(error.to_string()))
}
