//! HTTP façade: websocket upgrade for agent sessions plus the management
//! endpoints (cohorts, machines, report, shim binary distribution).
//!
//! Authentication here is deliberately thin: one session token, one user,
//! one organization aliased as `default`. The core only ever sees the
//! `(machine_id, user_id, organization_id)` triple resolved here.

use crate::report::{self, GitAuthProvider};
use crate::session::{self, SessionOptions};
use crate::store::{
    GetIntelMachinesParams, Store, StoreError, UpsertIntelCohortParams, UpsertIntelMachineParams,
};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use intel_common::api::{
    ApiError, CreateIntelCohortRequest, IntelCohort, IntelMachinesResponse,
};
use intel_common::mux::MuxSession;
use intel_common::ws::WsByteStream;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Header carrying the session token. Lowercase: header lookups and static
/// header names both normalize to lowercase.
pub const SESSION_TOKEN_HEADER: &str = "coder-session-token";

pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub token: String,
    pub default_organization: Uuid,
    pub default_user: Uuid,
    pub git_auth_providers: Vec<GitAuthProvider>,
    pub flush_interval: Duration,
    pub queue_limit: usize,
    /// Directory holding prebuilt shim binaries served under `/bin`.
    pub bin_directory: Option<PathBuf>,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v2/organizations/:org/intel/serve", get(serve_daemon))
        .route(
            "/api/v2/organizations/:org/intel/cohorts",
            get(list_cohorts).post(create_cohort),
        )
        .route("/api/v2/organizations/:org/intel/machines", get(list_machines))
        .route(
            "/api/v2/organizations/:org/intel/report",
            get(get_report).post(refresh_report),
        )
        .route("/bin/:filename", get(download_binary))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}

async fn authenticate(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let token = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if token != Some(state.token.as_str()) {
        return api_error(
            StatusCode::FORBIDDEN,
            "Invalid session token.",
            None,
        );
    }
    next.run(request).await
}

fn api_error(status: StatusCode, message: &str, detail: Option<String>) -> Response {
    (
        status,
        Json(ApiError {
            message: message.to_string(),
            detail,
        }),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::AlreadyExists(_) => {
            api_error(StatusCode::CONFLICT, "Already exists.", Some(err.to_string()))
        }
        StoreError::NotFound(_) => {
            api_error(StatusCode::NOT_FOUND, "Not found.", Some(err.to_string()))
        }
        StoreError::InvalidRegex { .. } => api_error(
            StatusCode::BAD_REQUEST,
            "Invalid metadata regex.",
            Some(err.to_string()),
        ),
        StoreError::Internal(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error.",
            Some(err.to_string()),
        ),
    }
}

fn resolve_organization(state: &ApiState, org: &str) -> Result<Uuid, Response> {
    if org == "default" {
        return Ok(state.default_organization);
    }
    Uuid::parse_str(org).map_err(|err| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Invalid organization.",
            Some(err.to_string()),
        )
    })
}

fn parse_metadata_param(
    raw: Option<&String>,
) -> Result<HashMap<String, String>, Response> {
    match raw {
        None => Ok(HashMap::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|err| {
            api_error(
                StatusCode::BAD_REQUEST,
                "Invalid metadata.",
                Some(err.to_string()),
            )
        }),
    }
}

#[derive(Deserialize)]
struct ServeQuery {
    instance_id: String,
    #[serde(default)]
    metadata: Option<String>,
    #[serde(default)]
    daemon_version: Option<String>,
}

async fn serve_daemon(
    State(state): State<Arc<ApiState>>,
    Path(org): Path<String>,
    Query(query): Query<ServeQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let organization_id = match resolve_organization(&state, &org) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let metadata = match parse_metadata_param(query.metadata.as_ref()) {
        Ok(metadata) => metadata,
        Err(response) => return response,
    };
    let ip_address = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string());

    let machine = match state
        .store
        .upsert_intel_machine(UpsertIntelMachineParams {
            instance_id: query.instance_id.clone(),
            organization_id,
            user_id: state.default_user,
            ip_address,
            daemon_version: query.daemon_version.clone().unwrap_or_default(),
            metadata,
        })
        .await
    {
        Ok(machine) => machine,
        Err(err) => return store_error(err),
    };
    info!(
        machine_id = %machine.id,
        instance_id = %machine.instance_id,
        "intel daemon connecting",
    );

    let store = state.store.clone();
    let opts = SessionOptions {
        machine_id: machine.id,
        user_id: machine.user_id,
        organization_id,
        flush_interval: state.flush_interval,
        queue_limit: state.queue_limit,
    };
    ws.on_upgrade(move |socket| async move {
        let transport = MuxSession::server(WsByteStream::new(socket));
        session::run(store, opts, transport).await;
    })
}

async fn list_cohorts(
    State(state): State<Arc<ApiState>>,
    Path(org): Path<String>,
) -> Response {
    let organization_id = match resolve_organization(&state, &org) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state
        .store
        .get_intel_cohorts_by_organization_id(organization_id, None)
        .await
    {
        Ok(cohorts) => Json(cohorts).into_response(),
        Err(err) => store_error(err),
    }
}

async fn create_cohort(
    State(state): State<Arc<ApiState>>,
    Path(org): Path<String>,
    Json(request): Json<CreateIntelCohortRequest>,
) -> Response {
    let organization_id = match resolve_organization(&state, &org) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if request.name.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "Name is required.", None);
    }
    let result = state
        .store
        .upsert_intel_cohort(UpsertIntelCohortParams {
            organization_id,
            created_by: state.default_user,
            name: request.name,
            icon: request.icon,
            description: request.description,
            tracked_executables: request.tracked_executables.unwrap_or_default(),
            metadata_match: request.metadata_match.unwrap_or_default(),
        })
        .await;
    match result {
        Ok(cohort) => (StatusCode::CREATED, Json::<IntelCohort>(cohort)).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Deserialize)]
struct MachinesQuery {
    #[serde(default)]
    metadata: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn list_machines(
    State(state): State<Arc<ApiState>>,
    Path(org): Path<String>,
    Query(query): Query<MachinesQuery>,
) -> Response {
    let organization_id = match resolve_organization(&state, &org) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let metadata_match = match parse_metadata_param(query.metadata.as_ref()) {
        Ok(metadata) => metadata,
        Err(response) => return response,
    };
    match state
        .store
        .get_intel_machines_matching_filters(GetIntelMachinesParams {
            organization_id,
            metadata_match,
            limit: query.limit.unwrap_or(0),
            offset: query.offset.unwrap_or(0),
        })
        .await
    {
        Ok((intel_machines, count)) => Json(IntelMachinesResponse {
            intel_machines,
            count,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default)]
    starts_at: Option<String>,
    #[serde(default)]
    metadata: Option<String>,
}

fn parse_starts_at(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| err.to_string())
}

async fn get_report(
    State(state): State<Arc<ApiState>>,
    Path(org): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let organization_id = match resolve_organization(&state, &org) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let starts_at = match query.starts_at.as_deref() {
        None => None,
        Some(raw) => match parse_starts_at(raw) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                return api_error(StatusCode::BAD_REQUEST, "Invalid starts_at.", Some(err))
            }
        },
    };
    let metadata_match = match parse_metadata_param(query.metadata.as_ref()) {
        Ok(metadata) => metadata,
        Err(response) => return response,
    };
    match report::build(
        &state.store,
        organization_id,
        starts_at,
        metadata_match,
        &state.git_auth_providers,
    )
    .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => store_error(err),
    }
}

async fn refresh_report(State(state): State<Arc<ApiState>>, Path(org): Path<String>) -> Response {
    if let Err(response) = resolve_organization(&state, &org) {
        return response;
    }
    match state.store.upsert_intel_invocation_summaries().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn download_binary(
    State(state): State<Arc<ApiState>>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(bin_directory) = &state.bin_directory else {
        return api_error(StatusCode::NOT_FOUND, "No binary directory configured.", None);
    };
    if filename.contains('/') || filename.contains("..") {
        return api_error(StatusCode::BAD_REQUEST, "Invalid filename.", None);
    }
    let path = bin_directory.join(&filename);
    let etag = {
        let path = path.clone();
        match tokio::task::spawn_blocking(move || intel_common::hash::sample_file(&path)).await {
            Ok(Ok(etag)) => format!("\"{etag}\""),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return api_error(StatusCode::NOT_FOUND, "No such binary.", None);
            }
            Ok(Err(err)) => {
                return api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to read binary.",
                    Some(err.to_string()),
                );
            }
            Err(err) => {
                return api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to read binary.",
                    Some(err.to_string()),
                );
            }
        }
    };
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(etag.as_str())
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::ETAG, etag),
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, filename, "failed to read shim binary");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to read binary.",
                Some(err.to_string()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state_with_bin(bin_directory: Option<PathBuf>) -> Arc<ApiState> {
        Arc::new(ApiState {
            store: Arc::new(MemStore::new()),
            token: "test-token".to_string(),
            default_organization: Uuid::new_v4(),
            default_user: Uuid::new_v4(),
            git_auth_providers: Vec::new(),
            flush_interval: Duration::from_millis(25),
            queue_limit: 100,
            bin_directory,
        })
    }

    fn test_state() -> Arc<ApiState> {
        test_state_with_bin(None)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(SESSION_TOKEN_HEADER, "test-token");
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejects_bad_token() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v2/organizations/default/intel/cohorts")
                    .header(SESSION_TOKEN_HEADER, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cohort_create_list_and_conflict() {
        let router = create_router(test_state());
        let create = serde_json::json!({
            "name": "backend",
            "tracked_executables": ["go"],
            "metadata_match": {"operating_system": "^linux$"},
        });

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/api/v2/organizations/default/intel/cohorts",
                Some(create.clone()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let cohort = body_json(response).await;
        assert_eq!(cohort["name"], "backend");
        assert_eq!(cohort["tracked_executables"][0], "go");

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                "/api/v2/organizations/default/intel/cohorts",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let response = router
            .oneshot(request(
                "POST",
                "/api/v2/organizations/default/intel/cohorts",
                Some(create),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cohort_with_invalid_regex_is_rejected() {
        let router = create_router(test_state());
        let response = router
            .oneshot(request(
                "POST",
                "/api/v2/organizations/default/intel/cohorts",
                Some(serde_json::json!({
                    "name": "broken",
                    "metadata_match": {"os": "(unclosed"},
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn machines_filter_matches_spec_scenario() {
        let state = test_state();
        for (instance, os) in [("a", "linux"), ("b", "windows")] {
            state
                .store
                .upsert_intel_machine(UpsertIntelMachineParams {
                    instance_id: instance.to_string(),
                    organization_id: state.default_organization,
                    user_id: state.default_user,
                    ip_address: String::new(),
                    daemon_version: String::new(),
                    metadata: HashMap::from([(
                        "operating_system".to_string(),
                        os.to_string(),
                    )]),
                })
                .await
                .unwrap();
        }
        let router = create_router(state);
        let metadata = urlencoding("{\"operating_system\":\"windows\"}");
        let response = router
            .oneshot(request(
                "GET",
                &format!("/api/v2/organizations/default/intel/machines?metadata={metadata}"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(
            body["intel_machines"][0]["metadata"]["operating_system"],
            "windows"
        );
    }

    #[tokio::test]
    async fn malformed_metadata_is_a_400() {
        let router = create_router(test_state());
        let response = router
            .oneshot(request(
                "GET",
                "/api/v2/organizations/default/intel/machines?metadata=not-json",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn refresh_returns_no_content() {
        let router = create_router(test_state());
        let response = router
            .oneshot(request(
                "POST",
                "/api/v2/organizations/default/intel/report",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn binary_download_with_etag() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("coder-intel-invoke-linux-x86_64");
        std::fs::write(&bin, b"shim bytes").unwrap();
        let router = create_router(test_state_with_bin(Some(dir.path().to_path_buf())));

        let response = router
            .clone()
            .oneshot(request("GET", "/bin/coder-intel-invoke-linux-x86_64", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response
            .headers()
            .get(header::ETAG)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let mut conditional = request("GET", "/bin/coder-intel-invoke-linux-x86_64", None);
        conditional
            .headers_mut()
            .insert(header::IF_NONE_MATCH, etag.parse().unwrap());
        let response = router.oneshot(conditional).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    fn urlencoding(raw: &str) -> String {
        let mut out = String::new();
        for byte in raw.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                other => out.push_str(&format!("%{other:02X}")),
            }
        }
        out
    }
}
