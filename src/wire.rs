//! Wire layer: HTTP routing, the middleware chain and all handlers.
//!
//! The chain is decode (gzip) → authenticate → dispatch → encode. Every
//! application-level outcome is HTTP 200 with a `success` flag; only a
//! missing or unknown token is 401, which drives client re-login.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::executor::{Dispatcher, ExecEnv};
use crate::history::History;
use crate::logsink::LogSink;
use crate::requests::{ExecRequest, ExecuteApiRequest, LoginParams, LoginRequest, RenewRequest};
use crate::responses::{
    BaseRestResponse, LoginResponseData, NameValueParameter, RenewSessionResponseData, SessionInfo,
};
use crate::session::{Session, SessionManager};
use crate::{catalog, SnowglobeError};

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    pub history: Arc<History>,
    pub logs: LogSink,
    pub worksheets: Arc<Worksheets>,
}

/// Wire everything up: catalog, engine, dispatcher, session table.
pub async fn build_state(config: &Config, logs: LogSink) -> crate::Result<AppState> {
    std::fs::create_dir_all(&config.data_dir).map_err(|e| {
        SnowglobeError::Unavailable(format!(
            "cannot create data dir {}: {e}",
            config.data_dir.display()
        ))
    })?;
    let catalog = catalog::Catalog::load(config.catalog_path());
    let engine = EngineHandle::start(config.engine_path())?;
    let history = Arc::new(History::default());
    let dispatcher = Arc::new(Dispatcher::new(
        catalog,
        engine,
        Arc::clone(&history),
        std::time::Duration::from_secs(config.query_deadline_seconds),
    ));
    dispatcher.bootstrap().await?;
    Ok(AppState {
        dispatcher,
        sessions: Arc::new(SessionManager::new()),
        history,
        logs,
        worksheets: Arc::new(Worksheets::load(config.worksheets_path())),
    })
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/session", post(close_session))
        .route("/queries/v1/query-request", post(query_request))
        .route("/queries/v1/abort-request", post(abort_request))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/session/v1/{endpoint}", post(session_v1))
        .route("/session/token-request", post(token_request))
        .merge(protected)
        .route("/health", get(health))
        .route("/api/stats", get(api_stats))
        .route("/api/sessions", get(api_sessions))
        .route("/api/queries", get(api_queries))
        .route("/api/databases", get(api_databases))
        .route("/api/databases/{db}/schemas", get(api_schemas))
        .route("/api/databases/{db}/schemas/{schema}/objects", get(api_objects))
        .route("/api/execute", post(api_execute))
        .route("/api/logs", get(api_logs))
        .route("/api/worksheets", get(api_worksheets_list).post(api_worksheets_create))
        .route(
            "/api/worksheets/{id}",
            axum::routing::put(api_worksheets_update).delete(api_worksheets_delete),
        )
        .layer(middleware::from_fn(decompress_request))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Transparently inflate gzip request bodies before anything parses them.
async fn decompress_request(req: Request, next: Next) -> Response {
    let is_gzip = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !is_gzip {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let Ok(compressed) = to_bytes(body, MAX_BODY_BYTES).await else {
        return error_response(&SnowglobeError::BadRequest("unreadable request body".into()));
    };
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_ref());
    let mut inflated = Vec::new();
    if let Err(e) = decoder.read_to_end(&mut inflated) {
        return error_response(&SnowglobeError::BadRequest(format!("invalid gzip body: {e}")));
    }
    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::CONTENT_LENGTH);
    next.run(Request::from_parts(parts, Body::from(inflated))).await
}

#[derive(Clone)]
struct AuthToken(String);

/// The `Authorization: Snowflake Token="…"` scheme.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let rest = value.strip_prefix("Snowflake Token=")?;
    Some(rest.trim_matches('"').to_owned())
}

async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(req.headers()) else {
        return error_response(&SnowglobeError::Unauthenticated);
    };
    if state.sessions.lookup(&token).is_err() {
        return error_response(&SnowglobeError::Unauthenticated);
    }
    req.extensions_mut().insert(AuthToken(token));
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Response shaping
// ---------------------------------------------------------------------------

fn ok_response<D: Serialize>(data: D) -> Response {
    (StatusCode::OK, Json(BaseRestResponse::ok(data))).into_response()
}

fn error_response(e: &SnowglobeError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::OK);
    let body: BaseRestResponse<serde_json::Value> = BaseRestResponse::error(e.to_string(), e.code());
    (status, Json(body)).into_response()
}

fn parse_body<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, SnowglobeError> {
    serde_json::from_slice(bytes).map_err(|e| SnowglobeError::BadRequest(e.to_string()))
}

// ---------------------------------------------------------------------------
// Session protocol
// ---------------------------------------------------------------------------

async fn session_v1(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(params): Query<LoginParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match endpoint.as_str() {
        "login-request" => login(&state, &params, &body),
        "login-request:renew" => renew(&state, &headers, &body),
        other => error_response(&SnowglobeError::BadRequest(format!(
            "unknown session endpoint {other}"
        ))),
    }
}

fn login(state: &AppState, params: &LoginParams, body: &Bytes) -> Response {
    let request: LoginRequest = serde_json::from_slice(body).unwrap_or_default();
    let user = request.data.login_name.unwrap_or_else(|| "anonymous".to_owned());
    tracing::info!(
        client = request.data.client_app_id.as_deref().unwrap_or("unknown"),
        "login for user {user}"
    );

    let created = state.sessions.create(
        &user,
        params.database_name.as_deref(),
        params.schema_name.as_deref(),
        params.warehouse.as_deref(),
        params.role_name.as_deref(),
    );
    let data = LoginResponseData {
        token: created.token,
        master_token: created.master_token,
        session_id: created.session_id.to_string(),
        server_version: env!("CARGO_PKG_VERSION").to_owned(),
        parameters: session_parameters(),
        session_info: SessionInfo {
            database_name: Some(created.context.database),
            schema_name: Some(created.context.schema),
            warehouse_name: Some(created.context.warehouse),
            role_name: created.context.role,
        },
        master_validity_in_seconds: 14 * 24 * 3600,
        validity_in_seconds: 4 * 3600,
    };
    ok_response(data)
}

fn session_parameters() -> Vec<NameValueParameter> {
    vec![
        NameValueParameter::new("AUTOCOMMIT", true),
        NameValueParameter::new("TIMEZONE", "UTC"),
        NameValueParameter::new("CLIENT_SESSION_KEEP_ALIVE", false),
        NameValueParameter::new("CLIENT_RESULT_COLUMN_CASE_INSENSITIVE", false),
        NameValueParameter::new("DATE_OUTPUT_FORMAT", "YYYY-MM-DD"),
        NameValueParameter::new("TIMESTAMP_NTZ_OUTPUT_FORMAT", "YYYY-MM-DD HH24:MI:SS.FF3"),
    ]
}

fn renew(state: &AppState, headers: &HeaderMap, body: &Bytes) -> Response {
    let request: RenewRequest = serde_json::from_slice(body).unwrap_or_default();
    let old = request
        .old_session_token
        .or_else(|| extract_token(headers));
    let Some(old) = old else {
        return error_response(&SnowglobeError::Unauthenticated);
    };
    match state.sessions.renew(&old) {
        Ok((token, session)) => ok_response(RenewSessionResponseData {
            session_token: token,
            validity_in_seconds_s_t: 4 * 3600,
            master_token: session.master_token,
            validity_in_seconds_m_t: 14 * 24 * 3600,
            session_id: session.session_id.to_string(),
        }),
        Err(e) => error_response(&e),
    }
}

async fn token_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    renew(&state, &headers, &body)
}

async fn close_session(
    State(state): State<AppState>,
    axum::Extension(AuthToken(token)): axum::Extension<AuthToken>,
) -> Response {
    match state.sessions.close(&token) {
        Ok(()) => (
            StatusCode::OK,
            Json(BaseRestResponse::<()> {
                success: true,
                message: None,
                code: None,
                data: None,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Query protocol
// ---------------------------------------------------------------------------

async fn query_request(
    State(state): State<AppState>,
    axum::Extension(AuthToken(token)): axum::Extension<AuthToken>,
    body: Bytes,
) -> Response {
    let request: ExecRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let session: Session = match state.sessions.lookup(&token) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    state.sessions.touch(&token);

    // One in-flight statement per session; later submissions wait here.
    let gate = Arc::clone(&session.gate);
    let _serialized = gate.lock().await;

    let env = ExecEnv {
        session_id: session.session_id.to_string(),
        user: session.user.clone(),
    };
    let mut ctx = session.context.clone();
    match state.dispatcher.execute(&env, &mut ctx, &request.sql_text).await {
        Ok(data) => {
            state.sessions.set_context(&token, ctx);
            ok_response(data)
        }
        Err(e) => error_response(&e),
    }
}

async fn abort_request(State(_state): State<AppState>, body: Bytes) -> Response {
    let request: crate::requests::AbortRequest = parse_body(&body).unwrap_or_default();
    // The engine runs statements on a serialized worker and offers no
    // external interrupt; the abort is acknowledged and nothing else.
    tracing::warn!(
        request_id = request.request_id.as_deref().unwrap_or("unknown"),
        "abort requested; in-flight statements cannot be interrupted"
    );
    ok_response(json!({ "aborted": false }))
}

// ---------------------------------------------------------------------------
// Health and the operator surface
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Response {
    let stats = state.history.stats(state.sessions.active_count());
    ok_response(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": "duckdb",
        "uptime_seconds": stats.uptime_seconds,
        "active_sessions": stats.active_sessions,
    }))
}

async fn api_stats(State(state): State<AppState>) -> Response {
    ok_response(state.history.stats(state.sessions.active_count()))
}

async fn api_sessions(State(state): State<AppState>) -> Response {
    ok_response(state.sessions.list())
}

#[derive(Deserialize)]
struct LimitParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn api_queries(State(state): State<AppState>, Query(p): Query<LimitParams>) -> Response {
    ok_response(state.history.snapshot(p.limit.unwrap_or(100)))
}

async fn api_databases(State(state): State<AppState>) -> Response {
    let cat = state.dispatcher.catalog.read().await;
    let out: Vec<serde_json::Value> = cat
        .list_databases()
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "created_on": d.created_at,
                "comment": d.comment,
                "transient": d.transient,
                "schema_count": cat.list_schemas(&d.name).len(),
                "table_count": cat.list_tables(&d.name, None).len(),
            })
        })
        .collect();
    ok_response(out)
}

async fn api_schemas(State(state): State<AppState>, Path(db): Path<String>) -> Response {
    let db = db.to_ascii_uppercase();
    let cat = state.dispatcher.catalog.read().await;
    if cat.database(&db).is_none() {
        return error_response(&SnowglobeError::NotFound(format!("Database {db}")));
    }
    let out: Vec<serde_json::Value> = cat
        .list_schemas(&db)
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "created_on": s.created_at,
                "table_count": cat.list_tables(&db, Some(&s.name)).len(),
                "view_count": cat.list_views(&db, Some(&s.name)).len(),
            })
        })
        .collect();
    ok_response(out)
}

async fn api_objects(
    State(state): State<AppState>,
    Path((db, schema)): Path<(String, String)>,
) -> Response {
    let db = db.to_ascii_uppercase();
    let schema = schema.to_ascii_uppercase();
    let cat = state.dispatcher.catalog.read().await;
    if cat.schema(&db, &schema).is_none() {
        return error_response(&SnowglobeError::NotFound(format!("Schema {schema}")));
    }
    let tables: Vec<serde_json::Value> = cat
        .list_tables(&db, Some(&schema))
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "created_on": t.created_at,
                "row_count": t.row_count,
                "columns": t.columns.iter().map(|c| json!({
                    "name": c.name,
                    "type": c.data_type,
                    "nullable": c.nullable,
                    "primary_key": c.primary_key,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    let views: Vec<serde_json::Value> = cat
        .list_views(&db, Some(&schema))
        .iter()
        .map(|v| {
            json!({
                "name": v.name,
                "created_on": v.created_at,
                "secure": v.secure,
                "text": v.text,
            })
        })
        .collect();
    let stages: Vec<serde_json::Value> = cat
        .list_stages(&db, Some(&schema))
        .iter()
        .map(|s| json!({ "name": s.name, "created_on": s.created_at }))
        .collect();
    ok_response(json!({ "tables": tables, "views": views, "stages": stages }))
}

/// The dashboard's ad-hoc query endpoint: same pipeline, no session token.
async fn api_execute(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ExecuteApiRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let env = ExecEnv {
        session_id: "api".to_owned(),
        user: "dashboard".to_owned(),
    };
    let mut ctx = crate::session::SessionContext::default();
    match state.dispatcher.execute(&env, &mut ctx, &request.sql).await {
        Ok(data) => ok_response(data),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct LogParams {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn api_logs(State(state): State<AppState>, Query(p): Query<LogParams>) -> Response {
    ok_response(state.logs.snapshot(p.level.as_deref(), p.limit.unwrap_or(100)))
}

// ---------------------------------------------------------------------------
// Worksheets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worksheet {
    pub id: String,
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub position: usize,
    #[serde(default)]
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
pub struct WorksheetCreate {
    pub name: String,
    #[serde(default)]
    pub sql: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct WorksheetUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub favorite: Option<bool>,
}

pub struct Worksheets {
    path: Option<PathBuf>,
    items: Mutex<Vec<Worksheet>>,
}

impl Worksheets {
    pub fn load(path: PathBuf) -> Self {
        let items = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path: Some(path),
            items: Mutex::new(items),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            items: Mutex::new(Vec::new()),
        }
    }

    fn persist(&self, items: &[Worksheet]) -> Result<(), SnowglobeError> {
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(items)
                .map_err(|e| SnowglobeError::InternalInconsistency(e.to_string()))?;
            std::fs::write(path, bytes).map_err(|e| {
                SnowglobeError::InternalInconsistency(format!("worksheet persistence failed: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Worksheet> {
        let mut items = self.items.lock().clone();
        items.sort_by_key(|w| w.position);
        items
    }

    pub fn create(&self, req: WorksheetCreate) -> Result<Worksheet, SnowglobeError> {
        let mut items = self.items.lock();
        if items.iter().any(|w| w.name == req.name) {
            return Err(SnowglobeError::AlreadyExists(format!("Worksheet {}", req.name)));
        }
        let now = Utc::now();
        let sheet = Worksheet {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            sql: req.sql,
            database: None,
            schema: None,
            position: items.len(),
            favorite: false,
            created_at: now,
            updated_at: now,
        };
        items.push(sheet.clone());
        self.persist(&items)?;
        Ok(sheet)
    }

    pub fn update(&self, id: &str, req: WorksheetUpdate) -> Result<Worksheet, SnowglobeError> {
        let mut items = self.items.lock();
        if let Some(name) = req.name.as_deref() {
            if items.iter().any(|w| w.id != id && w.name == name) {
                return Err(SnowglobeError::AlreadyExists(format!("Worksheet {name}")));
            }
        }
        let sheet = items
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| SnowglobeError::NotFound(format!("Worksheet {id}")))?;
        if let Some(name) = req.name {
            sheet.name = name;
        }
        if let Some(sql) = req.sql {
            sheet.sql = sql;
        }
        if req.database.is_some() {
            sheet.database = req.database;
        }
        if req.schema.is_some() {
            sheet.schema = req.schema;
        }
        if let Some(position) = req.position {
            sheet.position = position;
        }
        if let Some(favorite) = req.favorite {
            sheet.favorite = favorite;
        }
        sheet.updated_at = Utc::now();
        let updated = sheet.clone();
        self.persist(&items)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), SnowglobeError> {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|w| w.id != id);
        if items.len() == before {
            return Err(SnowglobeError::NotFound(format!("Worksheet {id}")));
        }
        self.persist(&items)
    }
}

async fn api_worksheets_list(State(state): State<AppState>) -> Response {
    ok_response(state.worksheets.list())
}

async fn api_worksheets_create(State(state): State<AppState>, body: Bytes) -> Response {
    match parse_body::<WorksheetCreate>(&body).and_then(|req| state.worksheets.create(req)) {
        Ok(sheet) => ok_response(sheet),
        Err(e) => error_response(&e),
    }
}

async fn api_worksheets_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    match parse_body::<WorksheetUpdate>(&body).and_then(|req| state.worksheets.update(&id, req)) {
        Ok(sheet) => ok_response(sheet),
        Err(e) => error_response(&e),
    }
}

async fn api_worksheets_delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.worksheets.delete(&id) {
        Ok(()) => ok_response(json!({ "deleted": id })),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Snowflake Token=\"abc123\"".parse().unwrap(),
        );
        assert_eq!(extract_token(&headers), Some("abc123".to_owned()));

        headers.insert(header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn worksheet_crud() {
        let ws = Worksheets::in_memory();
        let a = ws
            .create(WorksheetCreate {
                name: "first".into(),
                sql: "SELECT 1".into(),
            })
            .unwrap();
        assert!(ws
            .create(WorksheetCreate {
                name: "first".into(),
                sql: String::new(),
            })
            .is_err());

        let updated = ws
            .update(
                &a.id,
                WorksheetUpdate {
                    favorite: Some(true),
                    ..WorksheetUpdate::default()
                },
            )
            .unwrap();
        assert!(updated.favorite);

        ws.delete(&a.id).unwrap();
        assert!(ws.list().is_empty());
        assert!(ws.delete(&a.id).is_err());
    }
}
