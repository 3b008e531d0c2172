//! In-process mock of the Superset-style API used by the integration
//! tests.  Serves the full auth handshake plus listing/lookup endpoints
//! with injectable inconsistencies (duplicate rows, renamed identities,
//! forced statuses).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const ACCESS_TOKEN: &str = "mock-access-token";
pub const CSRF_TOKEN: &str = "mock-csrf-token";

/// Behavior knobs for one mock instance.  Defaults produce a perfectly
/// consistent server.
#[derive(Clone)]
pub struct MockBehavior {
    /// Entity names served by the listing endpoint, in order.
    pub entities: Vec<String>,
    /// Identity field echoed in lookup rows (`table_name` or
    /// `dashboard_title`).
    pub identity_field: &'static str,
    /// Reject the login call with 401.
    pub fail_login: bool,
    /// Entities answered with two identical rows instead of one.
    pub duplicate_for: Option<String>,
    /// Entities answered with an empty result list.
    pub empty_for: Option<String>,
    /// Requested name -> echoed name, to fake inconsistent responses.
    pub mismatch: HashMap<String, String>,
    /// Force this status on every filter lookup.
    pub lookup_status: Option<StatusCode>,
}

impl MockBehavior {
    pub fn datasets(names: &[&str]) -> Self {
        Self::with_field(names, "table_name")
    }

    #[allow(dead_code)]
    pub fn dashboards(names: &[&str]) -> Self {
        Self::with_field(names, "dashboard_title")
    }

    fn with_field(names: &[&str], identity_field: &'static str) -> Self {
        MockBehavior {
            entities: names.iter().map(|s| s.to_string()).collect(),
            identity_field,
            fail_login: false,
            duplicate_for: None,
            empty_for: None,
            mismatch: HashMap::new(),
            lookup_status: None,
        }
    }
}

pub async fn start_mock(behavior: MockBehavior) -> (String, JoinHandle<()>) {
    let state = Arc::new(behavior);
    let app = Router::new()
        .route("/api/v1/security/login", post(login))
        .route("/api/v1/security/csrf_token/", get(csrf_token))
        .route("/login/", post(form_login))
        .route("/api/v1/me", get(me))
        .route("/api/v1/dataset", get(entity_endpoint))
        .route("/api/v1/dashboard/", get(entity_endpoint))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, handle)
}

async fn login(State(st): State<Arc<MockBehavior>>, Json(body): Json<Value>) -> impl IntoResponse {
    if st.fail_login {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Invalid login"})),
        );
    }
    assert_eq!(body.get("provider").and_then(Value::as_str), Some("db"));
    (StatusCode::OK, Json(json!({"access_token": ACCESS_TOKEN})))
}

async fn csrf_token(headers: HeaderMap) -> impl IntoResponse {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth != format!("Bearer {}", ACCESS_TOKEN) {
        return (StatusCode::UNAUTHORIZED, HeaderMap::new(), Json(json!({})));
    }
    let mut out = HeaderMap::new();
    out.insert(
        header::SET_COOKIE,
        "session=csrf-stage; Path=/".parse().unwrap(),
    );
    (StatusCode::OK, out, Json(json!({"result": CSRF_TOKEN})))
}

async fn form_login() -> impl IntoResponse {
    let mut out = HeaderMap::new();
    out.insert(
        header::SET_COOKIE,
        "session=authed; Path=/; HttpOnly".parse().unwrap(),
    );
    (StatusCode::OK, out, "ok")
}

async fn me(headers: HeaderMap) -> impl IntoResponse {
    // Requires the session cookie obtained from the form login.
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !cookie.contains("session=authed") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "no session"})));
    }
    (
        StatusCode::OK,
        Json(json!({"result": {"username": "admin"}})),
    )
}

/// Shared handler for both listing and filter-lookup calls; the shape of
/// the `q` parameter decides which one this is.
async fn entity_endpoint(
    State(st): State<Arc<MockBehavior>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let q = params.get("q").cloned().unwrap_or_default();
    if q.starts_with('(') {
        lookup(&st, &q)
    } else {
        listing(&st)
    }
}

fn listing(st: &MockBehavior) -> (StatusCode, Json<Value>) {
    let rows: Vec<Value> = st
        .entities
        .iter()
        .enumerate()
        .map(|(i, name)| row(st.identity_field, name, (i + 1) as u64))
        .collect();
    (StatusCode::OK, Json(json!({"result": rows})))
}

fn row(field: &str, name: &str, id: u64) -> Value {
    let mut record = serde_json::Map::new();
    record.insert(field.to_string(), Value::String(name.to_string()));
    record.insert("id".to_string(), json!(id));
    Value::Object(record)
}

fn lookup(st: &MockBehavior, q: &str) -> (StatusCode, Json<Value>) {
    if let Some(status) = st.lookup_status {
        return (status, Json(json!({"message": "forced failure"})));
    }
    let requested = match filter_value(q) {
        Some(value) => value,
        None => return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad q"}))),
    };
    if st.empty_for.as_deref() == Some(requested.as_str()) {
        return (StatusCode::OK, Json(json!({"result": []})));
    }
    let echoed = st
        .mismatch
        .get(&requested)
        .cloned()
        .unwrap_or_else(|| requested.clone());
    let record = row(st.identity_field, &echoed, 1);
    let rows = if st.duplicate_for.as_deref() == Some(requested.as_str()) {
        vec![record.clone(), record]
    } else {
        vec![record]
    };
    (StatusCode::OK, Json(json!({"result": rows})))
}

/// Minimal parse of the filter expression's `value:` literal.
fn filter_value(q: &str) -> Option<String> {
    let rest = &q[q.find("value:")? + "value:".len()..];
    if let Some(quoted) = rest.strip_prefix('\'') {
        quoted.split('\'').next().map(str::to_string)
    } else {
        rest.split(')').next().map(str::to_string)
    }
}

/// AppConfig pointed at a mock instance, bypassing the environment.
pub fn test_config(
    url: &str,
    kind: superstress::EntityKind,
    rounds: u64,
    batch_size: u64,
    ignore: &[&str],
) -> superstress::AppConfig {
    superstress::AppConfig {
        base_url: url.to_string(),
        username: "admin".to_string(),
        password: "admin".to_string(),
        kind,
        rounds,
        batch_size,
        ignore: ignore.iter().map(|s| s.to_string()).collect(),
    }
}
