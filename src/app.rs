use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{FetchCause, ScreenerError};
use crate::loader::TableSource;
use crate::login::{CredentialStore, LoginOutcome};
use crate::search::{SearchStatus, filter};
use crate::session::Session;
use crate::table::{CellValue, Table};

const SESSION_COOKIE: &str = "session";

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    expires_at: Instant,
}

/// Shared server state
///
/// Each browser session gets its own [`Session`] behind its own lock; nothing
/// else is shared between sessions.
pub struct AppState {
    credentials: Result<CredentialStore, String>,
    source: Arc<dyn TableSource>,
    sheet_name: String,
    session_ttl: Duration,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl AppState {
    pub fn new(config: &Config, source: Arc<dyn TableSource>) -> Self {
        AppState {
            credentials: config.credential_store().map_err(|e| e.to_string()),
            source,
            sheet_name: config.sheet.name.clone(),
            session_ttl: config.server.session_ttl(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the cookie's session, pruning every expired one on the way.
    async fn session(&self, jar: &CookieJar) -> Option<Arc<Mutex<Session>>> {
        let id = jar.get(SESSION_COOKIE)?.value().to_string();
        let now = Instant::now();

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        if sessions.len() < before {
            debug!("pruned {} expired sessions", before - sessions.len());
        }
        sessions.get(&id).map(|entry| Arc::clone(&entry.session))
    }

    /// Register a signed-in session and return its cookie value.
    async fn create_session(&self, session: Session) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            session: Arc::new(Mutex::new(session)),
            expires_at: Instant::now() + self.session_ttl,
        };
        self.sessions.write().await.insert(id.clone(), entry);
        id
    }

    async fn remove_session(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.write().await.remove(id).map(|entry| entry.session)
    }

    /// Fetch the sheet for a session unless it is cached (or `reload` is set).
    ///
    /// The session lock is released while the fetch is outstanding; a second
    /// request arriving meanwhile gets `FetchInProgress`. The fetch runs as
    /// its own task, so it completes and stores its result even if the
    /// request that started it is dropped.
    async fn ensure_table(
        &self,
        session: &Arc<Mutex<Session>>,
        reload: bool,
    ) -> Result<Arc<Table>, ScreenerError> {
        let ticket = {
            let mut guard = session.lock().await;
            if !reload {
                if let Ok(table) = guard.shared_table() {
                    return Ok(table);
                }
            }
            guard.begin_fetch()?
        };

        let source = Arc::clone(&self.source);
        let sheet_name = self.sheet_name.clone();
        let owner = Arc::clone(session);
        let fetch = tokio::spawn(async move {
            let result = source.fetch_table(&sheet_name).await;
            let mut guard = owner.lock().await;
            let stored = guard.finish_fetch(ticket, result).map(|_| ());
            match stored {
                Ok(()) => guard.shared_table(),
                Err(e) => Err(e),
            }
        });

        match fetch.await {
            Ok(result) => result,
            Err(e) => {
                error!("sheet fetch task failed: {}", e);
                session.lock().await.abandon_fetch(ticket);
                Err(ScreenerError::source_unavailable(
                    self.sheet_name.as_str(),
                    FetchCause::Network(e.to_string()),
                ))
            }
        }
    }
}

#[derive(Deserialize)]
pub struct LoginForm {
    email: String,
    password: String,
}

#[derive(Deserialize)]
pub struct LoginQuery {
    error: Option<String>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Serialize)]
struct TableResponse<'a> {
    status: &'static str,
    signed_in_as: Option<String>,
    columns: &'a [String],
    rows: Vec<&'a [CellValue]>,
    total_rows: usize,
    message: String,
    download: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    kind: &'static str,
    message: String,
}

/// Error wrapper mapping the taxonomy onto HTTP statuses.
pub struct ApiError(pub ScreenerError);

impl From<ScreenerError> for ApiError {
    fn from(e: ScreenerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self.0 {
            ScreenerError::Configuration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ConfigurationError",
                self.0.to_string(),
            ),
            ScreenerError::AuthenticationFailure => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationFailure",
                self.0.to_string(),
            ),
            ScreenerError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, "Unauthenticated", self.0.to_string())
            }
            ScreenerError::SourceUnavailable { cause, .. } => (
                StatusCode::BAD_GATEWAY,
                "SourceUnavailable",
                format!(
                    "Error connecting to Google Sheet ({}). Check that the sheet is shared with the service account, then reload.",
                    cause
                ),
            ),
            ScreenerError::TableNotLoaded => {
                (StatusCode::CONFLICT, "TableNotLoaded", self.0.to_string())
            }
            ScreenerError::FetchInProgress => {
                (StatusCode::CONFLICT, "FetchInProgress", self.0.to_string())
            }
        };

        (
            status,
            Json(ErrorResponse {
                status: "error",
                kind,
                message,
            }),
        )
            .into_response()
    }
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/login", get(serve_login_page).post(handle_login))
        .route("/logout", post(handle_logout))
        .route("/api/table", get(get_table))
        .route("/api/reload", post(reload_table))
        .route("/api/download", get(download_csv))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server
///
/// # Arguments
/// * `config` - Loaded configuration (credentials, sheet, bind address)
/// * `source` - Where the sheet data comes from
pub async fn run(
    config: Config,
    source: Arc<dyn TableSource>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = config.credential_store() {
        warn!("{}; every login will be refused", e);
    }

    let state = Arc::new(AppState::new(&config, source));
    let app = router(state);

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!("Listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn serve_index(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    match state.session(&jar).await {
        Some(session) if session.lock().await.is_authenticated() => {
            Html(include_str!("./static/dashboard.html")).into_response()
        }
        _ => Redirect::to("/login").into_response(),
    }
}

async fn serve_login_page(Query(params): Query<LoginQuery>) -> Html<String> {
    let message = params.error.map(|e| html_escape(&e)).unwrap_or_default();
    Html(include_str!("./static/login.html").replace("{{error}}", &message))
}

/// Handle login requests
///
/// Valid credentials get a fresh session cookie and a redirect to the
/// dashboard. Bad credentials and missing auth configuration redirect back
/// to the login page with different messages.
async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let store = match &state.credentials {
        Ok(store) => store,
        Err(e) => {
            error!("login attempted without auth configuration: {}", e);
            return Redirect::to(&format!(
                "/login?error={}",
                urlencoding::encode("Authentication info not found. Add [auth.users] to the secrets file.")
            ))
            .into_response();
        }
    };

    let mut session = Session::new();
    match session.attempt_login(store, &form.email, &form.password) {
        LoginOutcome::Granted(_) => {
            // Drop the session this browser had before, if any.
            if let Some(old) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) {
                state.remove_session(&old).await;
            }
            let id = state.create_session(session).await;

            let max_age = i64::try_from(state.session_ttl.as_secs()).unwrap_or(i64::MAX);
            let cookie = Cookie::build((SESSION_COOKIE, id))
                .path("/")
                .http_only(true)
                .max_age(time::Duration::seconds(max_age))
                .build();
            (jar.add(cookie), Redirect::to("/")).into_response()
        }
        denied @ LoginOutcome::Denied => Redirect::to(&format!(
            "/login?error={}",
            urlencoding::encode(&denied.message())
        ))
        .into_response(),
    }
}

async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(id) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) {
        if let Some(session) = state.remove_session(&id).await {
            session.lock().await.logout();
        }
    }

    let cookie = Cookie::build(SESSION_COOKIE).path("/").build();
    (jar.remove(cookie), Redirect::to("/login"))
}

async fn authenticated_session(
    state: &AppState,
    jar: &CookieJar,
) -> Result<Arc<Mutex<Session>>, ApiError> {
    let session = state
        .session(jar)
        .await
        .ok_or(ApiError(ScreenerError::Unauthenticated))?;
    if !session.lock().await.is_authenticated() {
        return Err(ApiError(ScreenerError::Unauthenticated));
    }
    Ok(session)
}

/// Current table, filtered by `?q=`
async fn get_table(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &jar).await?;
    let table = state.ensure_table(&session, false).await?;
    let signed_in_as = session.lock().await.identifier().map(str::to_string);

    let view = filter(&table, &params.q);
    let message = match view.status() {
        SearchStatus::Unfiltered => format!("{} rows", table.row_count()),
        SearchStatus::Matches(n) => format!("Found {} matching rows", n),
        SearchStatus::NoMatches => "No matching results found.".to_string(),
    };
    let status = match view.status() {
        SearchStatus::NoMatches => "warning",
        _ => "ok",
    };

    Ok(Json(TableResponse {
        status,
        signed_in_as,
        columns: table.columns(),
        rows: view.rows().collect(),
        total_rows: table.row_count(),
        message,
        download: crate::downloader::download_filename(&params.q),
    })
    .into_response())
}

/// Re-fetch the sheet; a failure keeps the previous table.
async fn reload_table(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &jar).await?;
    let table = state.ensure_table(&session, true).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "message": "Connected to Google Sheet successfully!",
        "rows": table.row_count(),
        "columns": table.column_count(),
    }))
    .into_response())
}

/// CSV download of the full or filtered table
async fn download_csv(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &jar).await?;
    let table = state.ensure_table(&session, false).await?;
    let download = crate::downloader::csv_download(&filter(&table, &params.q), &params.q);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, download.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download.filename),
            ),
        ],
        download.bytes,
    )
        .into_response())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchCause, Result};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct FixedSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TableSource for FixedSource {
        async fn fetch_table(&self, source_name: &str) -> Result<Table> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ScreenerError::source_unavailable(
                    source_name,
                    FetchCause::PermissionDenied("caller lacks access".into()),
                ));
            }
            Ok(Table::from_records(vec![
                vec![("name", CellValue::from("Alpha")), ("price", CellValue::Integer(10))],
                vec![("name", CellValue::from("Beta")), ("price", CellValue::Integer(20))],
            ]))
        }
    }

    /// Holds every fetch open until released.
    struct GatedSource {
        calls: AtomicUsize,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TableSource for GatedSource {
        async fn fetch_table(&self, _source_name: &str) -> Result<Table> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Table::from_records(vec![vec![("name", "Alpha")]]))
        }
    }

    const USERS: &str = "[auth.users]\n\"user@test.com\" = \"pw1\"\n";

    fn app_with(config: &str, source: Arc<dyn TableSource>) -> Router {
        let config = Config::from_toml_str(config).unwrap();
        router(Arc::new(AppState::new(&config, source)))
    }

    fn app(fail: bool) -> (Router, Arc<FixedSource>) {
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
            fail,
        });
        (app_with(USERS, source.clone()), source)
    }

    async fn login(app: &Router, password: &str) -> Response {
        app.clone()
            .oneshot(
                Request::post("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!(
                        "email=User%40Test.com&password={}",
                        password
                    )))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    fn session_cookie(resp: &Response) -> String {
        let set_cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .expect("session cookie")
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    async fn get(app: &Router, uri: &str, cookie: &str) -> Response {
        app.clone()
            .oneshot(
                Request::get(uri)
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_wrong_password_redirects_with_generic_message() {
        let (app, _) = app(false);
        let resp = login(&app, "pw2").await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("/login?error=Invalid%20email%20or%20password"));
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_api_requires_session() {
        let (app, source) = app(false);
        let resp = get(&app, "/api/table", "session=bogus").await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_and_download_reuse_one_fetch() {
        let (app, source) = app(false);
        let cookie = session_cookie(&login(&app, "pw1").await);

        let resp = get(&app, "/api/table?q=alpha", &cookie).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["rows"], serde_json::json!([["Alpha", 10]]));
        assert_eq!(json["download"], "filtered_results.csv");
        assert_eq!(json["signed_in_as"], "user@test.com");

        let resp = get(&app, "/api/table?q=zzz", &cookie).await;
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["status"], "warning");

        let resp = get(&app, "/api/download", &cookie).await;
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"full_sheet.csv\""
        );
        assert_eq!(body_string(resp).await, "name,price\nAlpha,10\nBeta,20\n");

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_reports_source_unavailable() {
        let (app, _) = app(true);
        let cookie = session_cookie(&login(&app, "pw1").await);

        let resp = get(&app, "/api/table", &cookie).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["kind"], "SourceUnavailable");
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let (app, _) = app(false);
        let cookie = session_cookie(&login(&app, "pw1").await);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/logout")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);

        let resp = get(&app, "/api/table", &cookie).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_cookie_carries_max_age() {
        let (app, _) = app(false);
        let resp = login(&app, "pw1").await;
        let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.contains("Max-Age=86400"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_expire() {
        let config = format!("{}[server]\nsession_ttl_secs = 60\n", USERS);
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let app = app_with(&config, source);
        let cookie = session_cookie(&login(&app, "pw1").await);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(get(&app, "/api/table", &cookie).await.status(), StatusCode::OK);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            get(&app, "/api/table", &cookie).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_one_fetch_in_flight_and_dropped_request_recovers() {
        let source = Arc::new(GatedSource {
            calls: AtomicUsize::new(0),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let app = app_with(USERS, source.clone());
        let cookie = session_cookie(&login(&app, "pw1").await);

        let first = tokio::spawn({
            let app = app.clone();
            let cookie = cookie.clone();
            async move { get(&app, "/api/table", &cookie).await }
        });
        source.entered.notified().await;

        let resp = get(&app, "/api/table", &cookie).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["kind"], "FetchInProgress");

        // The client that started the fetch goes away before it finishes.
        first.abort();
        let _ = first.await;
        source.release.notify_one();

        let mut status = StatusCode::CONFLICT;
        for _ in 0..100 {
            status = get(&app, "/api/table", &cookie).await.status();
            if status != StatusCode::CONFLICT {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, StatusCode::OK);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
