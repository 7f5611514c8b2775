//! Actix Web server behind the dashboard page.

use std::net::TcpListener;

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    cookie::{Cookie, SameSite},
    dev::Server,
    http::{StatusCode, header},
    web,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    client::{ApiClient, ApiHealth, FILE_NAME_HEADER},
    config::DashboardConfig,
    html::index::DASHBOARD_INDEX_HTML,
    messages::{self, Category},
    session::{LastOutcome, SESSION_COOKIE, SessionStore, SessionView, StoredUpload},
};

pub struct DashboardState {
    pub client: ApiClient,
    pub sessions: SessionStore,
    pub max_upload_bytes: usize,
}

impl DashboardState {
    pub fn from_config(config: &DashboardConfig) -> Result<Self> {
        let client = ApiClient::new(config.api_base_url.clone(), config.api_timeout)
            .context("failed to create API client")?;
        Ok(Self {
            client,
            sessions: SessionStore::new(config.session_ttl, config.max_sessions),
            max_upload_bytes: config.max_upload_bytes,
        })
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/upload", web::post().to(upload_handler))
        .route("/retry", web::post().to(retry_handler))
        .route("/session", web::get().to(session_handler))
        .route("/session", web::delete().to(clear_session_handler))
        .route("/health", web::get().to(health_handler));
}

pub fn serve(state: web::Data<DashboardState>, listener: TcpListener) -> std::io::Result<Server> {
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure));
    Ok(server.listen(listener)?.run())
}

pub async fn run(config: DashboardConfig) -> Result<()> {
    let state = web::Data::new(DashboardState::from_config(&config)?);
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    info!(
        addr = %listener.local_addr()?,
        api = %config.api_base_url,
        "dashboard listening"
    );
    serve(state, listener)?
        .await
        .context("dashboard server terminated with an error")
}

fn session_cookie(id: &str) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, id.to_string())
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .finish()
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn session_id(req: &HttpRequest) -> Option<String> {
    req.cookie(SESSION_COOKIE).map(|cookie| cookie.value().to_string())
}

/// Failures the user should fix get 422, the rest 502.
fn outcome_response(session: &str, outcome: &LastOutcome) -> HttpResponse {
    let status = match outcome {
        LastOutcome::Success { .. } => StatusCode::OK,
        LastOutcome::Failure { error } if error.category == Category::Input => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LastOutcome::Failure { .. } => StatusCode::BAD_GATEWAY,
    };
    HttpResponse::build(status)
        .cookie(session_cookie(session))
        .json(outcome)
}

/// Forward the stored upload to the API and remember the outcome.
async fn forward(state: &DashboardState, session: &str, upload: StoredUpload) -> LastOutcome {
    let result = state
        .client
        .process(&upload.file_name, &upload.content_type, upload.bytes.clone())
        .await;
    let outcome = match result {
        Ok(result) => {
            info!(
                session,
                file = %upload.file_name,
                request_id = %result.request_id,
                "upload processed"
            );
            LastOutcome::Success { result }
        }
        Err(err) => {
            let error = messages::describe(&err);
            warn!(session, file = %upload.file_name, code = %error.code, "upload failed: {err}");
            LastOutcome::Failure { error }
        }
    };
    record(state, session, &outcome);
    outcome
}

fn record(state: &DashboardState, session: &str, outcome: &LastOutcome) {
    let label = match outcome {
        LastOutcome::Success { .. } => "success".to_string(),
        LastOutcome::Failure { error } => error.code.clone(),
    };
    metrics::counter!("dashboard_uploads_total", "outcome" => label).increment(1);
    state.sessions.record_outcome(session, outcome.clone());
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(DASHBOARD_INDEX_HTML)
}

/// `POST /upload`: raw body plus `x-file-name`.
async fn upload_handler(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<DashboardState>,
) -> HttpResponse {
    let (session, _) = state.sessions.open(session_id(&req).as_deref());

    let bytes = match payload.to_bytes_limited(state.max_upload_bytes).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            let outcome = LastOutcome::Failure {
                error: messages::local("corrupt_input", Some(format!("upload interrupted: {err}"))),
            };
            record(&state, &session, &outcome);
            return outcome_response(&session, &outcome);
        }
        Err(_) => {
            let outcome = LastOutcome::Failure {
                error: messages::local(
                    "payload_too_large",
                    Some(format!("the dashboard accepts up to {} bytes", state.max_upload_bytes)),
                ),
            };
            record(&state, &session, &outcome);
            return outcome_response(&session, &outcome);
        }
    };

    let upload = StoredUpload {
        file_name: header_value(&req, FILE_NAME_HEADER).unwrap_or_else(|| "upload".into()),
        content_type: header_value(&req, header::CONTENT_TYPE.as_str())
            .unwrap_or_else(|| "application/octet-stream".into()),
        bytes,
        uploaded_at: Utc::now(),
    };
    state.sessions.record_upload(&session, upload.clone());

    let outcome = forward(&state, &session, upload).await;
    outcome_response(&session, &outcome)
}

/// `POST /retry`: resend the session's last upload unchanged.
async fn retry_handler(req: HttpRequest, state: web::Data<DashboardState>) -> HttpResponse {
    let session = session_id(&req).and_then(|id| state.sessions.resume(&id));
    let Some((session, upload)) =
        session.and_then(|id| state.sessions.last_upload(&id).map(|upload| (id, upload)))
    else {
        let error = messages::local("nothing_to_retry", None);
        return HttpResponse::Conflict().json(LastOutcome::Failure { error });
    };
    let outcome = forward(&state, &session, upload).await;
    outcome_response(&session, &outcome)
}

async fn session_handler(req: HttpRequest, state: web::Data<DashboardState>) -> HttpResponse {
    match session_id(&req).and_then(|id| state.sessions.resume(&id)) {
        Some(session) => HttpResponse::Ok()
            .cookie(session_cookie(&session))
            .json(state.sessions.view(&session)),
        None => HttpResponse::Ok().json(SessionView::default()),
    }
}

async fn clear_session_handler(req: HttpRequest, state: web::Data<DashboardState>) -> HttpResponse {
    if let Some(id) = session_id(&req) {
        state.sessions.clear(&id);
    }
    let mut removal = session_cookie("");
    removal.make_removal();
    HttpResponse::NoContent().cookie(removal).finish()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    api: ApiHealth,
}

/// Dashboard liveness plus the API's readiness as seen from here.
async fn health_handler(state: web::Data<DashboardState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        sessions: state.sessions.len(),
        api: state.client.health().await,
    })
}
