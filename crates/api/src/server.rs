//! Actix Web front end of the processing service.
//!
//! Handlers only parse the request and render the dispatcher's answer; every
//! blocking call happens on the worker pool, so the event loop keeps serving
//! `/health` while the pool is saturated.

use std::{net::TcpListener, sync::Arc};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    dev::Server,
    http::header,
    web,
};
use anyhow::{Context, Result};
use tracing::{Instrument, info, info_span};

use crate::{
    config::ApiConfig,
    context::RequestContext,
    data::{HealthResponse, StageInfo, StagesResponse},
    dispatcher::{Dispatcher, OutputMode, RequestOptions, UploadedImage},
    error::{DispatchError, ErrorKind, REQUEST_ID_HEADER},
    telemetry,
};

/// Optional client supplied name of the uploaded file.
pub const FILE_NAME_HEADER: &str = "x-file-name";

/// Shared state backing HTTP handlers.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    stages: Vec<StageInfo>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let stages = dispatcher.stage_info();
        Self {
            dispatcher: Arc::new(dispatcher),
            stages,
        }
    }
}

/// Register every API route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/process", web::post().to(process_handler))
        .route("/health", web::get().to(health_handler))
        .route("/live", web::get().to(live_handler))
        .route("/stages", web::get().to(stages_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Build a server on an already bound listener.
pub fn serve(
    state: web::Data<AppState>,
    listener: TcpListener,
    http_workers: Option<usize>,
) -> std::io::Result<Server> {
    let mut server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure));
    if let Some(workers) = http_workers {
        server = server.workers(workers);
    }
    Ok(server.listen(listener)?.run())
}

/// Bind the configured address and serve until the process is stopped.
pub async fn run(config: ApiConfig) -> Result<()> {
    let dispatcher = Dispatcher::from_config(&config)?;
    let state = web::Data::new(AppState::new(dispatcher));
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

    info!(
        addr = %listener.local_addr()?,
        workers = config.pool.workers,
        queue_capacity = config.pool.queue_capacity,
        max_upload_bytes = config.max_upload_bytes,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        allowed_formats = %config.allowed_formats,
        stages = state.dispatcher.stage_info().len(),
        "vision api listening"
    );

    serve(state, listener, config.http_workers)?
        .await
        .context("api server terminated with an error")
}

/// `POST /process`: decode, run the pipeline, and return the result.
async fn process_handler(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, DispatchError> {
    let ctx = RequestContext::new();
    let span = info_span!("api.request", request_id = %ctx.request_id);
    let dispatcher = state.dispatcher.clone();

    async move {
        let (upload, options) = match read_request(&dispatcher, &req, payload).await {
            Ok(parts) => parts,
            Err(err) => return Err(dispatcher.reject(&ctx, err)),
        };
        let output = options.output;
        let outcome = dispatcher.dispatch(&ctx, upload, options).await?;

        let mut response = HttpResponse::Ok();
        response.insert_header((REQUEST_ID_HEADER, ctx.request_id.as_str()));
        if output == OutputMode::Image {
            if let Some(image) = outcome.image {
                let disposition = format!(
                    "inline; filename=\"{}.{}\"",
                    ctx.request_id,
                    image.format.extension()
                );
                return Ok(response
                    .content_type(image.format.mime_type())
                    .insert_header((header::CONTENT_DISPOSITION, disposition))
                    .body(image.bytes));
            }
        }
        // Terminal results without an image fall back to JSON.
        Ok(response.json(outcome.into_response_body()))
    }
    .instrument(span)
    .await
}

/// Apply the size limit while reading the body and parse query options.
async fn read_request(
    dispatcher: &Dispatcher,
    req: &HttpRequest,
    payload: web::Payload,
) -> Result<(UploadedImage, RequestOptions), DispatchError> {
    let declared_length = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    dispatcher.check_declared_length(declared_length)?;

    let pairs = web::Query::<Vec<(String, String)>>::from_query(req.query_string())
        .map_err(|err| DispatchError::new(ErrorKind::InvalidParameters, err.to_string()))?
        .into_inner();
    let options = RequestOptions::from_query(&pairs)?;

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let file_name = req
        .headers()
        .get(FILE_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let bytes = match payload
        .to_bytes_limited(dispatcher.settings().max_upload_bytes)
        .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            return Err(DispatchError::new(
                ErrorKind::CorruptInput,
                format!("failed to read upload: {err}"),
            ));
        }
        Err(_) => return Err(dispatcher.too_large(None)),
    };

    Ok((
        UploadedImage {
            bytes,
            content_type,
            file_name,
        },
        options,
    ))
}

/// `GET /health`: 200 while the pool accepts work, 503 otherwise.
async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    let pool = state.dispatcher.pool().status();
    if pool.accepting {
        HttpResponse::Ok().json(HealthResponse {
            status: "ok",
            pool: &pool,
        })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "unavailable",
            pool: &pool,
        })
    }
}

async fn live_handler() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "alive" }))
}

async fn stages_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StagesResponse {
        stages: &state.stages,
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("metrics recorder not installed"),
    }
}
