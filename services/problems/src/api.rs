use crate::config::ApiConfig;
use crate::error::{ProblemError, StartupError};
use crate::models::{FileUpload, Problem};
use crate::service::ProblemService;
use axum::{
    body::Body,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, FromRequest, Multipart, Path, Request, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProblemService>,
    pub service_name: String,
}

/// Response for a standalone upload
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub file: String,
}

/// Bucket listing response
#[derive(Debug, Serialize, Deserialize)]
pub struct FileListResponse {
    pub files: Vec<String>,
}

/// Fields of a problem creation request, from either a multipart or a
/// urlencoded form
#[derive(Debug, Default)]
pub struct ProblemForm {
    pub title: String,
    pub description: String,
    pub files: Vec<FileUpload>,
}

/// Bodies cut off by `DefaultBodyLimit` surface as 413, anything else
/// malformed as 400
fn multipart_error(e: MultipartError) -> ProblemError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ProblemError::PayloadTooLarge("Request body too large".to_string());
    }
    ProblemError::Validation(format!("Failed to parse multipart data: {}", e.body_text()))
}

impl<S> FromRequest<S> for ProblemForm
where
    S: Send + Sync,
{
    type Rejection = ProblemError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if !is_multipart {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|_| ProblemError::Validation("Title and description are required".to_string()))?;

            return Ok(Self {
                title: fields.get("title").cloned().unwrap_or_default(),
                description: fields.get("description").cloned().unwrap_or_default(),
                files: Vec::new(),
            });
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e: MultipartRejection| {
                ProblemError::Validation(format!("Failed to parse multipart data: {}", e.body_text()))
            })?;
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let field_name = field.name().unwrap_or("").to_string();

            match field_name.as_str() {
                "title" => form.title = field.text().await.map_err(multipart_error)?,
                "description" => form.description = field.text().await.map_err(multipart_error)?,
                "files" => {
                    let Some(name) = field
                        .file_name()
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                    else {
                        warn!("Ignoring files part without a filename");
                        continue;
                    };
                    let data = field.bytes().await.map_err(multipart_error)?;
                    form.files.push(FileUpload { name, data });
                }
                other => {
                    warn!(field = %other, "Ignoring unknown form field");
                }
            }
        }

        Ok(form)
    }
}

/// CORS policy restricted to the configured frontend origins
fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| {
            let o = o.trim().trim_end_matches('/');
            // tower-http panics on a `*` entry in an origin list
            if o == "*" {
                warn!("Ignoring wildcard CORS origin");
                return None;
            }
            match o.parse() {
                Ok(origin) => Some(origin),
                Err(_) => {
                    warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::CONTENT_LENGTH])
        .allow_credentials(true)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/problems", get(list_problems).post(create_problem))
        .route("/upload", post(upload_file))
        .route("/files", get(list_files))
        .route("/download/{*filename}", get(download_file))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let (database, object_store) = state.service.readiness().await;

    let describe = |result: &Result<(), ProblemError>| match result {
        Ok(()) => "connected".to_string(),
        Err(e) => e.user_message(),
    };

    let status = if database.is_ok() && object_store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "database": describe(&database),
            "object_store": describe(&object_store),
        })),
    )
}

#[instrument(skip(state, form), fields(title = %form.title, file_count = form.files.len()))]
async fn create_problem(
    State(state): State<AppState>,
    form: ProblemForm,
) -> Result<Json<Problem>, ProblemError> {
    let problem = state
        .service
        .create(&form.title, &form.description, form.files)
        .await?;

    Ok(Json(problem))
}

async fn list_problems(State(state): State<AppState>) -> Result<Json<Vec<Problem>>, ProblemError> {
    Ok(Json(state.service.list().await?))
}

#[instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ProblemError> {
    let mut file = None;

    // A request that is not multipart at all has no file part either
    if let Ok(mut multipart) = multipart {
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            if field.name() != Some("file") {
                continue;
            }
            let name = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(multipart_error)?;
            file = Some(FileUpload { name, data });
            break;
        }
    }

    let key = state.service.upload(file).await?;

    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
        file: key,
    }))
}

async fn list_files(State(state): State<AppState>) -> Result<Json<FileListResponse>, ProblemError> {
    Ok(Json(FileListResponse {
        files: state.service.list_files().await?,
    }))
}

#[instrument(skip(state))]
async fn download_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ProblemError> {
    let object = state.service.download(&filename).await?;

    let mut response = Response::new(Body::from_stream(object.body));
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_DISPOSITION, attachment_header(&filename));
    if let Some(length) = object.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    Ok(response)
}

/// `Content-Disposition` value naming the last path segment of the key.
/// Characters that cannot appear in a quoted header parameter become `_`.
fn attachment_header(key: &str) -> HeaderValue {
    let name: String = key
        .rsplit('/')
        .next()
        .unwrap_or(key)
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server<F>(
    state: AppState,
    config: &ApiConfig,
    shutdown: F,
) -> Result<(), StartupError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = config.listen_addr();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!(address = %addr, "Server running");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(StartupError::Serve)?;

    Ok(())
}
