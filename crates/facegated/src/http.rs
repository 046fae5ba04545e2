//! HTTP API: `/api/health`, `/api/init`, `/api/register`, `/api/login`,
//! `/api/clear`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use facegate_core::{
    EnrollmentService, ErrorKind, FaceIdError, ModelSlot, ModelState, VerificationService,
};
use serde::Serialize;
use tracing::Instrument;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelSlot>,
    pub enrollment: EnrollmentService,
    pub verification: VerificationService,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let max_upload_bytes = state.max_upload_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/init", post(init))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/clear", delete(clear))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

async fn request_span(request: Request, next: Next) -> Response {
    let span = tracing::info_span!(
        "request",
        id = %uuid::Uuid::new_v4(),
        method = %request.method(),
        path = %request.uri().path(),
    );
    async move {
        let started = Instant::now();
        let response = next.run(request).await;
        tracing::debug!(
            status = response.status().as_u16(),
            elapsed_ms = millis(started.elapsed()),
            "request finished"
        );
        response
    }
    .instrument(span)
    .await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    models_loaded: bool,
    model_state: ModelState,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    success: bool,
    message: &'static str,
    model_state: ModelState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    success: bool,
    message: String,
    processing_time: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    success: bool,
    message: String,
    user: String,
    confidence: f32,
    distance: f32,
    processing_time: u64,
}

#[derive(Serialize)]
struct ClearResponse {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_time: Option<u64>,
}

/// Error response: the service failure plus the time spent, if measured.
pub struct ApiError {
    error: FaceIdError,
    elapsed: Option<Duration>,
}

impl ApiError {
    fn timed(error: FaceIdError, started: Instant) -> Self {
        Self {
            error,
            elapsed: Some(started.elapsed()),
        }
    }
}

impl From<FaceIdError> for ApiError {
    fn from(error: FaceIdError) -> Self {
        Self {
            error,
            elapsed: None,
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        FaceIdError::Validation(format!("expected a multipart upload: {}", e.body_text())).into()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::NoFaceDetected => StatusCode::BAD_REQUEST,
        ErrorKind::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::NoMatchFound => StatusCode::UNAUTHORIZED,
        ErrorKind::NoEnrolledIdentities => StatusCode::NOT_FOUND,
        ErrorKind::ExtractionTimeout => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::StoreCorrupt
        | ErrorKind::StoreUnavailable
        | ErrorKind::DescriptorLengthMismatch
        | ErrorKind::ExtractorFailed
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let min_distance = match self.error {
            FaceIdError::NoMatchFound { min_distance } => Some(min_distance),
            _ => None,
        };
        let body = ErrorBody {
            success: false,
            error: self.error.public_message(),
            kind,
            min_distance,
            processing_time: self.elapsed.map(millis),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Fields of an enrollment or verification upload.
#[derive(Default)]
struct Upload {
    image: Option<Vec<u8>>,
    name: Option<String>,
}

/// Body-limit failures surface from multer as 413; anything else is a
/// malformed upload.
fn upload_error(e: MultipartError, limit_bytes: usize) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        FaceIdError::UploadTooLarge { limit_bytes }.into()
    } else {
        FaceIdError::Validation(format!("malformed upload: {}", e.body_text())).into()
    }
}

async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
    limit_bytes: usize,
) -> Result<Upload, ApiError> {
    let mut multipart = multipart?;
    let mut upload = Upload::default();
    let fail = |e| upload_error(e, limit_bytes);
    while let Some(field) = multipart.next_field().await.map_err(fail)? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("image") => upload.image = Some(field.bytes().await.map_err(fail)?.to_vec()),
            Some("name") => upload.name = Some(field.text().await.map_err(fail)?),
            other => tracing::debug!(field = ?other, "ignoring upload field"),
        }
    }
    Ok(upload)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let model_state = state.models.state();
    Json(HealthResponse {
        status: "ok",
        models_loaded: model_state == ModelState::Ready,
        model_state,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn init(State(state): State<AppState>) -> Result<Json<InitResponse>, ApiError> {
    if let Err(e) = state.models.ensure_ready().await {
        let error = FaceIdError::from(e);
        error.log("init");
        return Err(error.into());
    }
    Ok(Json(InitResponse {
        success: true,
        message: "face models loaded",
        model_state: state.models.state(),
    }))
}

async fn register(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let started = Instant::now();
    let upload = read_upload(multipart, state.max_upload_bytes).await?;
    let name = upload.name.unwrap_or_default();

    match state.enrollment.enroll(upload.image, &name).await {
        Ok(enrolled) => Ok(Json(RegisterResponse {
            success: true,
            message: format!("User {} registered successfully", enrolled.record.name),
            processing_time: millis(enrolled.elapsed),
        })),
        Err(e) => {
            e.log("register");
            Err(ApiError::timed(e, started))
        }
    }
}

async fn login(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let started = Instant::now();
    let upload = read_upload(multipart, state.max_upload_bytes).await?;

    match state.verification.verify(upload.image).await {
        Ok(verified) => Ok(Json(LoginResponse {
            success: true,
            message: format!("Welcome back, {}", verified.name),
            user: verified.name,
            confidence: verified.confidence,
            distance: verified.distance,
            processing_time: millis(verified.elapsed),
        })),
        Err(e) => {
            e.log("login");
            Err(ApiError::timed(e, started))
        }
    }
}

async fn clear(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    state.enrollment.clear().await.map_err(|e| {
        e.log("clear");
        ApiError::from(e)
    })?;
    Ok(Json(ClearResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use facegate_core::{
        Descriptor, DescriptorExtractor, ExtractorError, IdentityStore, JsonFileStore, MatchPolicy,
    };
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "facegate-test-boundary";

    struct ScriptedExtractor(HashMap<Vec<u8>, Vec<f32>>);

    impl DescriptorExtractor for ScriptedExtractor {
        fn extract(&self, image: &[u8]) -> Result<Option<Descriptor>, ExtractorError> {
            Ok(self.0.get(image).map(|v| Descriptor::new(v.clone())))
        }
    }

    fn app_with(models: ModelSlot) -> (TempDir, Router) {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn IdentityStore> =
            Arc::new(JsonFileStore::new(tmp.path().join("identities.json")));
        let models = Arc::new(models);
        let timeout = Duration::from_secs(5);
        let state = AppState {
            enrollment: EnrollmentService::new(Arc::clone(&models), Arc::clone(&store), timeout),
            verification: VerificationService::new(
                Arc::clone(&models),
                store,
                timeout,
                MatchPolicy::new(0.6),
            ),
            models,
            max_upload_bytes: 1024 * 1024,
        };
        (tmp, router(state))
    }

    fn app() -> (TempDir, Router) {
        let faces = HashMap::from([
            (b"alice".to_vec(), vec![0.0, 0.0]),
            (b"alice-again".to_vec(), vec![0.1, 0.0]),
            (b"stranger".to_vec(), vec![5.0, 5.0]),
            (b"other-model".to_vec(), vec![0.0, 0.0, 0.0]),
        ]);
        app_with(ModelSlot::ready(Arc::new(ScriptedExtractor(faces))))
    }

    fn multipart(name: Option<&str>, image: Option<&[u8]>) -> Request<Body> {
        let mut body = Vec::new();
        if let Some(name) = name {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\n{name}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(image) = image {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; \
                     filename=\"face.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(image);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method(Method::POST)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn to(path: &str, mut request: Request<Body>) -> Request<Body> {
        *request.uri_mut() = path.parse().unwrap();
        request
    }

    fn empty(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_model_state() {
        let (_tmp, app) = app();
        let (status, body) = send(&app, empty(Method::GET, "/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["modelsLoaded"], true);
        assert_eq!(body["modelState"], "ready");
        assert!(chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let (_tmp, app) = app();

        let (status, body) = send(
            &app,
            to("/api/register", multipart(Some("Alice"), Some(b"alice"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert!(body["processingTime"].is_u64());

        let (status, body) = send(&app, to("/api/login", multipart(None, Some(b"alice-again")))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["user"], "Alice");
        let confidence = body["confidence"].as_f64().unwrap();
        assert!((confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_login_rejects_stranger_with_min_distance() {
        let (_tmp, app) = app();
        send(&app, to("/api/register", multipart(Some("Alice"), Some(b"alice")))).await;

        let (status, body) = send(&app, to("/api/login", multipart(None, Some(b"stranger")))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "no_match_found");
        let min_distance = body["minDistance"].as_f64().unwrap();
        assert!((min_distance - 50f64.sqrt()).abs() < 1e-4);
        assert!(body["processingTime"].is_u64());
    }

    #[tokio::test]
    async fn test_login_with_empty_store_is_not_found() {
        let (_tmp, app) = app();
        let (status, body) = send(&app, to("/api/login", multipart(None, Some(b"alice")))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_enrolled_identities");
    }

    #[tokio::test]
    async fn test_register_validation_errors() {
        let (_tmp, app) = app();

        let (status, body) = send(&app, to("/api/register", multipart(Some("Alice"), None))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");

        let (status, _) = send(&app, to("/api/register", multipart(None, Some(b"alice")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, to("/api/register", empty(Method::POST, "/"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_register_without_face() {
        let (_tmp, app) = app();
        let (status, body) = send(
            &app,
            to("/api/register", multipart(Some("Alice"), Some(b"empty-room"))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "no_face_detected");
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (_tmp, app) = app();
        send(&app, to("/api/register", multipart(Some("Alice"), Some(b"alice")))).await;

        for _ in 0..2 {
            let (status, body) = send(&app, empty(Method::DELETE, "/api/clear")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
        }
        let (status, _) = send(&app, to("/api/login", multipart(None, Some(b"alice")))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_init_failure_hides_details_and_can_retry() {
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let slot = ModelSlot::new(
            move || -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(ExtractorError::ModelLoad("/opt/models/det_10g.onnx missing".into()))
                } else {
                    Ok(Arc::new(ScriptedExtractor(HashMap::new())))
                }
            },
        );
        let (_tmp, app) = app_with(slot);

        let (_, body) = send(&app, empty(Method::GET, "/api/health")).await;
        assert_eq!(body["modelsLoaded"], false);

        let (status, body) = send(&app, empty(Method::POST, "/api/init")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(!body["error"].as_str().unwrap().contains("/opt/models"));

        let (status, body) = send(&app, empty(Method::POST, "/api/init")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["modelState"], "ready");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let (_tmp, app) = app();
        let big = vec![0u8; 2 * 1024 * 1024];
        let (status, body) = send(&app, to("/api/register", multipart(Some("Alice"), Some(&big)))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE, "{body}");
        assert_eq!(body["kind"], "upload_too_large");
        assert_eq!(body["error"], "upload exceeds the 1048576 byte limit");
    }

    #[tokio::test]
    async fn test_login_with_mismatched_descriptor_length_is_a_fault() {
        let (_tmp, app) = app();
        send(&app, to("/api/register", multipart(Some("Alice"), Some(b"alice")))).await;

        let (status, body) = send(&app, to("/api/login", multipart(None, Some(b"other-model")))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "descriptor_length_mismatch");
        assert_eq!(body["error"], "stored descriptors are inconsistent");
    }
}
