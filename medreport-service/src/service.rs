use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{Next, from_fn},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
};
use medreport_core::{
    AiAnalysis, AnswerGenerator, ChatEngine, ChatSession, ChatSessionStorage, Deadlines,
    EditedFields, ErrorKind, Feedback, HttpAnalyzer, InMemoryStorage, PostgresStorage, Report,
    ReportAnalyzer, ReportLifecycle, ReportStatus, ReportStorage, ReviewError, ReviewStatistics,
    deadline::within, models::parse_id, select_generator,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    models::{
        ChatRequest, ChatResponse, EditAnalysisRequest, EditAnalysisResponse, HistoryQuery,
        ReportListQuery, ReportSummary, ReviewRequest,
    },
    upload::{store_document, validate_file_name},
};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

/// Map a core error onto its HTTP status and JSON body.
fn review_error(e: ReviewError) -> ApiError {
    let (status, label) = match e.kind() {
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "Not found"),
        ErrorKind::Forbidden => (StatusCode::FORBIDDEN, "Forbidden"),
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "Invalid request"),
        ErrorKind::Persistence => (StatusCode::INTERNAL_SERVER_ERROR, "Storage failure"),
        ErrorKind::Analysis => (StatusCode::BAD_GATEWAY, "Analysis engine failed"),
        ErrorKind::Generation => (StatusCode::BAD_GATEWAY, "Upstream generation failed"),
        ErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Upstream timed out"),
    };

    if status.is_server_error() {
        error!(error = %e, "Request failed");
    }

    let mut body = json!({
        "error": label,
        "details": e.to_string()
    });
    if let ReviewError::ConfidenceGate {
        current_confidence, ..
    } = e
    {
        body["current_confidence"] = json!(current_confidence);
    }
    (status, Json(body))
}

fn id_param(field: &str, raw: &str) -> Result<Uuid, ApiError> {
    parse_id(field, raw).map_err(review_error)
}

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ReportLifecycle,
    pub chat: ChatEngine,
    pub analyzer: Arc<dyn ReportAnalyzer>,
    pub upload_dir: PathBuf,
    pub deadlines: Deadlines,
}

impl AppState {
    pub fn new(
        reports: Arc<dyn ReportStorage>,
        sessions: Arc<dyn ChatSessionStorage>,
        generator: Arc<dyn AnswerGenerator>,
        analyzer: Arc<dyn ReportAnalyzer>,
        upload_dir: PathBuf,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            lifecycle: ReportLifecycle::new(reports.clone(), deadlines),
            chat: ChatEngine::new(reports, sessions, generator, deadlines),
            analyzer,
            upload_dir,
            deadlines,
        }
    }
}

pub async fn create_app(config: &ServiceConfig) -> Router {
    let app_state = create_app_state(config).await;
    build_router(app_state)
}

async fn create_app_state(config: &ServiceConfig) -> AppState {
    let (reports, sessions) = create_storage(config).await;
    let generator = select_generator(&config.generator);
    let analyzer = Arc::new(HttpAnalyzer::new(config.analysis_api_url.clone()));

    AppState::new(
        reports,
        sessions,
        generator,
        analyzer,
        config.upload_dir.clone(),
        config.deadlines,
    )
}

async fn create_storage(
    config: &ServiceConfig,
) -> (Arc<dyn ReportStorage>, Arc<dyn ChatSessionStorage>) {
    if let Some(database_url) = &config.database_url {
        info!("Using PostgreSQL storage");
        match PostgresStorage::connect(database_url).await {
            Ok(storage) => {
                let storage = Arc::new(storage);
                let reports: Arc<dyn ReportStorage> = storage.clone();
                let sessions: Arc<dyn ChatSessionStorage> = storage;
                return (reports, sessions);
            }
            Err(e) => {
                error!(
                    "Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.",
                    e
                );
            }
        }
    } else {
        warn!("Using in-memory storage (set DATABASE_URL to use PostgreSQL)");
    }

    let storage = Arc::new(InMemoryStorage::new());
    let reports: Arc<dyn ReportStorage> = storage.clone();
    let sessions: Arc<dyn ChatSessionStorage> = storage;
    (reports, sessions)
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let header_value = HeaderValue::from_str(&correlation_id).ok();

    if let Some(value) = &header_value {
        request.headers_mut().insert("x-correlation-id", value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header_value {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/reports", get(list_reports).post(upload_report))
        .route("/reports/{id}", get(get_report))
        .route("/reports/{id}/document", get(download_document))
        .route("/reports/{id}/review", post(submit_review))
        .route("/reports/{id}/edit", put(edit_analysis))
        .route("/reports/{id}/feedback", get(list_feedback))
        .route("/patients/{patient_id}/reports", get(list_patient_reports))
        .route("/chat/message", post(send_chat_message))
        .route("/chat/history/{report_id}", get(get_chat_history))
        .route("/stats", get(get_statistics))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Medical Report Review Service",
        "version": "1.0.0",
        "description": "AI-analyzed medical reports with confidence-gated doctor review and report-grounded patient chat",
        "endpoints": {
            "POST /reports": "Upload a PDF report (multipart: patient_id, file)",
            "GET /reports?status=": "List reports, optionally by status",
            "GET /reports/{id}": "Get a report",
            "GET /reports/{id}/document": "Download the stored document",
            "POST /reports/{id}/review": "Sign off on a report",
            "PUT /reports/{id}/edit": "Correct findings of a low-confidence report",
            "GET /reports/{id}/feedback": "Correction audit records for a report",
            "GET /patients/{patient_id}/reports": "List a patient's reports",
            "POST /chat/message": "Ask about a report",
            "GET /chat/history/{report_id}?patient_id=": "Get the chat history for a report",
            "GET /stats": "Review statistics",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "answer_generator": state.chat.generator_name(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

struct UploadForm {
    patient_id: String,
    file_name: String,
    bytes: Vec<u8>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut patient_id = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request_error(&format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("patient_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request_error(&format!("Invalid patient_id field: {}", e)))?;
                patient_id = Some(text);
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request_error(&format!("Failed to read file: {}", e)))?;
                file = Some((file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let patient_id = patient_id.ok_or_else(|| bad_request_error("patient_id is required"))?;
    let (file_name, bytes) = file.ok_or_else(|| bad_request_error("No file uploaded"))?;
    Ok(UploadForm {
        patient_id,
        file_name,
        bytes,
    })
}

/// Remove a stored upload that never became a report.
async fn discard_upload(path: &str) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path, error = %e, "Failed to remove orphaned upload");
    }
}

async fn upload_report(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let form = read_upload_form(multipart).await?;
    let patient_id = id_param("patient_id", &form.patient_id)?;
    let file_name = validate_file_name(&form.file_name).map_err(review_error)?;
    if form.bytes.is_empty() {
        return Err(bad_request_error("Uploaded file is empty"));
    }

    info!(patient_id = %patient_id, file_name = %file_name, "Received report upload");

    let document = store_document(&state.upload_dir, &file_name, &form.bytes)
        .await
        .map_err(review_error)?;

    let analysis = within(
        state.deadlines.analysis,
        "analyze report",
        state.analyzer.analyze(&file_name, form.bytes),
    )
    .await
    .and_then(AiAnalysis::from_findings);
    let analysis = match analysis {
        Ok(analysis) => analysis,
        Err(e) => {
            discard_upload(&document.path).await;
            return Err(review_error(e));
        }
    };

    let stored_path = document.path.clone();
    let report = match state.lifecycle.create(patient_id, document, analysis).await {
        Ok(report) => report,
        Err(e) => {
            discard_upload(&stored_path).await;
            return Err(review_error(e));
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Report uploaded and analyzed successfully",
            "report": report
        })),
    ))
}

async fn get_report(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Report> {
    let report_id = id_param("report_id", &id)?;
    state
        .lifecycle
        .get_report(report_id)
        .await
        .map(Json)
        .map_err(review_error)
}

async fn download_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report_id = id_param("report_id", &id)?;
    let report = state
        .lifecycle
        .get_report(report_id)
        .await
        .map_err(review_error)?;

    let bytes = match tokio::fs::read(&report.document.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(not_found_error("Document file not found", &id));
        }
        Err(e) => {
            error!(report_id = %report_id, "Failed to read document: {}", e);
            return Err(internal_error("Failed to read document", &e.to_string()));
        }
    };

    let disposition = format!(
        "inline; filename=\"{}\"",
        report.document.file_name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn list_reports(
    State(state): State<AppState>,
    Query(query): Query<ReportListQuery>,
) -> ApiResult<Vec<Report>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ReportStatus>)
        .transpose()
        .map_err(review_error)?;

    state
        .lifecycle
        .list_reports(status)
        .await
        .map(Json)
        .map_err(review_error)
}

async fn list_patient_reports(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> ApiResult<Vec<ReportSummary>> {
    let patient_id = id_param("patient_id", &patient_id)?;
    let reports = state
        .lifecycle
        .list_for_patient(patient_id)
        .await
        .map_err(review_error)?;

    Ok(Json(reports.into_iter().map(ReportSummary::from).collect()))
}

async fn submit_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReviewRequest>,
) -> ApiResult<Report> {
    let report_id = id_param("report_id", &id)?;
    let doctor_id = id_param("doctor_id", &request.doctor_id)?;

    state
        .lifecycle
        .submit_review(report_id, doctor_id, request.notes)
        .await
        .map(Json)
        .map_err(review_error)
}

async fn edit_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EditAnalysisRequest>,
) -> ApiResult<EditAnalysisResponse> {
    let report_id = id_param("report_id", &id)?;
    let doctor_id = id_param("doctor_id", &request.doctor_id)?;
    let edited_fields = EditedFields::new(request.edited_fields).map_err(review_error)?;

    let feedback_id = state
        .lifecycle
        .edit_analysis(report_id, doctor_id, edited_fields, request.notes)
        .await
        .map_err(review_error)?;

    Ok(Json(EditAnalysisResponse {
        report_id: report_id.to_string(),
        feedback_id: feedback_id.to_string(),
        status: ReportStatus::Edited,
        message: "Analysis updated successfully".to_string(),
    }))
}

async fn list_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Feedback>> {
    let report_id = id_param("report_id", &id)?;
    state
        .lifecycle
        .get_report(report_id)
        .await
        .map_err(review_error)?;

    state
        .lifecycle
        .feedback_for_report(report_id)
        .await
        .map(Json)
        .map_err(review_error)
}

async fn send_chat_message(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let patient_id = id_param("patient_id", &request.patient_id)?;
    let report_id = id_param("report_id", &request.report_id)?;

    info!(
        patient_id = %patient_id,
        report_id = %report_id,
        message_length = request.message.len(),
        "Processing chat message"
    );

    let (session, response) = state
        .chat
        .send_message(patient_id, report_id, &request.message)
        .await
        .map_err(review_error)?;

    Ok(Json(ChatResponse::new(session, response)))
}

async fn get_chat_history(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<ChatSession> {
    let report_id = id_param("report_id", &report_id)?;
    let patient_id = id_param("patient_id", &query.patient_id)?;

    state
        .chat
        .history(patient_id, report_id)
        .await
        .map(Json)
        .map_err(review_error)
}

async fn get_statistics(State(state): State<AppState>) -> ApiResult<ReviewStatistics> {
    state
        .lifecycle
        .statistics()
        .await
        .map(Json)
        .map_err(review_error)
}
