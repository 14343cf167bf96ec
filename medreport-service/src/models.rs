use medreport_core::{
    AiAnalysis, ChatMessage, ChatSession, DoctorReview, Report, ReportStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub doctor_id: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditAnalysisRequest {
    pub doctor_id: String,
    pub edited_fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditAnalysisResponse {
    pub report_id: String,
    pub feedback_id: String,
    pub status: ReportStatus,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub patient_id: String,
}

/// Patient-facing view of one report.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportSummary {
    pub id: String,
    pub file_name: String,
    /// `YYYY-MM-DD`
    pub upload_date: String,
    pub status: ReportStatus,
    pub confidence: f64,
    pub analysis: AiAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<DoctorReview>,
}

impl From<Report> for ReportSummary {
    fn from(report: Report) -> Self {
        Self {
            id: report.id.to_string(),
            file_name: report.document.file_name,
            upload_date: report.uploaded_at.format("%Y-%m-%d").to_string(),
            status: report.status,
            confidence: report.analysis.confidence_score,
            analysis: report.analysis,
            review: report.doctor_review,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub patient_id: String,
    pub report_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub report_id: String,
    pub response: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatResponse {
    pub fn new(session: ChatSession, response: String) -> Self {
        Self {
            session_id: session.id.to_string(),
            report_id: session.report_id.to_string(),
            response,
            messages: session.messages,
        }
    }
}
