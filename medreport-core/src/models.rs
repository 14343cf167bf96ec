use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, ReviewError};

/// Overall confidence (percent) at or above which findings can no longer be edited.
pub const CONFIDENCE_GATE: f64 = 90.0;

/// Identifiers are UUIDv7: globally unique and ordered by creation time.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Parse a caller-supplied identifier, naming the offending field on failure.
pub fn parse_id(field: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ReviewError::Validation(format!("invalid {}: {}", field, raw)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Reviewed,
    Edited,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Reviewed => "reviewed",
            ReportStatus::Edited => "edited",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "reviewed" => Ok(ReportStatus::Reviewed),
            "edited" => Ok(ReportStatus::Edited),
            other => Err(ReviewError::Validation(format!(
                "unknown report status: {}",
                other
            ))),
        }
    }
}

/// Extracted entities grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entities {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub symptoms: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnoses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub medications: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vitals: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub severity: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub urgency: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub functional_impact: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub test: String,
    pub reason: String,
    #[serde(default)]
    pub contraindications: Vec<String>,
    /// Percentage in [0, 100].
    pub confidence: f64,
    pub urgency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub entities: Entities,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Overall confidence in [0, 100].
    pub confidence_score: f64,
}

impl AiAnalysis {
    /// Whether the confidence gate still allows a doctor to override findings.
    pub fn permits_edit(&self) -> bool {
        self.confidence_score < CONFIDENCE_GATE
    }
}

/// Where the uploaded document lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: String,
    pub file_name: String,
}

/// Doctor corrections, keyed by the analysis field they override.
///
/// Kept as an open map: the editing UI decides which fields are correctable and
/// the audit trail must preserve whatever it sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditedFields(BTreeMap<String, Value>);

impl EditedFields {
    pub fn new(fields: BTreeMap<String, Value>) -> Result<Self> {
        if fields.is_empty() {
            return Err(ReviewError::Validation(
                "edited_fields must contain at least one field".to_string(),
            ));
        }
        if fields.keys().any(|k| k.trim().is_empty()) {
            return Err(ReviewError::Validation(
                "edited_fields keys cannot be blank".to_string(),
            ));
        }
        Ok(Self(fields))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorReview {
    pub reviewed_by: Uuid,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_fields: Option<EditedFields>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub document: DocumentRef,
    pub uploaded_at: DateTime<Utc>,
    pub analysis: AiAnalysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_review: Option<DoctorReview>,
    pub status: ReportStatus,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(patient_id: Uuid, document: DocumentRef, analysis: AiAnalysis) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            patient_id,
            document,
            uploaded_at: now,
            analysis,
            doctor_review: None,
            status: ReportStatus::Pending,
            updated_at: now,
        }
    }
}

/// Append-only audit record pairing an AI analysis with a doctor's correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub report_id: Uuid,
    pub doctor_id: Uuid,
    pub original_analysis: AiAnalysis,
    pub corrected_analysis: EditedFields,
    pub accuracy_score: f64,
    pub comments: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation thread scoped to one patient and one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub report_id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(patient_id: Uuid, report_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            patient_id,
            report_id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a user message and the assistant's reply, in that order.
    ///
    /// Timestamps never go backwards within a session, even if the wall clock does.
    pub fn append_turn(&mut self, user: String, assistant: String) {
        let floor = self
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(self.created_at);

        let user_at = Utc::now().max(floor);
        self.messages.push(ChatMessage {
            role: MessageRole::User,
            content: user,
            timestamp: user_at,
        });

        let assistant_at = Utc::now().max(user_at);
        self.messages.push(ChatMessage {
            role: MessageRole::Assistant,
            content: assistant,
            timestamp: assistant_at,
        });

        self.updated_at = assistant_at;
    }
}
