use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
    types::Json,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{Result, ReviewError},
    models::{
        AiAnalysis, CONFIDENCE_GATE, ChatMessage, ChatSession, DocumentRef, DoctorReview,
        EditedFields, Feedback, Report, ReportStatus,
    },
    storage::{ChatSessionStorage, ReportFilter, ReportStorage, Transition},
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reports (
    id               UUID PRIMARY KEY,
    patient_id       UUID NOT NULL,
    document         JSONB NOT NULL,
    uploaded_at      TIMESTAMPTZ NOT NULL,
    analysis         JSONB NOT NULL,
    confidence_score DOUBLE PRECISION NOT NULL,
    doctor_review    JSONB,
    status           TEXT NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS reports_patient_idx ON reports (patient_id);
CREATE INDEX IF NOT EXISTS reports_status_idx ON reports (status);

CREATE TABLE IF NOT EXISTS feedback (
    id                 UUID PRIMARY KEY,
    report_id          UUID NOT NULL REFERENCES reports (id),
    doctor_id          UUID NOT NULL,
    original_analysis  JSONB NOT NULL,
    corrected_analysis JSONB NOT NULL,
    accuracy_score     DOUBLE PRECISION NOT NULL,
    comments           TEXT NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS feedback_report_idx ON feedback (report_id);

CREATE TABLE IF NOT EXISTS chat_sessions (
    id         UUID PRIMARY KEY,
    patient_id UUID NOT NULL,
    report_id  UUID NOT NULL,
    messages   JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (patient_id, report_id)
);
"#;

const REPORT_COLUMNS: &str = "id, patient_id, document, uploaded_at, analysis, doctor_review, status, updated_at";

/// PostgreSQL-backed implementation of both storage traits
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        info!("Connected to PostgreSQL report store");
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Explain why a conditional update touched no rows.
    async fn classify_miss(&self, report_id: Uuid) -> Result<Transition> {
        let row = sqlx::query("SELECT status, confidence_score FROM reports WHERE id = $1")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(Transition::Missing);
        };
        let status: ReportStatus = row.try_get::<String, _>("status")?.parse()?;
        if status != ReportStatus::Pending {
            return Ok(Transition::NotPending(status));
        }
        Ok(Transition::GateClosed(row.try_get("confidence_score")?))
    }
}

fn report_from_row(row: &PgRow) -> Result<Report> {
    let status: String = row.try_get("status")?;
    let document: Json<DocumentRef> = row.try_get("document")?;
    let analysis: Json<AiAnalysis> = row.try_get("analysis")?;
    let doctor_review: Option<Json<DoctorReview>> = row.try_get("doctor_review")?;

    Ok(Report {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        document: document.0,
        uploaded_at: row.try_get("uploaded_at")?,
        analysis: analysis.0,
        doctor_review: doctor_review.map(|r| r.0),
        status: status.parse()?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn feedback_from_row(row: &PgRow) -> Result<Feedback> {
    let original: Json<AiAnalysis> = row.try_get("original_analysis")?;
    let corrected: Json<EditedFields> = row.try_get("corrected_analysis")?;

    Ok(Feedback {
        id: row.try_get("id")?,
        report_id: row.try_get("report_id")?,
        doctor_id: row.try_get("doctor_id")?,
        original_analysis: original.0,
        corrected_analysis: corrected.0,
        accuracy_score: row.try_get("accuracy_score")?,
        comments: row.try_get("comments")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<ChatSession> {
    let messages: Json<Vec<ChatMessage>> = row.try_get("messages")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(ChatSession {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        report_id: row.try_get("report_id")?,
        messages: messages.0,
        created_at,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ReportStorage for PostgresStorage {
    async fn insert_report(&self, report: &Report) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reports (
                id, patient_id, document, uploaded_at, analysis,
                confidence_score, doctor_review, status, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(report.id)
        .bind(report.patient_id)
        .bind(Json(&report.document))
        .bind(report.uploaded_at)
        .bind(Json(&report.analysis))
        .bind(report.analysis.confidence_score)
        .bind(report.doctor_review.as_ref().map(Json))
        .bind(report.status.as_str())
        .bind(report.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(report_from_row)
            .transpose()
    }

    async fn list_reports(&self, filter: ReportFilter) -> Result<Vec<Report>> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM reports \
             WHERE ($1::uuid IS NULL OR patient_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.patient_id)
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(report_from_row).collect()
    }

    async fn count_reports(&self, filter: ReportFilter) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reports \
             WHERE ($1::uuid IS NULL OR patient_id = $1) \
               AND ($2::text IS NULL OR status = $2)",
        )
        .bind(filter.patient_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_review(&self, report_id: Uuid, review: DoctorReview) -> Result<Transition> {
        let updated_at = review.reviewed_at;
        let result = sqlx::query(
            "UPDATE reports SET doctor_review = $2, status = 'reviewed', updated_at = $3 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(report_id)
        .bind(Json(&review))
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.classify_miss(report_id).await;
        }
        Ok(Transition::Applied)
    }

    async fn record_edit(&self, feedback: &Feedback, review: DoctorReview) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE reports SET doctor_review = $2, status = 'edited', updated_at = $3 \
             WHERE id = $1 AND status = 'pending' AND confidence_score < $4",
        )
        .bind(feedback.report_id)
        .bind(Json(&review))
        .bind(review.reviewed_at)
        .bind(CONFIDENCE_GATE)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return self.classify_miss(feedback.report_id).await;
        }

        sqlx::query(
            r#"
            INSERT INTO feedback (
                id, report_id, doctor_id, original_analysis,
                corrected_analysis, accuracy_score, comments, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(feedback.id)
        .bind(feedback.report_id)
        .bind(feedback.doctor_id)
        .bind(Json(&feedback.original_analysis))
        .bind(Json(&feedback.corrected_analysis))
        .bind(feedback.accuracy_score)
        .bind(&feedback.comments)
        .bind(feedback.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Transition::Applied)
    }

    async fn feedback_for_report(&self, report_id: Uuid) -> Result<Vec<Feedback>> {
        let rows = sqlx::query(
            "SELECT id, report_id, doctor_id, original_analysis, corrected_analysis, \
                    accuracy_score, comments, created_at \
             FROM feedback WHERE report_id = $1 ORDER BY id",
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(feedback_from_row).collect()
    }
}

#[async_trait]
impl ChatSessionStorage for PostgresStorage {
    async fn get_or_create(&self, patient_id: Uuid, report_id: Uuid) -> Result<ChatSession> {
        let candidate = ChatSession::new(patient_id, report_id);
        sqlx::query(
            "INSERT INTO chat_sessions (id, patient_id, report_id, messages, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (patient_id, report_id) DO NOTHING",
        )
        .bind(candidate.id)
        .bind(patient_id)
        .bind(report_id)
        .bind(Json(&candidate.messages))
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, patient_id, report_id, messages, created_at, updated_at \
             FROM chat_sessions WHERE patient_id = $1 AND report_id = $2",
        )
        .bind(patient_id)
        .bind(report_id)
        .fetch_one(&self.pool)
        .await?;
        session_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ChatSession>> {
        sqlx::query(
            "SELECT id, patient_id, report_id, messages, created_at, updated_at \
             FROM chat_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(session_from_row)
        .transpose()
    }

    async fn save_messages(&self, session: &ChatSession) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET messages = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(session.id)
        .bind(Json(&session.messages))
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ReviewError::Persistence(format!("failed to save chat session: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }
}

/// These run against a live database and are skipped when `DATABASE_URL` is unset.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::new_id;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn storage() -> Option<PostgresStorage> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PostgresStorage::connect(&url).await.unwrap())
    }

    fn report_with_score(score: f64) -> Report {
        Report::new(
            new_id(),
            DocumentRef {
                path: "/tmp/r.pdf".into(),
                file_name: "r.pdf".into(),
            },
            AiAnalysis {
                confidence_score: score,
                ..Default::default()
            },
        )
    }

    fn correction(report: &Report) -> (Feedback, DoctorReview) {
        let mut fields = BTreeMap::new();
        fields.insert("diagnoses".to_string(), json!(["iron deficiency"]));
        let fields = EditedFields::new(fields).unwrap();
        let review = DoctorReview {
            reviewed_by: new_id(),
            reviewed_at: Utc::now(),
            edited_fields: Some(fields.clone()),
            notes: "corrected".into(),
        };
        let feedback = Feedback {
            id: new_id(),
            report_id: report.id,
            doctor_id: review.reviewed_by,
            original_analysis: report.analysis.clone(),
            corrected_analysis: fields,
            accuracy_score: report.analysis.confidence_score,
            comments: review.notes.clone(),
            created_at: Utc::now(),
        };
        (feedback, review)
    }

    #[tokio::test]
    async fn test_edit_at_gate_writes_nothing() {
        let Some(storage) = storage().await else {
            return;
        };
        let report = report_with_score(CONFIDENCE_GATE);
        storage.insert_report(&report).await.unwrap();

        let (feedback, review) = correction(&report);
        let outcome = storage.record_edit(&feedback, review).await.unwrap();
        assert_eq!(outcome, Transition::GateClosed(CONFIDENCE_GATE));

        let stored = storage.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Pending);
        assert!(stored.doctor_review.is_none());
        assert!(storage.feedback_for_report(report.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_writes_feedback_and_status() {
        let Some(storage) = storage().await else {
            return;
        };
        let report = report_with_score(72.5);
        storage.insert_report(&report).await.unwrap();

        let (feedback, review) = correction(&report);
        let outcome = storage.record_edit(&feedback, review).await.unwrap();
        assert_eq!(outcome, Transition::Applied);

        let stored = storage.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Edited);
        let records = storage.feedback_for_report(report.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, feedback.id);
        assert_eq!(records[0].accuracy_score, 72.5);
    }

    #[tokio::test]
    async fn test_second_disposition_and_missing_report() {
        let Some(storage) = storage().await else {
            return;
        };
        let report = report_with_score(40.0);
        storage.insert_report(&report).await.unwrap();

        let (_, review) = correction(&report);
        assert_eq!(
            storage.record_review(report.id, review).await.unwrap(),
            Transition::Applied
        );
        let (feedback, review) = correction(&report);
        assert_eq!(
            storage.record_edit(&feedback, review).await.unwrap(),
            Transition::NotPending(ReportStatus::Reviewed)
        );
        assert!(storage.feedback_for_report(report.id).await.unwrap().is_empty());

        let (_, review) = correction(&report);
        assert_eq!(
            storage.record_review(new_id(), review).await.unwrap(),
            Transition::Missing
        );
    }

    #[tokio::test]
    async fn test_failed_feedback_insert_rolls_back_status() {
        let Some(storage) = storage().await else {
            return;
        };
        let first = report_with_score(30.0);
        let second = report_with_score(30.0);
        storage.insert_report(&first).await.unwrap();
        storage.insert_report(&second).await.unwrap();

        let (feedback, review) = correction(&first);
        storage.record_edit(&feedback, review).await.unwrap();

        // Reusing the feedback id makes the insert fail after the status update.
        let (mut duplicate, review) = correction(&second);
        duplicate.id = feedback.id;
        let err = storage.record_edit(&duplicate, review).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);

        let stored = storage.get_report(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Pending);
        assert!(stored.doctor_review.is_none());
        assert!(storage.feedback_for_report(second.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_get_or_create_is_idempotent() {
        let Some(storage) = storage().await else {
            return;
        };
        let (patient, report) = (new_id(), new_id());
        let first = storage.get_or_create(patient, report).await.unwrap();
        let second = storage.get_or_create(patient, report).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.messages.is_empty());
    }
}
