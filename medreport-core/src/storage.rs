use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::{Result, ReviewError},
    models::{
        CONFIDENCE_GATE, ChatSession, DoctorReview, Feedback, Report, ReportStatus,
    },
};

/// Equality predicates for report queries. `None` matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportFilter {
    pub patient_id: Option<Uuid>,
    pub status: Option<ReportStatus>,
}

impl ReportFilter {
    pub fn status(status: ReportStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn patient(patient_id: Uuid) -> Self {
        Self {
            patient_id: Some(patient_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, report: &Report) -> bool {
        self.patient_id.is_none_or(|p| p == report.patient_id)
            && self.status.is_none_or(|s| s == report.status)
    }
}

/// Outcome of a conditional status transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Applied,
    Missing,
    /// The report already left `pending`.
    NotPending(ReportStatus),
    /// The report's confidence is at or above the gate.
    GateClosed(f64),
}

/// Trait for storing reports and their feedback records
#[async_trait]
pub trait ReportStorage: Send + Sync {
    async fn insert_report(&self, report: &Report) -> Result<()>;
    async fn get_report(&self, id: Uuid) -> Result<Option<Report>>;
    /// Reports matching `filter`, oldest first.
    async fn list_reports(&self, filter: ReportFilter) -> Result<Vec<Report>>;
    async fn count_reports(&self, filter: ReportFilter) -> Result<u64>;

    /// Attach `review` and mark the report reviewed, only if it is still pending.
    async fn record_review(&self, report_id: Uuid, review: DoctorReview) -> Result<Transition>;

    /// Persist `feedback` and mark its report edited as one unit, only if the report
    /// is still pending and below the confidence gate. Nothing is written otherwise.
    async fn record_edit(&self, feedback: &Feedback, review: DoctorReview) -> Result<Transition>;

    async fn feedback_for_report(&self, report_id: Uuid) -> Result<Vec<Feedback>>;
}

/// Trait for storing and retrieving chat sessions
#[async_trait]
pub trait ChatSessionStorage: Send + Sync {
    /// Return the session for (patient, report), creating an empty one if none exists.
    async fn get_or_create(&self, patient_id: Uuid, report_id: Uuid) -> Result<ChatSession>;
    async fn get(&self, id: Uuid) -> Result<Option<ChatSession>>;
    /// Overwrite the stored message list and updated timestamp. Returns false if unknown.
    async fn save_messages(&self, session: &ChatSession) -> Result<bool>;
}

/// In-memory implementation of both storage traits
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    reports: Arc<DashMap<Uuid, Report>>,
    feedback: Arc<DashMap<Uuid, Feedback>>,
    sessions: Arc<DashMap<Uuid, ChatSession>>,
    session_index: Arc<DashMap<(Uuid, Uuid), Uuid>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStorage for InMemoryStorage {
    async fn insert_report(&self, report: &Report) -> Result<()> {
        self.reports.insert(report.id, report.clone());
        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        Ok(self.reports.get(&id).map(|entry| entry.clone()))
    }

    async fn list_reports(&self, filter: ReportFilter) -> Result<Vec<Report>> {
        let mut reports: Vec<Report> = self
            .reports
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        reports.sort_by_key(|r| r.id);
        Ok(reports)
    }

    async fn count_reports(&self, filter: ReportFilter) -> Result<u64> {
        Ok(self
            .reports
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .count() as u64)
    }

    async fn record_review(&self, report_id: Uuid, review: DoctorReview) -> Result<Transition> {
        let Some(mut report) = self.reports.get_mut(&report_id) else {
            return Ok(Transition::Missing);
        };
        if report.status != ReportStatus::Pending {
            return Ok(Transition::NotPending(report.status));
        }

        report.updated_at = review.reviewed_at;
        report.doctor_review = Some(review);
        report.status = ReportStatus::Reviewed;
        Ok(Transition::Applied)
    }

    async fn record_edit(&self, feedback: &Feedback, review: DoctorReview) -> Result<Transition> {
        // The entry guard keeps the report locked until both writes land.
        let Some(mut report) = self.reports.get_mut(&feedback.report_id) else {
            return Ok(Transition::Missing);
        };
        if report.status != ReportStatus::Pending {
            return Ok(Transition::NotPending(report.status));
        }
        if report.analysis.confidence_score >= CONFIDENCE_GATE {
            return Ok(Transition::GateClosed(report.analysis.confidence_score));
        }

        self.feedback.insert(feedback.id, feedback.clone());
        report.updated_at = review.reviewed_at;
        report.doctor_review = Some(review);
        report.status = ReportStatus::Edited;
        Ok(Transition::Applied)
    }

    async fn feedback_for_report(&self, report_id: Uuid) -> Result<Vec<Feedback>> {
        let mut records: Vec<Feedback> = self
            .feedback
            .iter()
            .filter(|entry| entry.report_id == report_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|f| f.id);
        Ok(records)
    }
}

#[async_trait]
impl ChatSessionStorage for InMemoryStorage {
    async fn get_or_create(&self, patient_id: Uuid, report_id: Uuid) -> Result<ChatSession> {
        let session_id = *self
            .session_index
            .entry((patient_id, report_id))
            .or_insert_with(|| {
                let session = ChatSession::new(patient_id, report_id);
                let id = session.id;
                self.sessions.insert(id, session);
                id
            });

        self.sessions
            .get(&session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                ReviewError::Persistence(format!(
                    "session index for report {} points at missing session {}",
                    report_id, session_id
                ))
            })
    }

    async fn get(&self, id: Uuid) -> Result<Option<ChatSession>> {
        Ok(self.sessions.get(&id).map(|entry| entry.clone()))
    }

    async fn save_messages(&self, session: &ChatSession) -> Result<bool> {
        match self.sessions.get_mut(&session.id) {
            Some(mut stored) => {
                stored.messages = session.messages.clone();
                stored.updated_at = session.updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AiAnalysis, DocumentRef, EditedFields, new_id};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

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

    fn review(edited: bool) -> DoctorReview {
        let edited_fields = edited.then(|| {
            let mut fields = BTreeMap::new();
            fields.insert("diagnoses".to_string(), json!(["iron deficiency"]));
            EditedFields::new(fields).unwrap()
        });
        DoctorReview {
            reviewed_by: new_id(),
            reviewed_at: Utc::now(),
            edited_fields,
            notes: "checked".into(),
        }
    }

    fn feedback_for(report: &Report, review: &DoctorReview) -> Feedback {
        Feedback {
            id: new_id(),
            report_id: report.id,
            doctor_id: review.reviewed_by,
            original_analysis: report.analysis.clone(),
            corrected_analysis: review.edited_fields.clone().unwrap_or_default(),
            accuracy_score: report.analysis.confidence_score,
            comments: review.notes.clone(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_filtered_listing() {
        let storage = InMemoryStorage::new();
        let a = report_with_score(50.0);
        let mut b = report_with_score(50.0);
        b.patient_id = a.patient_id;
        let c = report_with_score(50.0);
        for r in [&a, &b, &c] {
            storage.insert_report(r).await.unwrap();
        }
        storage.record_review(b.id, review(false)).await.unwrap();

        let mine = storage
            .list_reports(ReportFilter::patient(a.patient_id))
            .await
            .unwrap();
        assert_eq!(mine.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        let pending = storage
            .count_reports(ReportFilter::status(ReportStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending, 2);
        assert_eq!(storage.count_reports(ReportFilter::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_review_only_from_pending() {
        let storage = InMemoryStorage::new();
        let report = report_with_score(95.0);
        storage.insert_report(&report).await.unwrap();

        assert_eq!(
            storage.record_review(report.id, review(false)).await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            storage.record_review(report.id, review(false)).await.unwrap(),
            Transition::NotPending(ReportStatus::Reviewed)
        );
        assert_eq!(
            storage.record_review(new_id(), review(false)).await.unwrap(),
            Transition::Missing
        );
    }

    #[tokio::test]
    async fn test_edit_behind_gate_writes_nothing() {
        let storage = InMemoryStorage::new();
        let report = report_with_score(90.0);
        storage.insert_report(&report).await.unwrap();
        let review = review(true);
        let feedback = feedback_for(&report, &review);

        let outcome = storage.record_edit(&feedback, review).await.unwrap();
        assert_eq!(outcome, Transition::GateClosed(90.0));
        assert!(storage.feedback_for_report(report.id).await.unwrap().is_empty());
        let stored = storage.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Pending);
        assert!(stored.doctor_review.is_none());
    }

    #[tokio::test]
    async fn test_edit_writes_feedback_and_report_together() {
        let storage = InMemoryStorage::new();
        let report = report_with_score(40.0);
        storage.insert_report(&report).await.unwrap();
        let review = review(true);
        let feedback = feedback_for(&report, &review);

        let outcome = storage.record_edit(&feedback, review).await.unwrap();
        assert_eq!(outcome, Transition::Applied);
        assert_eq!(storage.feedback_for_report(report.id).await.unwrap().len(), 1);
        let stored = storage.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Edited);
    }

    #[tokio::test]
    async fn test_session_get_or_create_is_idempotent() {
        let storage = InMemoryStorage::new();
        let (patient, report) = (new_id(), new_id());

        let first = storage.get_or_create(patient, report).await.unwrap();
        let second = storage.get_or_create(patient, report).await.unwrap();
        assert_eq!(first.id, second.id);

        let other = storage.get_or_create(new_id(), report).await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn test_save_messages_unknown_session() {
        let storage = InMemoryStorage::new();
        let session = ChatSession::new(new_id(), new_id());
        assert!(!storage.save_messages(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_dangling_session_index_is_an_error() {
        let storage = InMemoryStorage::new();
        let (patient, report) = (new_id(), new_id());
        let session = storage.get_or_create(patient, report).await.unwrap();
        storage.sessions.remove(&session.id);

        let err = storage.get_or_create(patient, report).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
        assert!(storage.get(session.id).await.unwrap().is_none());
    }
}
