use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    deadline::{Deadlines, within},
    error::{Result, ReviewError},
    models::{
        AiAnalysis, CONFIDENCE_GATE, DocumentRef, DoctorReview, EditedFields, Feedback, Report,
        ReportStatus, new_id,
    },
    storage::{ReportFilter, ReportStorage, Transition},
};

/// Review counters for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatistics {
    pub total_reports: u64,
    pub reviewed_reports: u64,
    pub pending_reviews: u64,
    pub edited_reports: u64,
    /// Set when a per-status count failed and was reported as zero.
    pub degraded: bool,
}

/// Owns the report state machine: `pending -> reviewed` or `pending -> edited`.
#[derive(Clone)]
pub struct ReportLifecycle {
    storage: Arc<dyn ReportStorage>,
    deadlines: Deadlines,
}

impl ReportLifecycle {
    pub fn new(storage: Arc<dyn ReportStorage>, deadlines: Deadlines) -> Self {
        Self { storage, deadlines }
    }

    pub async fn create(
        &self,
        patient_id: Uuid,
        document: DocumentRef,
        analysis: AiAnalysis,
    ) -> Result<Report> {
        let report = Report::new(patient_id, document, analysis);
        within(
            self.deadlines.store,
            "insert report",
            self.storage.insert_report(&report),
        )
        .await?;

        info!(
            report_id = %report.id,
            patient_id = %patient_id,
            confidence = report.analysis.confidence_score,
            "Report created"
        );
        Ok(report)
    }

    pub async fn get_report(&self, report_id: Uuid) -> Result<Report> {
        within(
            self.deadlines.store,
            "get report",
            self.storage.get_report(report_id),
        )
        .await?
        .ok_or_else(|| ReviewError::not_found("report", report_id))
    }

    /// All reports, or only those in `status`, oldest first.
    pub async fn list_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>> {
        let filter = ReportFilter {
            status,
            ..Default::default()
        };
        within(
            self.deadlines.store,
            "list reports",
            self.storage.list_reports(filter),
        )
        .await
    }

    pub async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<Report>> {
        within(
            self.deadlines.store,
            "list patient reports",
            self.storage.list_reports(ReportFilter::patient(patient_id)),
        )
        .await
    }

    /// Sign off on a pending report without touching its findings.
    pub async fn submit_review(
        &self,
        report_id: Uuid,
        doctor_id: Uuid,
        notes: impl Into<String>,
    ) -> Result<Report> {
        let review = DoctorReview {
            reviewed_by: doctor_id,
            reviewed_at: Utc::now(),
            edited_fields: None,
            notes: notes.into(),
        };

        let outcome = within(
            self.deadlines.store,
            "record review",
            self.storage.record_review(report_id, review),
        )
        .await?;
        check_transition(report_id, outcome)?;

        info!(report_id = %report_id, doctor_id = %doctor_id, "Report reviewed");
        self.get_report(report_id).await
    }

    /// Override findings of a report the analysis was unsure about.
    ///
    /// Allowed only while the report is pending and its confidence is below
    /// [`CONFIDENCE_GATE`]. The feedback record and the status change are
    /// written together; on any refusal neither exists.
    pub async fn edit_analysis(
        &self,
        report_id: Uuid,
        doctor_id: Uuid,
        edited_fields: EditedFields,
        notes: impl Into<String>,
    ) -> Result<Uuid> {
        let report = self.get_report(report_id).await?;

        if !report.analysis.permits_edit() {
            warn!(
                report_id = %report_id,
                confidence = report.analysis.confidence_score,
                "Edit refused by confidence gate"
            );
            return Err(gate_error(report.analysis.confidence_score));
        }

        let notes = notes.into();
        let now = Utc::now();
        let feedback = Feedback {
            id: new_id(),
            report_id,
            doctor_id,
            accuracy_score: report.analysis.confidence_score,
            original_analysis: report.analysis,
            corrected_analysis: edited_fields.clone(),
            comments: notes.clone(),
            created_at: now,
        };
        let review = DoctorReview {
            reviewed_by: doctor_id,
            reviewed_at: now,
            edited_fields: Some(edited_fields),
            notes,
        };

        // The store re-checks status and gate in the same write.
        let outcome = within(
            self.deadlines.store,
            "record edit",
            self.storage.record_edit(&feedback, review),
        )
        .await?;
        check_transition(report_id, outcome)?;

        info!(
            report_id = %report_id,
            doctor_id = %doctor_id,
            feedback_id = %feedback.id,
            accuracy_score = feedback.accuracy_score,
            "Report analysis edited"
        );
        Ok(feedback.id)
    }

    pub async fn feedback_for_report(&self, report_id: Uuid) -> Result<Vec<Feedback>> {
        within(
            self.deadlines.store,
            "list feedback",
            self.storage.feedback_for_report(report_id),
        )
        .await
    }

    /// Counts per status. Only the total is required; a failed status count is
    /// logged, reported as zero and marks the result degraded.
    pub async fn statistics(&self) -> Result<ReviewStatistics> {
        let total_reports = within(
            self.deadlines.store,
            "count reports",
            self.storage.count_reports(ReportFilter::default()),
        )
        .await?;

        let mut stats = ReviewStatistics {
            total_reports,
            ..Default::default()
        };
        stats.reviewed_reports = self.soft_count(ReportStatus::Reviewed, &mut stats.degraded).await;
        stats.pending_reviews = self.soft_count(ReportStatus::Pending, &mut stats.degraded).await;
        stats.edited_reports = self.soft_count(ReportStatus::Edited, &mut stats.degraded).await;
        Ok(stats)
    }

    async fn soft_count(&self, status: ReportStatus, degraded: &mut bool) -> u64 {
        let counted = within(
            self.deadlines.store,
            "count reports by status",
            self.storage.count_reports(ReportFilter::status(status)),
        )
        .await;

        match counted {
            Ok(count) => count,
            Err(e) => {
                warn!(status = %status, error = %e, "Status count failed; reporting zero");
                *degraded = true;
                0
            }
        }
    }
}

fn gate_error(current_confidence: f64) -> ReviewError {
    ReviewError::ConfidenceGate {
        current_confidence,
        threshold: CONFIDENCE_GATE,
    }
}

fn check_transition(report_id: Uuid, outcome: Transition) -> Result<()> {
    match outcome {
        Transition::Applied => Ok(()),
        Transition::Missing => Err(ReviewError::not_found("report", report_id)),
        Transition::NotPending(status) => Err(ReviewError::Forbidden(format!(
            "report {} is already {}",
            report_id, status
        ))),
        Transition::GateClosed(score) => Err(gate_error(score)),
    }
}
