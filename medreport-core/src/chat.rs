//! Patient chat about a single report.
//!
//! [`ChatEngine`] follows a _load → answer → save_ pattern per message: it
//! resolves the report, loads the session, asks the configured
//! [`AnswerGenerator`] for a reply grounded in the report summary and writes
//! the user/assistant pair back. A failed answer leaves the session untouched.
//!
//! Appends are read-modify-write; two concurrent messages on one session can
//! overwrite each other's turn (last write wins).

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    context::build_report_context,
    deadline::{Deadlines, within},
    error::{Result, ReviewError},
    generator::AnswerGenerator,
    models::{ChatSession, Report},
    storage::{ChatSessionStorage, ReportStorage},
};

#[derive(Clone)]
pub struct ChatEngine {
    reports: Arc<dyn ReportStorage>,
    sessions: Arc<dyn ChatSessionStorage>,
    generator: Arc<dyn AnswerGenerator>,
    deadlines: Deadlines,
}

impl ChatEngine {
    pub fn new(
        reports: Arc<dyn ReportStorage>,
        sessions: Arc<dyn ChatSessionStorage>,
        generator: Arc<dyn AnswerGenerator>,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            reports,
            sessions,
            generator,
            deadlines,
        }
    }

    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    /// The one session for (patient, report), created empty on first use.
    pub async fn get_or_create_session(
        &self,
        patient_id: Uuid,
        report_id: Uuid,
    ) -> Result<ChatSession> {
        within(
            self.deadlines.store,
            "get or create chat session",
            self.sessions.get_or_create(patient_id, report_id),
        )
        .await
    }

    /// Answer one user message within an existing session. The session must
    /// belong to `report_id` and to the report's patient.
    pub async fn process_message(
        &self,
        session_id: Uuid,
        report_id: Uuid,
        user_text: &str,
    ) -> Result<String> {
        let user_text = non_blank(user_text)?;

        // 1. Resolve report and session
        let report = self.load_report(report_id).await?;
        let mut session = within(
            self.deadlines.store,
            "get chat session",
            self.sessions.get(session_id),
        )
        .await?
        .ok_or_else(|| ReviewError::not_found("chat session", session_id))?;
        if session.report_id != report_id || session.patient_id != report.patient_id {
            warn!(
                session_id = %session_id,
                report_id = %report_id,
                "Chat session used outside its report"
            );
            return Err(ReviewError::Forbidden(format!(
                "chat session {} belongs to report {}",
                session_id, session.report_id
            )));
        }

        // 2. Generate the answer from the report summary and prior turns
        let context = build_report_context(&report);
        let answer = within(
            self.deadlines.generator,
            "generate chat answer",
            self.generator.generate(&context, &session.messages, user_text),
        )
        .await
        .inspect_err(|e| {
            error!(
                session_id = %session_id,
                generator = self.generator.name(),
                error = %e,
                "Answer generation failed; turn not recorded"
            );
        })?;

        // 3. Record the turn
        session.append_turn(user_text.to_string(), answer.clone());
        let saved = within(
            self.deadlines.store,
            "save chat session",
            self.sessions.save_messages(&session),
        )
        .await?;
        if !saved {
            return Err(ReviewError::not_found("chat session", session_id));
        }

        info!(
            session_id = %session_id,
            report_id = %report_id,
            messages = session.messages.len(),
            generator = self.generator.name(),
            "Chat turn recorded"
        );
        Ok(answer)
    }

    /// Caller-facing entry point: checks that `patient_id` owns the report
    /// before any session work, then answers within the pair's session.
    pub async fn send_message(
        &self,
        patient_id: Uuid,
        report_id: Uuid,
        user_text: &str,
    ) -> Result<(ChatSession, String)> {
        non_blank(user_text)?;
        self.load_owned_report(patient_id, report_id).await?;

        let session = self.get_or_create_session(patient_id, report_id).await?;
        let answer = self.process_message(session.id, report_id, user_text).await?;

        let session = within(
            self.deadlines.store,
            "get chat session",
            self.sessions.get(session.id),
        )
        .await?
        .ok_or_else(|| ReviewError::not_found("chat session", session.id))?;
        Ok((session, answer))
    }

    /// The pair's conversation so far; the session is created on first access.
    pub async fn history(&self, patient_id: Uuid, report_id: Uuid) -> Result<ChatSession> {
        self.load_owned_report(patient_id, report_id).await?;
        self.get_or_create_session(patient_id, report_id).await
    }

    async fn load_report(&self, report_id: Uuid) -> Result<Report> {
        within(
            self.deadlines.store,
            "get report",
            self.reports.get_report(report_id),
        )
        .await?
        .ok_or_else(|| ReviewError::not_found("report", report_id))
    }

    async fn load_owned_report(&self, patient_id: Uuid, report_id: Uuid) -> Result<Report> {
        let report = self.load_report(report_id).await?;
        if report.patient_id != patient_id {
            return Err(ReviewError::Forbidden(format!(
                "report {} does not belong to patient {}",
                report_id, patient_id
            )));
        }
        Ok(report)
    }
}

fn non_blank(user_text: &str) -> Result<&str> {
    let trimmed = user_text.trim();
    if trimmed.is_empty() {
        return Err(ReviewError::Validation("message cannot be empty".to_string()));
    }
    Ok(trimmed)
}
