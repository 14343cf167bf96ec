pub mod analysis;
pub mod chat;
pub mod context;
pub mod deadline;
pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod models;
pub mod storage;
pub mod storage_postgres;

// Re-export commonly used types
pub use analysis::{AnalysisFindings, HttpAnalyzer, RawRecommendation, ReportAnalyzer};
pub use chat::ChatEngine;
pub use context::build_report_context;
pub use deadline::Deadlines;
pub use error::{ErrorKind, Result, ReviewError};
#[cfg(feature = "rig")]
pub use generator::RemoteGenerator;
pub use generator::{AnswerGenerator, FallbackGenerator, GeneratorConfig, select_generator};
pub use lifecycle::{ReportLifecycle, ReviewStatistics};
pub use models::{
    AiAnalysis, CONFIDENCE_GATE, ChatMessage, ChatSession, DocumentRef, DoctorReview,
    EditedFields, Entities, Feedback, MessageRole, Recommendation, Report, ReportStatus,
};
pub use storage::{ChatSessionStorage, InMemoryStorage, ReportFilter, ReportStorage};
pub use storage_postgres::PostgresStorage;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_review_then_chat() {
        let storage = Arc::new(InMemoryStorage::new());
        let lifecycle = ReportLifecycle::new(storage.clone(), Deadlines::default());
        let chat = ChatEngine::new(
            storage.clone(),
            storage,
            Arc::new(FallbackGenerator),
            Deadlines::default(),
        );

        let patient = models::new_id();
        let report = lifecycle
            .create(
                patient,
                DocumentRef {
                    path: "/tmp/cbc.pdf".into(),
                    file_name: "cbc.pdf".into(),
                },
                AiAnalysis {
                    confidence_score: 64.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("medications".to_string(), json!(["ferrous sulfate"]));
        lifecycle
            .edit_analysis(
                report.id,
                models::new_id(),
                EditedFields::new(fields).unwrap(),
                "switch iron supplement",
            )
            .await
            .unwrap();

        let (session, answer) = chat
            .send_message(patient, report.id, "Any tests recommended?")
            .await
            .unwrap();
        assert!(answer.contains("recommended tests"));
        assert_eq!(session.messages.len(), 2);

        let history = chat.history(patient, report.id).await.unwrap();
        assert_eq!(history.id, session.id);
        assert_eq!(history.messages, session.messages);
    }
}
