use thiserror::Error;

/// Errors surfaced by the review lifecycle and chat engine.
#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Cannot edit - confidence score is {current_confidence:.1}% (>= {threshold}%)")]
    ConfidenceGate {
        current_confidence: f64,
        threshold: f64,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },
}

/// The error taxonomy callers map onto their own transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Validation,
    Persistence,
    Analysis,
    Generation,
    Timeout,
}

impl ReviewError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ConfidenceGate { .. } | Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Analysis(_) => ErrorKind::Analysis,
            Self::Generation(_) => ErrorKind::Generation,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

impl From<sqlx::Error> for ReviewError {
    fn from(e: sqlx::Error) -> Self {
        ReviewError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for ReviewError {
    fn from(e: serde_json::Error) -> Self {
        ReviewError::Persistence(format!("serialization failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, ReviewError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_violation_is_forbidden_and_reports_score() {
        let err = ReviewError::ConfidenceGate {
            current_confidence: 92.5,
            threshold: 90.0,
        };
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(err.to_string().contains("92.5%"));
    }

    #[test]
    fn not_found_names_entity() {
        let err = ReviewError::not_found("report", "abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "report not found: abc");
    }

    #[test]
    fn analysis_and_generation_stay_distinct() {
        let analysis = ReviewError::Analysis("engine down".into());
        let generation = ReviewError::Generation("llm down".into());
        assert_eq!(analysis.kind(), ErrorKind::Analysis);
        assert_eq!(generation.kind(), ErrorKind::Generation);
        assert_eq!(analysis.to_string(), "Analysis error: engine down");
    }
}
