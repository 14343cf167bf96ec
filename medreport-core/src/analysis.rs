//! Client side of the external report analysis engine.
//!
//! The engine receives the raw PDF and answers with entities grouped by
//! category, ranked test recommendations (confidence in `[0, 1]`) and warnings.
//! [`AiAnalysis::from_findings`] turns that answer into the stored shape:
//! per-recommendation confidence becomes a percentage and the overall score is
//! their mean, or `0` when nothing was recommended. A confidence outside
//! `[0, 1]` (including NaN) rejects the whole answer.

use async_trait::async_trait;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info};

use crate::{
    error::{Result, ReviewError},
    models::{AiAnalysis, Entities, Recommendation},
};

/// Recommendation as returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecommendation {
    pub test: String,
    pub reason: String,
    #[serde(default)]
    pub contraindications: Vec<String>,
    /// Fraction in [0, 1].
    pub confidence: f64,
    pub urgency: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// The engine's response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisFindings {
    #[serde(default)]
    pub entities: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub recommendations: Vec<RawRecommendation>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AiAnalysis {
    pub fn from_findings(mut findings: AnalysisFindings) -> Result<Self> {
        if let Some(bad) = findings
            .recommendations
            .iter()
            .find(|r| !r.confidence.is_finite() || !(0.0..=1.0).contains(&r.confidence))
        {
            return Err(ReviewError::Analysis(format!(
                "confidence for {} must be within [0, 1], got {}",
                bad.test, bad.confidence
            )));
        }

        let mut take = |category: &str| findings.entities.remove(category).unwrap_or_default();
        let entities = Entities {
            symptoms: take("symptoms"),
            diagnoses: take("diagnoses"),
            medications: take("medications"),
            tests: take("tests"),
            vitals: take("vitals"),
            severity: take("severity"),
            urgency: take("urgency"),
            functional_impact: take("functional_impact"),
        };

        let confidence_score = if findings.recommendations.is_empty() {
            0.0
        } else {
            let sum: f64 = findings.recommendations.iter().map(|r| r.confidence).sum();
            sum / findings.recommendations.len() as f64 * 100.0
        };

        let recommendations = findings
            .recommendations
            .into_iter()
            .map(|r| Recommendation {
                test: r.test,
                reason: r.reason,
                contraindications: r.contraindications,
                confidence: r.confidence * 100.0,
                urgency: r.urgency,
                explanation: r.explanation.filter(|e| !e.trim().is_empty()),
            })
            .collect();

        Ok(Self {
            entities,
            recommendations,
            warnings: findings.warnings,
            confidence_score,
        })
    }
}

/// Trait for anything that can turn document bytes into findings
#[async_trait]
pub trait ReportAnalyzer: Send + Sync {
    async fn analyze(&self, file_name: &str, document: Vec<u8>) -> Result<AnalysisFindings>;
}

/// Posts the document as multipart form data to `{base_url}/analyze_report`.
pub struct HttpAnalyzer {
    client: Client,
    base_url: String,
}

impl HttpAnalyzer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ReportAnalyzer for HttpAnalyzer {
    async fn analyze(&self, file_name: &str, document: Vec<u8>) -> Result<AnalysisFindings> {
        info!(file_name, bytes = document.len(), "Sending report to analysis engine");

        let part = Part::bytes(document)
            .file_name(file_name.to_string())
            .mime_str("application/pdf")
            .map_err(|e| ReviewError::Analysis(format!("invalid document part: {}", e)))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/analyze_report", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ReviewError::Analysis(format!("analysis engine unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "Analysis engine rejected report");
            return Err(ReviewError::Analysis(format!(
                "analysis engine error (status {}): {}",
                status, body
            )));
        }

        response
            .json::<AnalysisFindings>()
            .await
            .map_err(|e| ReviewError::Analysis(format!("failed to decode analysis: {}", e)))
    }
}
