use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{error::Result, models::ChatMessage};

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

const SYMPTOM_RESPONSE: &str = "Based on your report, the symptoms identified are listed in the summary. If you need specific clarification, please refer to the symptoms section.";
const DIAGNOSIS_RESPONSE: &str = "Your report contains the diagnoses as analyzed. For detailed medical advice, please consult with your doctor.";
const MEDICATION_RESPONSE: &str = "The medications mentioned in your report are listed. Always follow your doctor's prescription.";
const TEST_RESPONSE: &str = "The recommended tests are based on the analysis. Please discuss with your healthcare provider for scheduling.";
const CAPABILITY_RESPONSE: &str = "I can help you understand your medical report. You can ask about symptoms, diagnoses, medications, or recommended tests.";

/// Produces the assistant's reply for one chat turn.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// `context` is the report summary, `history` the prior turns, oldest first.
    async fn generate(
        &self,
        context: &str,
        history: &[ChatMessage],
        user_message: &str,
    ) -> Result<String>;
}

/// Keyword classifier used when no language model is configured. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackGenerator;

impl FallbackGenerator {
    pub fn respond(user_message: &str) -> &'static str {
        let msg = user_message.to_lowercase();

        // Medication questions take precedence over the other topics.
        if msg.contains("medication") || msg.contains("medicine") {
            MEDICATION_RESPONSE
        } else if msg.contains("symptom") {
            SYMPTOM_RESPONSE
        } else if msg.contains("diagnos") {
            DIAGNOSIS_RESPONSE
        } else if msg.contains("test") || msg.contains("recommend") {
            TEST_RESPONSE
        } else {
            CAPABILITY_RESPONSE
        }
    }
}

#[async_trait]
impl AnswerGenerator for FallbackGenerator {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn generate(
        &self,
        _context: &str,
        _history: &[ChatMessage],
        user_message: &str,
    ) -> Result<String> {
        Ok(Self::respond(user_message).to_string())
    }
}

#[cfg(feature = "rig")]
mod remote {
    use async_trait::async_trait;
    use rig::{
        agent::Agent,
        client::CompletionClient,
        completion::{Chat, Message},
        providers::openrouter,
    };

    use super::AnswerGenerator;
    use crate::{
        error::{Result, ReviewError},
        models::{ChatMessage, MessageRole},
    };

    /// Calls a hosted language model through OpenRouter.
    pub struct RemoteGenerator {
        client: openrouter::Client,
        model: String,
    }

    impl RemoteGenerator {
        pub fn new(api_key: &str, model: impl Into<String>) -> Self {
            Self {
                client: openrouter::Client::new(api_key),
                model: model.into(),
            }
        }

        fn agent(&self, context: &str) -> Agent<openrouter::CompletionModel> {
            let preamble = format!(
                "You are a helpful medical assistant. Answer patient questions about their medical report. \
                 Use only the information from the report context. Be empathetic and clear. \
                 Here is the report:\n\n{}",
                context
            );
            self.client.agent(&self.model).preamble(&preamble).build()
        }
    }

    fn to_rig_message(msg: &ChatMessage) -> Message {
        match msg.role {
            MessageRole::User => Message::user(msg.content.clone()),
            MessageRole::Assistant => Message::assistant(msg.content.clone()),
        }
    }

    #[async_trait]
    impl AnswerGenerator for RemoteGenerator {
        fn name(&self) -> &'static str {
            "remote"
        }

        async fn generate(
            &self,
            context: &str,
            history: &[ChatMessage],
            user_message: &str,
        ) -> Result<String> {
            let history = history.iter().map(to_rig_message).collect();
            let answer = self
                .agent(context)
                .chat(user_message.to_string(), history)
                .await
                .map_err(|e| ReviewError::Generation(format!("LLM chat failed: {}", e)))?;

            if answer.trim().is_empty() {
                return Err(ReviewError::Generation(
                    "no response from language model".to_string(),
                ));
            }
            Ok(answer)
        }
    }
}

#[cfg(feature = "rig")]
pub use remote::RemoteGenerator;

/// Settings for the remote generator. A missing key selects the fallback.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Pick the answer generator once, at startup.
pub fn select_generator(config: &GeneratorConfig) -> Arc<dyn AnswerGenerator> {
    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty());

    match api_key {
        #[cfg(feature = "rig")]
        Some(key) => {
            info!(model = %config.model, "Using remote language model for chat answers");
            Arc::new(RemoteGenerator::new(key, config.model.clone()))
        }
        #[cfg(not(feature = "rig"))]
        Some(_) => {
            warn!("Language model key set but remote support is not compiled in; using fallback answers");
            Arc::new(FallbackGenerator)
        }
        None => {
            warn!("No language model configured; using keyword fallback for chat answers");
            Arc::new(FallbackGenerator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medication_keywords_win_regardless_of_case() {
        assert_eq!(
            FallbackGenerator::respond("Which MEDICINE should I take?"),
            MEDICATION_RESPONSE
        );
        assert_eq!(
            FallbackGenerator::respond("tell me about my Medications"),
            MEDICATION_RESPONSE
        );
        assert_eq!(
            FallbackGenerator::respond("does this medicine cause symptoms?"),
            MEDICATION_RESPONSE
        );
    }

    #[test]
    fn topics_map_to_canned_answers() {
        assert_eq!(FallbackGenerator::respond("Any symptoms?"), SYMPTOM_RESPONSE);
        assert_eq!(FallbackGenerator::respond("what was diagnosed"), DIAGNOSIS_RESPONSE);
        assert_eq!(FallbackGenerator::respond("What do you recommend"), TEST_RESPONSE);
        assert_eq!(FallbackGenerator::respond("hello"), CAPABILITY_RESPONSE);
    }

    #[tokio::test]
    async fn fallback_ignores_context() {
        let generator = FallbackGenerator;
        let a = generator
            .generate("Symptoms: fever", &[], "medicine?")
            .await
            .unwrap();
        let b = generator.generate("", &[], "medicine?").await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn blank_key_selects_fallback() {
        let generator = select_generator(&GeneratorConfig {
            api_key: Some("   ".into()),
            ..Default::default()
        });
        assert_eq!(generator.name(), "fallback");
        assert_eq!(select_generator(&GeneratorConfig::default()).name(), "fallback");
    }

    #[cfg(feature = "rig")]
    #[test]
    fn key_selects_remote() {
        let generator = select_generator(&GeneratorConfig {
            api_key: Some("sk-test".into()),
            ..Default::default()
        });
        assert_eq!(generator.name(), "remote");
    }
}
