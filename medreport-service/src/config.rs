use anyhow::{Context, Result};
use medreport_core::{Deadlines, GeneratorConfig, generator::DEFAULT_MODEL};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ANALYSIS_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub analysis_api_url: String,
    pub upload_dir: PathBuf,
    pub generator: GeneratorConfig,
    pub deadlines: Deadlines,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(raw) => raw.trim().parse().context("PORT must be a port number")?,
            None => DEFAULT_PORT,
        };

        let defaults = Deadlines::default();
        let seconds = |key: &str, fallback: Duration| -> Result<Duration> {
            match get(key) {
                Some(raw) => {
                    let secs: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{} must be a whole number of seconds", key))?;
                    anyhow::ensure!(secs > 0, "{} must be positive", key);
                    Ok(Duration::from_secs(secs))
                }
                None => Ok(fallback),
            }
        };

        Ok(Self {
            port,
            database_url: get("DATABASE_URL"),
            analysis_api_url: get("ANALYSIS_API_URL")
                .unwrap_or_else(|| DEFAULT_ANALYSIS_URL.to_string()),
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("medreport-uploads")),
            generator: GeneratorConfig {
                api_key: get("OPENROUTER_API_KEY"),
                model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            },
            deadlines: Deadlines {
                store: seconds("STORE_TIMEOUT_SECS", defaults.store)?,
                analysis: seconds("ANALYSIS_TIMEOUT_SECS", defaults.analysis)?,
                generator: seconds("GENERATOR_TIMEOUT_SECS", defaults.generator)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<ServiceConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.analysis_api_url, "http://localhost:8000");
        assert!(config.generator.api_key.is_none());
        assert_eq!(config.deadlines.store, Duration::from_secs(10));
        assert_eq!(config.deadlines.analysis, Duration::from_secs(60));
        assert_eq!(config.deadlines.generator, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/medreport"),
            ("OPENROUTER_API_KEY", "sk-or-test"),
            ("LLM_MODEL", "anthropic/claude-3.5-haiku"),
            ("GENERATOR_TIMEOUT_SECS", "5"),
            ("UPLOAD_DIR", "/srv/uploads"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/medreport"));
        assert_eq!(config.generator.api_key.as_deref(), Some("sk-or-test"));
        assert_eq!(config.generator.model, "anthropic/claude-3.5-haiku");
        assert_eq!(config.deadlines.generator, Duration::from_secs(5));
        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config(&[("PORT", "http")]).is_err());
        assert!(config(&[("STORE_TIMEOUT_SECS", "0")]).is_err());
        assert!(config(&[("ANALYSIS_TIMEOUT_SECS", "soon")]).is_err());
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        let config = config(&[("DATABASE_URL", "  "), ("OPENROUTER_API_KEY", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.generator.api_key.is_none());
    }
}
