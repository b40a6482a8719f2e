//! Prompt authoring (§9).
//!
//! System prompts and intent-classification templates are opaque
//! strings loaded from an external TOML file at startup; hot-reload is
//! out of scope here, matching §9's "the collaborator is the config
//! file on disk." A missing or unparsable file degrades to built-in
//! defaults rather than failing startup, the same posture as the phrase
//! cache's `load()`.

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct PromptSet {
    #[serde(default = "default_reply_system")]
    pub reply_system: String,
    #[serde(default = "default_classify_template")]
    pub classify_template: String,
    #[serde(default = "default_summary_system")]
    pub summary_system: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            reply_system: default_reply_system(),
            classify_template: default_classify_template(),
            summary_system: default_summary_system(),
        }
    }
}

fn default_reply_system() -> String {
    "Tu es un assistant vocal du support technique. Reponds en une phrase courte et naturelle en francais.".to_string()
}

fn default_classify_template() -> String {
    "Classe la reponse de l'appelant dans le schema Intent JSON (kind, confidence, extracted, \
requires_clarification, off_topic, reasoning). Reponds uniquement en JSON valide."
        .to_string()
}

fn default_summary_system() -> String {
    "Resume cet appel de support en une phrase, en francais, sans donnees personnelles superflues.".to_string()
}

/// Load `path` as TOML into a [`PromptSet`]; any failure (missing file,
/// unreadable, malformed TOML) logs a warning and falls back to the
/// built-in defaults above.
pub async fn load(path: &str) -> PromptSet {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) =>
            match toml::from_str(&contents) {
                Ok(prompts) => prompts,
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to parse prompts file, using defaults");
                    PromptSet::default()
                }
            }
        Err(e) => {
            warn!(path = %path, error = %e, "prompts file missing, using defaults");
            PromptSet::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let prompts = load("/nonexistent/prompts.toml").await;
        assert_eq!(prompts.reply_system, default_reply_system());
    }

    #[tokio::test]
    async fn test_parses_partial_overrides() {
        let dir = std::env::temp_dir();
        let path = dir.join("voicebot-prompts-test.toml");
        tokio::fs::write(&path, r#"reply_system = "custom system prompt""#).await.unwrap();

        let prompts = load(path.to_str().unwrap()).await;
        assert_eq!(prompts.reply_system, "custom system prompt");
        assert_eq!(prompts.classify_template, default_classify_template());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_malformed_toml_yields_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join("voicebot-prompts-malformed-test.toml");
        tokio::fs::write(&path, "not valid = = toml").await.unwrap();

        let prompts = load(path.to_str().unwrap()).await;
        assert_eq!(prompts.reply_system, default_reply_system());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
