//! LLM client (C6).
//!
//! Two call shapes over one HTTPS chat-completion endpoint (Groq-shaped):
//! `complete` (free-form reply) and `classify_json` (low-temperature Intent
//! classification). Both carry a hard deadline; timing out or any transport
//! error degrades to a local fallback rather than propagating to the dialog
//! (§4.6, §7).

use crate::error::CoreError;
use crate::intent::{ parse_classification, Intent };
use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use std::time::Duration;
use tracing::warn;

pub const FALLBACK_SENTENCE: &str = "Je suis désolé, pouvez-vous répéter ?";
const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
const COMPLETE_MAX_TOKENS: u32 = 150;
const COMPLETE_TEMPERATURE: f32 = 0.7;
const CLASSIFY_MAX_TOKENS: u32 = 300;
const CLASSIFY_TEMPERATURE: f32 = 0.1;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> String;
    async fn classify_json(&self, prompt_template: &str, user_text: &str) -> Intent;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// HTTPS chat-completion client, shaped after Groq's OpenAI-compatible API.
pub struct GroqLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    deadline: Duration,
}

impl GroqLlmClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            model,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn chat(&self, system_prompt: &str, user_text: &str, temperature: f32, max_tokens: u32) -> Result<
        String,
        CoreError
    > {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_text }
            ],
            temperature,
            max_tokens,
        };

        let request = self.http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time
            ::timeout(self.deadline, request).await
            .map_err(|_| CoreError::ProviderTimeout(self.deadline))?
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::ProviderError(format!("llm http status {}", response.status())));
        }

        let parsed: ChatResponse = response
            .json().await
            .map_err(|e| CoreError::ParseError(e.to_string()))?;

        parsed.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::ParseError("empty choices array".into()))
    }
}

#[async_trait]
impl LlmClient for GroqLlmClient {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> String {
        match self.chat(system_prompt, user_text, COMPLETE_TEMPERATURE, COMPLETE_MAX_TOKENS).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "llm complete failed, using fallback sentence");
                FALLBACK_SENTENCE.to_string()
            }
        }
    }

    async fn classify_json(&self, prompt_template: &str, user_text: &str) -> Intent {
        match self.chat(prompt_template, user_text, CLASSIFY_TEMPERATURE, CLASSIFY_MAX_TOKENS).await {
            Ok(body) => parse_classification(&body),
            Err(e) => {
                warn!(error = %e, "llm classify_json failed, using unclear intent");
                Intent::unclear()
            }
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! Deterministic LLM double for dialog/boundary tests (§8) that must
    //! not require network access.
    use super::*;
    use std::sync::Mutex;

    pub struct FakeLlmClient {
        pub complete_reply: String,
        pub classify_reply: Intent,
        pub delay: Option<Duration>,
        pub calls: Mutex<u32>,
    }

    impl Default for FakeLlmClient {
        fn default() -> Self {
            Self {
                complete_reply: "d'accord".into(),
                classify_reply: Intent::unclear(),
                delay: None,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlmClient {
        async fn complete(&self, _system_prompt: &str, _user_text: &str) -> String {
            *self.calls.lock().unwrap() += 1;
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.complete_reply.clone()
        }

        async fn classify_json(&self, _prompt_template: &str, _user_text: &str) -> Intent {
            *self.calls.lock().unwrap() += 1;
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.classify_reply.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLlmClient;
    use super::*;
    use crate::intent::IntentKind;

    #[tokio::test]
    async fn test_complete_returns_configured_reply() {
        let llm = FakeLlmClient::default();
        let reply = llm.complete("system", "bonjour").await;
        assert_eq!(reply, "d'accord");
    }

    #[tokio::test]
    async fn test_classify_json_default_is_unclear() {
        let llm = FakeLlmClient::default();
        let intent = llm.classify_json("template", "euh...").await;
        assert_eq!(intent.kind, IntentKind::Unclear);
    }

    #[tokio::test]
    async fn test_deadline_elapsing_never_panics_caller_side() {
        // A fake standing in for a provider call that would time out: the
        // real client maps this to CoreError::ProviderTimeout and falls
        // back, never propagating to the dialog. Exercised here via the
        // fake's artificial delay against a short caller-side timeout.
        let llm = FakeLlmClient {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let result = tokio::time::timeout(Duration::from_millis(5), llm.complete("s", "u")).await;
        assert!(result.is_err(), "caller-side timeout should elapse before the fake replies");
    }
}
