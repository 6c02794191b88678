//! Response Generator
//!
//! Persona + stimulus text -> reply text. The backend is pluggable:
//! - `HttpGenerator` posts to an external LLM endpoint
//! - `CannedGenerator` returns stock acknowledgements when none is configured
//!
//! Every call is bounded by a timeout and the output is sanitized (emoji and
//! hashtags stripped). Failures never mutate engine state.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Generation failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("Generator backend error: {0}")]
    Backend(String),

    #[error("Generator timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Generator returned an empty reply")]
    Empty,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, persona: &str, stimulus: &str) -> Result<String, GenerationError>;
}

static EMOJI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "[",
        "\u{1F600}-\u{1F64F}",
        "\u{1F300}-\u{1F5FF}",
        "\u{1F680}-\u{1F6FF}",
        "\u{1F700}-\u{1F77F}",
        "\u{1F780}-\u{1F7FF}",
        "\u{1F800}-\u{1F8FF}",
        "\u{1F900}-\u{1F9FF}",
        "\u{1FA00}-\u{1FA6F}",
        "\u{1FA70}-\u{1FAFF}",
        "\u{2702}-\u{27B0}",
        "\u{24C2}-\u{1F251}",
        "]+"
    ))
    .expect("emoji pattern is valid")
});

static HASHTAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\w+").expect("hashtag pattern is valid"));

/// Strip emoji and hashtags, collapse the leftover whitespace
pub fn sanitize_reply(text: &str) -> String {
    let text = EMOJI_PATTERN.replace_all(text, "");
    let text = HASHTAG_PATTERN.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Call the generator under a timeout and sanitize the result
pub async fn generate_reply(
    generator: &dyn ResponseGenerator,
    timeout: Duration,
    persona: &str,
    stimulus: &str,
) -> Result<String, GenerationError> {
    let raw = tokio::time::timeout(timeout, generator.generate(persona, stimulus))
        .await
        .map_err(|_| GenerationError::Timeout(timeout))??;

    let reply = sanitize_reply(&raw);
    if reply.is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(reply)
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    personality: &'a str,
    input_text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Generator backed by an HTTP endpoint: `POST {personality, input_text}` -> `{response}`
#[derive(Clone)]
pub struct HttpGenerator {
    client: Client,
    url: String,
}

impl HttpGenerator {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ResponseGenerator for HttpGenerator {
    async fn generate(&self, persona: &str, stimulus: &str) -> Result<String, GenerationError> {
        debug!("Calling generator: persona_len={}, input_len={}", persona.len(), stimulus.len());

        let response = self
            .client
            .post(&self.url)
            .json(&GenerateRequest {
                personality: persona,
                input_text: stimulus,
            })
            .send()
            .await
            .map_err(|e| GenerationError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend(format!("{}: {}", status, text)));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Backend(e.to_string()))?;
        Ok(body.response)
    }
}

const CANNED_REPLIES: &[&str] = &[
    "Sure, I'll keep that in mind.",
    "Absolutely, no problem!",
    "Alright, consider it done.",
    "Got it.",
];

/// Placeholder generator that ignores the persona
#[derive(Debug, Default, Clone, Copy)]
pub struct CannedGenerator;

#[async_trait]
impl ResponseGenerator for CannedGenerator {
    async fn generate(&self, _persona: &str, _stimulus: &str) -> Result<String, GenerationError> {
        let reply = CANNED_REPLIES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Got it.");
        Ok(reply.to_string())
    }
}

/// Generator that answers with a fixed text and remembers every call
#[derive(Debug, Default)]
pub struct RecordingGenerator {
    reply: String,
    calls: parking_lot::Mutex<Vec<(String, String)>>,
}

impl RecordingGenerator {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// (persona, stimulus) pairs in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ResponseGenerator for RecordingGenerator {
    async fn generate(&self, persona: &str, stimulus: &str) -> Result<String, GenerationError> {
        self.calls
            .lock()
            .push((persona.to_string(), stimulus.to_string()));
        Ok(self.reply.clone())
    }
}
