#![forbid(unsafe_code)]

//! Stance classification of a single comment via the Gemini API.
//!
//! Classification is deliberately infallible from the caller's point of view:
//! rate limits and gateway timeouts are retried with exponential backoff, and
//! everything that still fails degrades to [`Stance::Neutral`] so one bad
//! comment can never sink a whole analysis run.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// A comment's stance toward the video it was posted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Agree,
    Disagree,
    Neutral,
}

impl Stance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agree => "agree",
            Self::Disagree => "disagree",
            Self::Neutral => "neutral",
        }
    }
}

/// Maps a model answer onto a [`Stance`].
///
/// Exact one-word answers are matched first. The substring fallback must test
/// "disagree" before "agree" because the former contains the latter; anything
/// else defaults to neutral.
pub fn parse_stance(answer: &str) -> Stance {
    let normalized = answer.trim().to_lowercase();
    match normalized.as_str() {
        "agree" => Stance::Agree,
        "disagree" => Stance::Disagree,
        "neutral" => Stance::Neutral,
        _ if normalized.contains("disagree") => Stance::Disagree,
        _ if normalized.contains("agree") => Stance::Agree,
        _ => Stance::Neutral,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Gemini request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Gemini rate limit exceeded")]
    RateLimited,
    #[error("Gemini gateway timeout")]
    GatewayTimeout,
    #[error("Gemini API error: {status} {message}")]
    Api { status: StatusCode, message: String },
    #[error("Gemini returned no answer text")]
    EmptyAnswer,
}

impl ClassifyError {
    /// Only throttling and gateway timeouts are worth retrying; everything
    /// else fails the same way on the next attempt.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::GatewayTimeout)
    }
}

/// Exponential backoff parameters for retryable classification failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next call once `attempt` calls have failed:
    /// `base_delay * 2^attempt`, saturating rather than overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Anything able to judge one comment's stance. The production implementation
/// is [`GeminiClassifier`]; tests substitute deterministic stubs.
#[async_trait]
pub trait StanceClassifier: Send + Sync {
    async fn classify(&self, comment_text: &str) -> Stance;
}

/// Runs `call` under the retry policy and absorbs every failure into
/// [`Stance::Neutral`]: retryable errors back off and retry up to the attempt
/// cap; non-retryable errors give up immediately.
async fn classify_with_retry<F, Fut>(policy: RetryPolicy, mut call: F) -> Stance
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Stance, ClassifyError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(stance) => return stance,
            Err(err) if err.is_retryable() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, "classification retries exhausted, defaulting to neutral");
                    return Stance::Neutral;
                }
                let delay = policy.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying classification");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(error = %err, "classification failed, defaulting to neutral");
                return Stance::Neutral;
            }
        }
    }
}

/// Client for the `generateContent` endpoint, fixed to the one-word stance
/// prompt the pipeline relies on.
pub struct GeminiClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    policy: RetryPolicy,
}

impl GeminiClassifier {
    /// Takes a shared HTTP client so both external services reuse one
    /// connection pool.
    pub fn new(client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: GEMINI_BASE_URL.to_string(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn prompt_for(comment: &str) -> String {
        format!(
            "Analyze if this YouTube comment agrees, disagrees, or is neutral \
             about the video content. Only respond with one word: \"agree\", \
             \"disagree\", or \"neutral\". Here's the comment: \"{comment}\""
        )
    }

    async fn request_stance(&self, comment: &str) -> Result<Stance, ClassifyError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": Self::prompt_for(comment) }] }]
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ClassifyError::RateLimited);
        }
        if status == StatusCode::GATEWAY_TIMEOUT {
            return Err(ClassifyError::GatewayTimeout);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Api {
                status,
                message: api_error_message(status, &body),
            });
        }

        let payload: GenerateContentResponse = response.json().await?;
        let answer = payload
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .map(|part| part.text)
            .ok_or(ClassifyError::EmptyAnswer)?;

        Ok(parse_stance(&answer))
    }
}

#[async_trait]
impl StanceClassifier for GeminiClassifier {
    async fn classify(&self, comment_text: &str) -> Stance {
        classify_with_retry(self.policy, || self.request_stance(comment_text)).await
    }
}

/// Best-effort extraction of the API's own error message; falls back to the
/// status line when the body is not the usual error envelope.
fn api_error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

// --- generateContent response types ---

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
