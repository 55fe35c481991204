#![forbid(unsafe_code)]

//! YouTube URL resolution and comment retrieval.
//!
//! The extractor turns whatever the user pasted into a canonical 11-character
//! video id; the client wraps the Data API v3 `commentThreads.list` endpoint
//! and flattens the threads into plain [`Comment`] values for the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

const COMMENT_THREADS_URL: &str = "https://www.googleapis.com/youtube/v3/commentThreads";

/// The API rejects `maxResults` above 100, so larger budgets are paginated.
const MAX_PAGE_SIZE: usize = 100;

/// Canonical 11-character YouTube video identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoId(pub String);

impl VideoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pulls the video id out of any of the URL shapes YouTube hands out:
/// `watch?v=`, `youtu.be/`, `/embed/`, `/v/` and the older path variants.
/// Returns `None` for anything unrecognizable; callers treat that as a normal
/// checked outcome, not an error.
pub fn extract_video_id(url: &str) -> Option<VideoId> {
    Regex::new(r#"(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?)/|.*[?&]v=)|youtu\.be/)([^"&?/\s]{11})"#)
        .unwrap()
        .captures(url)
        .and_then(|cap| cap.get(1))
        .map(|m| VideoId(m.as_str().to_string()))
}

/// One top-level comment as fetched from the source, before classification.
#[derive(Debug, Clone)]
pub struct Comment {
    /// Source-assigned thread id; opaque to us.
    pub id: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceApiError {
    #[error("YouTube API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("YouTube API error: {status} {reason}")]
    Status { status: StatusCode, reason: String },
}

/// Anything able to produce the top-level comments of a video. The production
/// implementation is [`YouTubeClient`]; tests substitute stubs.
#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn top_level_comments(
        &self,
        video_id: &VideoId,
        limit: usize,
    ) -> Result<Vec<Comment>, SourceApiError>;
}

/// Thin client over the YouTube Data API v3.
pub struct YouTubeClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl YouTubeClient {
    /// Takes a shared HTTP client so both external services reuse one
    /// connection pool.
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: COMMENT_THREADS_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
        }
    }

    async fn fetch_page(
        &self,
        video_id: &VideoId,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<CommentThreadListResponse, SourceApiError> {
        let page_size = page_size.to_string();
        let mut params = vec![
            ("part", "snippet"),
            ("videoId", video_id.as_str()),
            ("maxResults", page_size.as_str()),
            ("key", self.api_key.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response = self.client.get(&self.base_url).query(&params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceApiError::Status {
                status,
                reason: error_reason(status, &body),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CommentSource for YouTubeClient {
    /// Collects up to `limit` top-level comments, following the API's
    /// continuation tokens across pages. The returned list preserves the
    /// API's ordering and is otherwise unmodified.
    async fn top_level_comments(
        &self,
        video_id: &VideoId,
        limit: usize,
    ) -> Result<Vec<Comment>, SourceApiError> {
        let mut comments = Vec::new();
        let mut page_token: Option<String> = None;

        while comments.len() < limit {
            let page_size = (limit - comments.len()).min(MAX_PAGE_SIZE);
            let page = self
                .fetch_page(video_id, page_size, page_token.as_deref())
                .await?;

            for thread in page.items {
                let snippet = thread.snippet.top_level_comment.snippet;
                comments.push(Comment {
                    id: thread.id,
                    text: snippet.text_display,
                    published_at: snippet.published_at,
                });
                if comments.len() == limit {
                    break;
                }
            }

            match page.next_page_token {
                Some(token) if comments.len() < limit => page_token = Some(token),
                _ => break,
            }
        }

        debug!(video_id = %video_id, count = comments.len(), "fetched comment threads");
        Ok(comments)
    }
}

/// Best-effort extraction of the API's own error message; falls back to the
/// status line when the body is not the usual error envelope.
fn error_reason(status: StatusCode, body: &str) -> String {
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

// --- commentThreads.list response types ---

#[derive(Debug, Deserialize)]
struct CommentThreadListResponse {
    #[serde(default)]
    items: Vec<CommentThread>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentThread {
    id: String,
    snippet: CommentThreadSnippet,
}

#[derive(Debug, Deserialize)]
struct CommentThreadSnippet {
    #[serde(rename = "topLevelComment")]
    top_level_comment: TopLevelComment,
}

#[derive(Debug, Deserialize)]
struct TopLevelComment {
    snippet: CommentSnippet,
}

#[derive(Debug, Deserialize)]
struct CommentSnippet {
    #[serde(rename = "textDisplay")]
    text_display: String,
    #[serde(rename = "publishedAt")]
    published_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
