#![forbid(unsafe_code)]

//! One full analysis run: fetch → classify under a concurrency bound →
//! aggregate → persist.
//!
//! Aggregation happens in a single-threaded reducer after every
//! classification task has settled, so the counters need no locking. The
//! classified list is re-sorted by fetch index before persisting, because
//! concurrent tasks settle in arbitrary order.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::gemini::{Stance, StanceClassifier};
use crate::store::{AnalysisRecord, AnalysisStore};
use crate::youtube::{self, Comment, CommentSource, VideoId};

pub const DEFAULT_COMMENT_FETCH_LIMIT: usize = 100;
pub const DEFAULT_CLASSIFY_CONCURRENCY: usize = 5;

/// User-facing message for URLs the extractor cannot resolve.
const INVALID_URL_ERROR: &str = "Invalid YouTube URL";

/// A fetched comment together with its classification, as persisted and as
/// returned to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedComment {
    pub text: String,
    pub sentiment: Stance,
    pub published_at: DateTime<Utc>,
    /// Random display mask replacing the commenter identity; regenerated on
    /// every run, no uniqueness guarantee.
    pub masked_username: String,
}

/// Aggregate counts for one run. `distribution` maps a `YYYY-MM` bucket to
/// the number of comments published in that month.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub agree: u64,
    pub disagree: u64,
    pub neutral: u64,
    pub total: u64,
    pub distribution: BTreeMap<String, u64>,
}

impl AnalysisResult {
    /// Folds one classified comment into the aggregate. Every comment lands
    /// in exactly one sentiment counter, which keeps
    /// `agree + disagree + neutral == total` by construction.
    fn record(&mut self, sentiment: Stance, bucket: String) {
        match sentiment {
            Stance::Agree => self.agree += 1,
            Stance::Disagree => self.disagree += 1,
            Stance::Neutral => self.neutral += 1,
        }
        self.total += 1;
        *self.distribution.entry(bucket).or_insert(0) += 1;
    }
}

/// The submission contract: either the aggregate results or a plain error
/// message, never both. Errors are data here, not HTTP failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisOutcome {
    pub fn ok(results: AnalysisResult) -> Self {
        Self {
            success: true,
            results: Some(results),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            results: None,
            error: Some(message.into()),
        }
    }
}

/// Year-month aggregation key for the distribution histogram.
pub fn month_bucket(published_at: DateTime<Utc>) -> String {
    published_at.format("%Y-%m").to_string()
}

/// `User_` plus nine base-36 characters. Display masking only.
fn pseudonym() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("User_{suffix}")
}

/// Drives a single analysis run end to end.
pub struct Analyzer {
    source: Arc<dyn CommentSource>,
    classifier: Arc<dyn StanceClassifier>,
    store: Arc<AnalysisStore>,
    fetch_limit: usize,
    concurrency: usize,
}

impl Analyzer {
    pub fn new(
        source: Arc<dyn CommentSource>,
        classifier: Arc<dyn StanceClassifier>,
        store: Arc<AnalysisStore>,
    ) -> Self {
        Self {
            source,
            classifier,
            store,
            fetch_limit: DEFAULT_COMMENT_FETCH_LIMIT,
            concurrency: DEFAULT_CLASSIFY_CONCURRENCY,
        }
    }

    /// Caps how many comments one run fetches (paginated upstream).
    pub fn with_fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit.max(1);
        self
    }

    /// Caps how many classification calls may be in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs the full pipeline for a user-supplied URL. Never returns an
    /// error: every failure is folded into the outcome payload.
    pub async fn analyze(&self, url: &str) -> AnalysisOutcome {
        let Some(video_id) = youtube::extract_video_id(url) else {
            return AnalysisOutcome::err(INVALID_URL_ERROR);
        };

        match self.run(&video_id).await {
            Ok(results) => AnalysisOutcome::ok(results),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(video_id = %video_id, error = %message, "analysis run failed");
                AnalysisOutcome::err(message)
            }
        }
    }

    async fn run(&self, video_id: &VideoId) -> anyhow::Result<AnalysisResult> {
        let comments = self
            .source
            .top_level_comments(video_id, self.fetch_limit)
            .await
            .context("fetching comments")?;

        info!(video_id = %video_id, count = comments.len(), "classifying comments");
        let classified = self.classify_all(&comments).await;

        let mut results = AnalysisResult::default();
        for comment in &classified {
            results.record(comment.sentiment, month_bucket(comment.published_at));
        }

        let record = AnalysisRecord {
            videoid: video_id.to_string(),
            analyzed_at: Utc::now(),
            comments: classified,
            results: results.clone(),
        };
        self.store
            .insert_analysis(&record)
            .await
            .context("saving analysis")?;

        info!(video_id = %video_id, total = results.total, "analysis persisted");
        Ok(results)
    }

    /// Classifies every comment concurrently, bounded by the semaphore, and
    /// returns the results in original fetch order.
    async fn classify_all(&self, comments: &[Comment]) -> Vec<ClassifiedComment> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (index, comment) in comments.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let classifier = self.classifier.clone();
            tasks.spawn(async move {
                // Acquire never fails: the semaphore outlives every task.
                let _permit = semaphore.acquire_owned().await.ok();
                let sentiment = classifier.classify(&comment.text).await;
                (
                    index,
                    ClassifiedComment {
                        text: comment.text,
                        sentiment,
                        published_at: comment.published_at,
                        masked_username: pseudonym(),
                    },
                )
            });
        }

        let mut settled: Vec<Option<ClassifiedComment>> = vec![None; comments.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, comment)) => settled[index] = Some(comment),
                Err(err) => warn!(error = %err, "classification task was lost"),
            }
        }

        // A lost task still counts its comment, as neutral, so the totals
        // always match the fetched batch size.
        settled
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| ClassifiedComment {
                    text: comments[index].text.clone(),
                    sentiment: Stance::Neutral,
                    published_at: comments[index].published_at,
                    masked_username: pseudonym(),
                })
            })
            .collect()
    }
}
