#![forbid(unsafe_code)]

//! JSON API backend for TubeStance.
//!
//! The frontend submits a video URL and receives the aggregate stance counts
//! plus the monthly distribution; persisted runs stay readable afterwards.
//! All pipeline failures come back inside the outcome payload with HTTP 200 —
//! only the read endpoints use HTTP error codes.

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tubestance_tools::analysis::{AnalysisOutcome, Analyzer};
use tubestance_tools::config::{RuntimeOverrides, resolve_runtime_config};
use tubestance_tools::gemini::GeminiClassifier;
use tubestance_tools::security::ensure_not_root;
use tubestance_tools::store::{AnalysisReader, AnalysisRecord, AnalysisStore, AnalysisSummary};
use tubestance_tools::youtube::{self, YouTubeClient};

/// Upstream calls that hang should not pin a task forever; the retry policy
/// only bounds retryable failures, so the client carries a hard timeout too.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    db_path: Option<PathBuf>,
    port: Option<u16>,
    host: Option<String>,
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--db-path=") {
                parsed.db_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                parsed.env_file = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--db-path" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--db-path requires a value"))?;
                    parsed.db_path = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(value);
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    parsed.env_file = Some(PathBuf::from(value));
                }
                other => bail!("unrecognized argument: {other}"),
            }
        }
        Ok(parsed)
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| anyhow!("invalid port value: {value}"))
}

/// Shared state injected into every Axum handler.
///
/// * `analyzer` runs the whole fetch/classify/persist pipeline.
/// * `reader` serves persisted runs.
/// * `in_flight` rejects a second submission for a video that is still being
///   analyzed, since a duplicate run would just burn the same upstream quota.
#[derive(Clone)]
struct AppState {
    analyzer: Arc<Analyzer>,
    reader: Arc<AnalysisReader>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    async fn run_analysis(&self, url: &str) -> AnalysisOutcome {
        let Some(video_id) = youtube::extract_video_id(url) else {
            return AnalysisOutcome::err("Invalid YouTube URL");
        };

        let guard_key = video_id.to_string();
        if !self.in_flight.lock().insert(guard_key.clone()) {
            return AnalysisOutcome::err("analysis already in progress for this video");
        }

        let outcome = self.analyzer.analyze(url).await;
        self.in_flight.lock().remove(&guard_key);
        outcome
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = resolve_runtime_config(RuntimeOverrides {
        db_path: args.db_path,
        port: args.port,
        host: args.host,
        env_path: args.env_file,
    })?;

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("parsing listen host {}", config.host))?;

    // One client serves both external services so they share a pool.
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")?;

    let source = Arc::new(YouTubeClient::new(
        client.clone(),
        config.youtube_api_key.clone(),
    ));
    let classifier = Arc::new(GeminiClassifier::new(
        client,
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
    ));

    let store = AnalysisStore::open(&config.db_path)
        .await
        .context("initializing analysis store")?;
    let reader = AnalysisReader::new(&config.db_path)
        .await
        .context("initializing analysis reader")?;

    let analyzer = Analyzer::new(source, classifier, Arc::new(store))
        .with_fetch_limit(config.comment_fetch_limit)
        .with_concurrency(config.classify_concurrency);

    let state = AppState {
        analyzer: Arc::new(analyzer),
        reader: Arc::new(reader),
        in_flight: Arc::new(Mutex::new(HashSet::new())),
    };

    let app = Router::new()
        .route("/api/analyses", post(submit_analysis).get(list_analyses))
        .route("/api/analyses/{id}", get(get_analysis))
        .with_state(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    url: String,
}

/// The submission endpoint. Always HTTP 200; success and failure both travel
/// inside the outcome payload.
async fn submit_analysis(
    State(state): State<AppState>,
    Json(payload): Json<AnalyzeRequest>,
) -> Json<AnalysisOutcome> {
    Json(state.run_analysis(&payload.url).await)
}

async fn list_analyses(State(state): State<AppState>) -> ApiResult<Json<Vec<AnalysisSummary>>> {
    state
        .reader
        .list_analyses()
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(err.to_string()))
}

async fn get_analysis(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<AnalysisRecord>> {
    let record = state
        .reader
        .get_analysis(id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    record
        .map(Json)
        .ok_or_else(|| ApiError::not_found("analysis not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::extract::State as AxumState;
    use serde_json::Value;
    use tempfile::tempdir;
    use tubestance_tools::gemini::{Stance, StanceClassifier};
    use tubestance_tools::youtube::{Comment, CommentSource, SourceApiError, VideoId};

    struct StubSource(Vec<Comment>);

    #[async_trait]
    impl CommentSource for StubSource {
        async fn top_level_comments(
            &self,
            _video_id: &VideoId,
            limit: usize,
        ) -> Result<Vec<Comment>, SourceApiError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    struct KeywordClassifier;

    #[async_trait]
    impl StanceClassifier for KeywordClassifier {
        async fn classify(&self, comment_text: &str) -> Stance {
            if comment_text.contains("love") {
                Stance::Agree
            } else if comment_text.contains("wrong") {
                Stance::Disagree
            } else {
                Stance::Neutral
            }
        }
    }

    fn sample_comment(text: &str, published_at: &str) -> Comment {
        Comment {
            id: text.into(),
            text: text.into(),
            published_at: published_at.parse().unwrap(),
        }
    }

    struct BackendTestContext {
        _dir: tempfile::TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new(comments: Vec<Comment>) -> Self {
            let dir = tempdir().unwrap();
            let path = dir.path().join("analyses.db");
            let store = AnalysisStore::open(&path).await.unwrap();
            let reader = AnalysisReader::new(&path).await.unwrap();
            let analyzer = Analyzer::new(
                Arc::new(StubSource(comments)),
                Arc::new(KeywordClassifier),
                Arc::new(store),
            );
            Self {
                _dir: dir,
                state: AppState {
                    analyzer: Arc::new(analyzer),
                    reader: Arc::new(reader),
                    in_flight: Arc::new(Mutex::new(HashSet::new())),
                },
            }
        }
    }

    #[test]
    fn args_accept_both_flag_forms() {
        let args = BackendArgs::from_iter(
            ["--db-path=/tmp/a.db", "--port", "9001", "--host=0.0.0.0"].map(String::from),
        )
        .unwrap();
        assert_eq!(args.db_path, Some(PathBuf::from("/tmp/a.db")));
        assert_eq!(args.port, Some(9001));
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert!(args.env_file.is_none());
    }

    #[test]
    fn args_reject_invalid_port() {
        let err = BackendArgs::from_iter(["--port=seventy".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid port value"));
    }

    #[test]
    fn args_reject_unknown_flags() {
        let err = BackendArgs::from_iter(["--media-root=/yt".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unrecognized argument"));
    }

    #[tokio::test]
    async fn submission_returns_counts_and_persists() {
        let ctx = BackendTestContext::new(vec![
            sample_comment("love it", "2023-03-15T08:00:00Z"),
            sample_comment("this is wrong", "2023-03-20T08:00:00Z"),
            sample_comment("meh", "2023-04-01T08:00:00Z"),
        ])
        .await;

        let Json(outcome) = submit_analysis(
            AxumState(ctx.state.clone()),
            Json(AnalyzeRequest {
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            }),
        )
        .await;

        assert!(outcome.success);
        let results = outcome.results.unwrap();
        assert_eq!((results.agree, results.disagree, results.neutral), (1, 1, 1));
        assert_eq!(results.total, 3);

        let Json(summaries) = list_analyses(AxumState(ctx.state.clone())).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].videoid, "dQw4w9WgXcQ");

        let Json(record) = get_analysis(AxumState(ctx.state.clone()), AxumPath(summaries[0].id))
            .await
            .unwrap();
        assert_eq!(record.comments.len(), 3);
    }

    #[tokio::test]
    async fn invalid_url_comes_back_as_failure_payload() {
        let ctx = BackendTestContext::new(Vec::new()).await;

        let Json(outcome) = submit_analysis(
            AxumState(ctx.state.clone()),
            Json(AnalyzeRequest {
                url: "https://example.com/watch?v=nope".into(),
            }),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Invalid YouTube URL"));
    }

    #[tokio::test]
    async fn concurrent_submission_for_same_video_is_rejected() {
        let ctx = BackendTestContext::new(Vec::new()).await;
        ctx.state.in_flight.lock().insert("dQw4w9WgXcQ".to_string());

        let outcome = ctx.state.run_analysis("https://youtu.be/dQw4w9WgXcQ").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("already in progress"));
    }

    #[tokio::test]
    async fn in_flight_guard_clears_after_a_run() {
        let ctx = BackendTestContext::new(Vec::new()).await;

        let first = ctx.state.run_analysis("https://youtu.be/dQw4w9WgXcQ").await;
        assert!(first.success);
        let second = ctx.state.run_analysis("https://youtu.be/dQw4w9WgXcQ").await;
        assert!(second.success, "guard must release once the run settles");
    }

    #[tokio::test]
    async fn missing_analysis_is_a_404() {
        let ctx = BackendTestContext::new(Vec::new()).await;
        let err = get_analysis(AxumState(ctx.state.clone()), AxumPath(42))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "missing");
    }
}
