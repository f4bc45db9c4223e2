//! Local file cache + HTTP fetch utilities for clean-scraper.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use globset::GlobBuilder;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

/// Path-keyed store rooted at one directory.
///
/// A path that exists is authoritative: nothing here hashes or revalidates content, and
/// callers opt into refetching with an explicit `force` flag.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    /// True iff a regular file exists at `root/name`.
    pub async fn exists(&self, name: impl AsRef<Path>) -> bool {
        fs::metadata(self.path_for(name))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    pub async fn read_text(&self, name: impl AsRef<Path>) -> anyhow::Result<String> {
        let path = self.path_for(name);
        debug!(path = %path.display(), "reading from cache");
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading cached file {}", path.display()))
    }

    pub async fn read_json<T: DeserializeOwned>(&self, name: impl AsRef<Path>) -> anyhow::Result<T> {
        let path = self.path_for(name);
        let text = self.read_text(&path).await?;
        serde_json::from_str(&text).with_context(|| format!("parsing cached JSON {}", path.display()))
    }

    pub async fn write_text(&self, name: impl AsRef<Path>, text: &str) -> anyhow::Result<PathBuf> {
        self.write_atomic(name.as_ref(), text.as_bytes()).await
    }

    pub async fn write_binary(&self, name: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        self.write_atomic(name.as_ref(), bytes).await
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        name: impl AsRef<Path>,
        value: &T,
    ) -> anyhow::Result<PathBuf> {
        let name = name.as_ref();
        let text = serde_json::to_string_pretty(value)
            .with_context(|| format!("serializing JSON for {}", name.display()))?;
        self.write_atomic(name, text.as_bytes()).await
    }

    /// Download `url` into `name` unless the file is already cached.
    ///
    /// With `force == false` an existing file short-circuits before any network activity.
    pub async fn download(
        &self,
        http: &HttpFetcher,
        name: impl AsRef<Path>,
        url: &str,
        force: bool,
        options: &RequestOptions,
    ) -> anyhow::Result<PathBuf> {
        let name = name.as_ref();
        let absolute_path = self.path_for(name);
        if !force && self.exists(name).await {
            debug!(path = %absolute_path.display(), "file found in cache");
            return Ok(absolute_path);
        }

        let parent = ensure_parent(&absolute_path).await?;
        let mut response = http.send(url, options).await?;
        debug!(url, path = %absolute_path.display(), "downloading");

        let temp_path = parent.join(temp_file_name());
        let streamed: anyhow::Result<()> = async {
            let mut file = fs::File::create(&temp_path)
                .await
                .with_context(|| format!("opening temp download file {}", temp_path.display()))?;
            while let Some(chunk) = response
                .chunk()
                .await
                .with_context(|| format!("streaming body of {url}"))?
            {
                file.write_all(&chunk)
                    .await
                    .with_context(|| format!("writing temp download file {}", temp_path.display()))?;
            }
            file.flush()
                .await
                .with_context(|| format!("flushing temp download file {}", temp_path.display()))?;
            Ok(())
        }
        .await;

        if let Err(err) = streamed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        promote(&temp_path, &absolute_path).await?;
        Ok(absolute_path)
    }

    /// Cache-relative paths under `subdir` whose subdir-relative path matches `pattern`.
    ///
    /// `*` does not cross directory separators; use `**` to descend.
    pub fn list(&self, subdir: impl AsRef<Path>, pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
        let base = self.root.join(subdir);
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern {pattern:?}"))?
            .compile_matcher();
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", base.display()))?;
            let relative = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            if is_partial_write(relative) || !matcher.is_match(relative) {
                continue;
            }
            let cache_relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            out.push(cache_relative.to_path_buf());
        }
        Ok(out)
    }

    /// Full overwrite through a temp file and rename, so readers never see a partial file.
    async fn write_atomic(&self, name: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let absolute_path = self.path_for(name);
        let parent = ensure_parent(&absolute_path).await?;
        debug!(path = %absolute_path.display(), bytes = bytes.len(), "writing to cache");

        let temp_path = parent.join(temp_file_name());
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp cache file {}", temp_path.display()));
        }

        promote(&temp_path, &absolute_path).await?;
        Ok(absolute_path)
    }
}

const TEMP_SUFFIX: &str = ".partial";

fn temp_file_name() -> String {
    format!(".{}{TEMP_SUFFIX}", Uuid::new_v4())
}

fn is_partial_write(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
}

async fn ensure_parent(path: &Path) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("cache path {} has no parent directory", path.display()))?
        .to_path_buf();
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating cache directory {}", parent.display()))?;
    Ok(parent)
}

async fn promote(temp_path: &Path, final_path: &Path) -> anyhow::Result<()> {
    if let Err(err) = fs::rename(temp_path, final_path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                final_path.display()
            )
        });
    }
    Ok(())
}

/// Whether a failed request is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Portal hiccups (5xx) and rate limiting (429) are transient. Any other status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        status if status.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Timeouts and connection failures are transient. Body and redirect errors are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay * 2^attempt_index`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or `policy` runs out.
///
/// The closure receives the zero-based attempt index.
pub async fn retry_with_backoff<T, F, Fut>(policy: &BackoffPolicy, mut attempt: F) -> Result<T, FetchError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt_index = 0;
    loop {
        match attempt(attempt_index).await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt_index < policy.max_retries =>
            {
                let delay = policy.delay_for_attempt(attempt_index);
                warn!(attempt = attempt_index + 1, ?delay, error = %err, "transient fetch failure, retrying");
                tokio::time::sleep(delay).await;
                attempt_index += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-call request extras. Built fresh for every request and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// URL after redirects.
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Source of JSON documents addressed by URL.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, url: &str, options: &RequestOptions) -> Result<JsonValue, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures, and hand back a response with a 2xx status.
    pub async fn send(&self, url: &str, options: &RequestOptions) -> Result<reqwest::Response, FetchError> {
        let span = info_span!("http_fetch", url);
        retry_with_backoff(&self.backoff, move |attempt| self.send_once(url, options, attempt))
            .instrument(span)
            .await
    }

    pub async fn fetch_bytes(&self, url: &str, options: &RequestOptions) -> Result<FetchedResponse, FetchError> {
        let resp = self.send(url, options).await?;
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse { final_url, body })
    }

    async fn send_once(
        &self,
        url: &str,
        options: &RequestOptions,
        attempt: usize,
    ) -> Result<reqwest::Response, FetchError> {
        debug!(attempt, "requesting");
        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }

        let resp = request.send().await?;
        let status = resp.status();
        debug!(status = status.as_u16(), "response");
        if status.is_success() {
            Ok(resp)
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            })
        }
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn get_json(&self, url: &str, options: &RequestOptions) -> Result<JsonValue, FetchError> {
        let fetched = self.fetch_bytes(url, options).await?;
        serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Decode {
            url: fetched.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn instant_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Answer one connection per canned response, in order, and hand back the raw request heads.
    async fn canned_server(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.expect("accept");
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.expect("read request");
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                heads.push(String::from_utf8_lossy(&head).into_owned());
                socket.write_all(response.as_bytes()).await.expect("write response");
                let _ = socket.shutdown().await;
            }
            heads
        });
        (base, handle)
    }

    fn local_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("clean-test-agent".into()),
            backoff: instant_policy(max_retries),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn json_write_is_full_overwrite() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        let name = "ca_bart/subpages/ABC.json";

        cache
            .write_json(name, &json!({"documents": [1, 2, 3, 4, 5, 6, 7, 8]}))
            .await
            .expect("first write");
        let written = cache
            .write_json(name, &json!({"documents": []}))
            .await
            .expect("second write");

        assert_eq!(written, dir.path().join(name));
        let back: JsonValue = cache.read_json(name).await.expect("read back");
        assert_eq!(back, json!({"documents": []}));
    }

    #[tokio::test]
    async fn text_and_binary_writes_create_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());

        cache.write_text("a/b/c.html", "<h1>hi</h1>").await.expect("text");
        cache.write_binary("x/y.bin", &[0, 159, 146, 150]).await.expect("binary");

        assert_eq!(cache.read_text("a/b/c.html").await.unwrap(), "<h1>hi</h1>");
        assert_eq!(std::fs::read(dir.path().join("x/y.bin")).unwrap(), vec![0, 159, 146, 150]);
    }

    #[tokio::test]
    async fn exists_only_reports_regular_files() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        std::fs::create_dir_all(dir.path().join("agency/subpages")).unwrap();

        assert!(!cache.exists("agency/subpages").await);
        assert!(!cache.exists("agency/subpages/missing.json").await);
        cache.write_text("agency/subpages/here.json", "{}").await.unwrap();
        assert!(cache.exists("agency/subpages/here.json").await);
    }

    #[tokio::test]
    async fn download_returns_cached_path_without_network() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        cache.write_binary("agency/video.mp4", b"cached").await.unwrap();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(50),
            backoff: instant_policy(0),
            ..Default::default()
        })
        .unwrap();

        let path = cache
            .download(
                &http,
                "agency/video.mp4",
                "http://127.0.0.1:9/never-requested",
                false,
                &RequestOptions::default(),
            )
            .await
            .expect("cache hit");

        assert_eq!(path, dir.path().join("agency/video.mp4"));
        assert_eq!(std::fs::read(path).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn forced_download_failure_keeps_previous_file() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        cache.write_binary("agency/doc.pdf", b"old").await.unwrap();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            backoff: instant_policy(0),
            ..Default::default()
        })
        .unwrap();

        let result = cache
            .download(&http, "agency/doc.pdf", "http://127.0.0.1:9/doc.pdf", true, &RequestOptions::default())
            .await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(dir.path().join("agency/doc.pdf")).unwrap(), b"old");
        assert_eq!(cache.list("agency", "*").unwrap(), vec![PathBuf::from("agency/doc.pdf")]);
    }

    #[tokio::test]
    async fn list_matches_pattern_within_subdir() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        cache.write_text("ca_bart/subpages/B.json", "{}").await.unwrap();
        cache.write_text("ca_bart/subpages/A.json", "{}").await.unwrap();
        cache.write_text("ca_bart/subpages/index.html", "").await.unwrap();
        cache.write_text("ca_bart/subpages/nested/C.json", "{}").await.unwrap();
        std::fs::write(dir.path().join("ca_bart/subpages/.abc.partial"), "").unwrap();

        let top = cache.list("ca_bart/subpages", "*.json").unwrap();
        assert_eq!(
            top,
            vec![
                PathBuf::from("ca_bart/subpages/A.json"),
                PathBuf::from("ca_bart/subpages/B.json"),
            ]
        );

        let deep = cache.list("ca_bart/subpages", "**/*.json").unwrap();
        assert_eq!(deep.len(), 3);
        assert!(cache.list("ca_nowhere", "*").unwrap().is_empty());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), FetchError> = retry_with_backoff(&instant_policy(2), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::HttpStatus {
                status: 503,
                url: "https://portal.test/x".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_client_errors() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), FetchError> = retry_with_backoff(&instant_policy(4), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::HttpStatus {
                status: 404,
                url: "https://portal.test/x".into(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let value = retry_with_backoff(&instant_policy(3), |attempt| async move {
            if attempt < 2 {
                Err(FetchError::HttpStatus {
                    status: 502,
                    url: "https://portal.test/x".into(),
                })
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn download_streams_body_and_sends_request_options() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        let (base, server) = canned_server(vec![http_response("200 OK", "scan bytes")]).await;
        let options = RequestOptions::default()
            .with_header("Authorization", "Token abc123")
            .with_query("format", "pdf");

        let path = cache
            .download(&local_fetcher(0), "agency/scan.pdf", &format!("{base}/files/scan"), false, &options)
            .await
            .expect("download");

        assert_eq!(path, dir.path().join("agency/scan.pdf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"scan bytes");
        assert_eq!(cache.list("agency", "*").unwrap(), vec![PathBuf::from("agency/scan.pdf")]);

        let heads = server.await.unwrap();
        assert_eq!(heads.len(), 1);
        assert!(heads[0].starts_with("GET /files/scan?format=pdf HTTP/1.1\r\n"), "{}", heads[0]);
        let head = heads[0].to_ascii_lowercase();
        assert!(head.contains("authorization: token abc123"), "{head}");
        assert!(head.contains("user-agent: clean-test-agent"), "{head}");
    }

    #[tokio::test]
    async fn send_retries_server_errors_transparently() {
        let (base, server) = canned_server(vec![
            http_response("503 Service Unavailable", "busy"),
            http_response("200 OK", r#"{"total_count": 0, "documents": []}"#),
        ])
        .await;
        let http = local_fetcher(2);

        let value = http
            .get_json(&format!("{base}/client/documents"), &RequestOptions::default())
            .await
            .expect("second attempt succeeds");

        assert_eq!(value, json!({"total_count": 0, "documents": []}));
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_error_download_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        let (base, server) = canned_server(vec![http_response("404 Not Found", "gone")]).await;

        let err = cache
            .download(
                &local_fetcher(3),
                "agency/missing.pdf",
                &format!("{base}/missing.pdf"),
                false,
                &RequestOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FetchError>(),
            Some(FetchError::HttpStatus { status: 404, .. })
        ));
        assert!(!cache.exists("agency/missing.pdf").await);
        assert!(cache.list("agency", "**").unwrap().is_empty());
        assert_eq!(server.await.unwrap().len(), 1, "404 is not retried");
    }
}
