//! Folder harvesting: paginated portal retrieval into the cache, then normalization.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clean_core::{FetchProfile, MetadataRecord, Paging, DECLARED_TOTAL_FIELD, SOURCE_PAGE_URL_FIELD};
use clean_platforms::{document_entries, fingerprint, normalize_cached, request_options, PortalError};
use clean_storage::{BackoffPolicy, Cache, HttpClientConfig, HttpFetcher, JsonSource, RequestOptions};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub output_root: PathBuf,
    pub cache_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub throttle_secs: u64,
    pub page_ceiling: u32,
    pub retry_attempts: usize,
    pub retry_delay_secs: u64,
    /// Token for portals that authenticate API calls.
    pub api_token: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn default_output_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clean-scraper")
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let output_root = std::env::var("CLEAN_ETL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_output_root());
        Self {
            cache_dir: output_root.join("cache"),
            exports_dir: output_root.join("exports"),
            output_root,
            user_agent: std::env::var("CLEAN_USER_AGENT")
                .unwrap_or_else(|_| "Big Local News (biglocalnews.org)".to_string()),
            http_timeout_secs: env_or("CLEAN_HTTP_TIMEOUT_SECS", 30),
            throttle_secs: env_or("CLEAN_THROTTLE_SECS", 2),
            page_ceiling: env_or("CLEAN_PAGE_CEILING", 200),
            retry_attempts: env_or("CLEAN_RETRY_ATTEMPTS", 3),
            retry_delay_secs: env_or("CLEAN_RETRY_DELAY_SECS", 15),
            api_token: std::env::var("CLEAN_API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let base_delay = Duration::from_secs(self.retry_delay_secs);
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.retry_attempts.saturating_sub(1),
                base_delay,
                max_delay: base_delay.saturating_mul(4),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub force: bool,
    pub throttle: Duration,
    pub page_ceiling: u32,
    /// Sent with every request for the folder.
    pub options: RequestOptions,
}

/// Soft conditions found while paging. The merged data is still returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FetchWarning {
    CountMismatch { declared: u64, merged: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderFetch {
    /// Already cached; nothing was requested.
    Cached { path: PathBuf },
    Fetched {
        path: PathBuf,
        /// Tally from page 1 of a numbered listing. Single documents declare nothing.
        declared_total: Option<u64>,
        documents: usize,
        pages: u64,
        warnings: Vec<FetchWarning>,
    },
}

impl FolderFetch {
    /// Cache-relative path of the merged JSON.
    pub fn path(&self) -> &Path {
        match self {
            Self::Cached { path } | Self::Fetched { path, .. } => path,
        }
    }

    pub fn touched_network(&self) -> bool {
        matches!(self, Self::Fetched { .. })
    }
}

fn take_documents(
    page: &mut JsonValue,
    profile: &FetchProfile,
    page_url: &str,
) -> Result<Vec<JsonValue>, PortalError> {
    match page.get_mut(profile.documents_field).map(JsonValue::take) {
        Some(JsonValue::Array(documents)) => Ok(documents),
        _ => Err(PortalError::MalformedResponse {
            url: page_url.to_string(),
            detail: format!("missing `{}` array", profile.documents_field),
        }),
    }
}

fn tag_provenance(documents: &mut [JsonValue], page_url: &str, declared_total: u64) {
    for document in documents {
        if let Some(entry) = document.as_object_mut() {
            entry.insert(SOURCE_PAGE_URL_FIELD.to_string(), JsonValue::from(page_url));
            entry.insert(DECLARED_TOTAL_FIELD.to_string(), JsonValue::from(declared_total));
        }
    }
}

/// Retrieve one portal folder and persist its document set at `target`.
///
/// Any failed page aborts the folder without writing, so `target` only ever holds a
/// complete merge.
pub async fn fetch_folder(
    cache: &Cache,
    source: &dyn JsonSource,
    profile: &FetchProfile,
    target: &Path,
    settings: &FetchSettings,
) -> Result<FolderFetch, PortalError> {
    if !settings.force && cache.exists(target).await {
        debug!(path = %target.display(), "folder found in cache");
        return Ok(FolderFetch::Cached {
            path: target.to_path_buf(),
        });
    }

    info!(
        folder_id = %profile.folder_id,
        variant = profile.variant.as_str(),
        "fetching portal folder"
    );
    match profile.paging {
        Paging::Numbered {
            tally_field,
            record_ceiling,
            ..
        } => fetch_pages(cache, source, profile, target, settings, tally_field, record_ceiling).await,
        Paging::Single => fetch_single(cache, source, profile, target, settings).await,
    }
}

async fn fetch_pages(
    cache: &Cache,
    source: &dyn JsonSource,
    profile: &FetchProfile,
    target: &Path,
    settings: &FetchSettings,
    tally_field: &str,
    record_ceiling: u64,
) -> Result<FolderFetch, PortalError> {
    let first_url = profile.listing_url(1);
    let mut merged = source.get_json(&first_url, &settings.options).await?;
    let declared_total = merged
        .get(tally_field)
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| PortalError::MalformedResponse {
            url: first_url.clone(),
            detail: format!("missing numeric `{tally_field}`"),
        })?;

    if declared_total > record_ceiling {
        warn!(
            folder_id = %profile.folder_id,
            declared_total,
            ceiling = record_ceiling,
            "declared record count above ceiling, abandoning folder"
        );
        return Err(PortalError::RecordCeilingExceeded {
            folder_id: profile.folder_id.clone(),
            declared: declared_total,
            ceiling: record_ceiling,
        });
    }

    let total_pages = profile.total_pages(declared_total);
    let page_ceiling = settings.page_ceiling.max(1);
    if total_pages > u64::from(page_ceiling) {
        warn!(
            folder_id = %profile.folder_id,
            total_pages,
            page_ceiling,
            "page count above ceiling, abandoning folder"
        );
        return Err(PortalError::PageCeilingExceeded {
            folder_id: profile.folder_id.clone(),
            total_pages,
            ceiling: page_ceiling,
        });
    }
    let last_page = u32::try_from(total_pages).unwrap_or(page_ceiling);

    let mut documents = take_documents(&mut merged, profile, &first_url)?;
    tag_provenance(&mut documents, &first_url, declared_total);
    if last_page > 1 {
        debug!(remaining = last_page - 1, "fetching additional pages");
    }

    let mut pages = 1;
    for page_number in 2..=last_page {
        tokio::time::sleep(settings.throttle).await;
        let page_url = profile.listing_url(page_number);
        let mut page = source.get_json(&page_url, &settings.options).await?;
        let mut page_documents = take_documents(&mut page, profile, &page_url)?;
        tag_provenance(&mut page_documents, &page_url, declared_total);
        documents.append(&mut page_documents);
        pages += 1;
    }

    let mut warnings = Vec::new();
    let merged_count = documents.len();
    if merged_count as u64 != declared_total {
        warn!(
            folder_id = %profile.folder_id,
            declared_total,
            merged = merged_count,
            "merged document count differs from declared total"
        );
        warnings.push(FetchWarning::CountMismatch {
            declared: declared_total,
            merged: merged_count,
        });
    }

    if let Some(object) = merged.as_object_mut() {
        object.insert(profile.documents_field.to_string(), JsonValue::Array(documents));
    }
    cache.write_json(target, &merged).await?;
    info!(
        folder_id = %profile.folder_id,
        pages,
        documents = merged_count,
        path = %target.display(),
        "cached portal folder"
    );

    Ok(FolderFetch::Fetched {
        path: target.to_path_buf(),
        declared_total: Some(declared_total),
        documents: merged_count,
        pages,
        warnings,
    })
}

/// One request returns the whole folder; it is stored as received.
async fn fetch_single(
    cache: &Cache,
    source: &dyn JsonSource,
    profile: &FetchProfile,
    target: &Path,
    settings: &FetchSettings,
) -> Result<FolderFetch, PortalError> {
    let url = profile.listing_url(1);
    let document = source.get_json(&url, &settings.options).await?;
    let documents = document_entries(profile, &document)
        .ok_or_else(|| PortalError::MalformedResponse {
            url: url.clone(),
            detail: "expected an object with document groups".to_string(),
        })?
        .len();

    cache.write_json(target, &document).await?;
    info!(
        folder_id = %profile.folder_id,
        documents,
        path = %target.display(),
        "cached portal document"
    );

    Ok(FolderFetch::Fetched {
        path: target.to_path_buf(),
        declared_total: None,
        documents,
        pages: 1,
        warnings: Vec::new(),
    })
}

/// Folder ids already fetched into `subdir`, from the `{folder_id}.json` naming convention.
pub fn cached_folder_ids(cache: &Cache, subdir: impl AsRef<Path>) -> Result<Vec<String>> {
    Ok(cache
        .list(subdir, "*.json")?
        .iter()
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(ToString::to_string))
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub folders: usize,
    pub fetched: usize,
    pub cached: usize,
    pub failed: usize,
    pub records: Vec<MetadataRecord>,
}

/// Entry point for agency scrapers: portal URL in, metadata records out.
pub struct Harvester {
    cache: Cache,
    source: Arc<dyn JsonSource>,
    page_ceiling: u32,
    api_token: Option<String>,
}

impl Harvester {
    pub fn new(cache: Cache, source: Arc<dyn JsonSource>, page_ceiling: u32) -> Self {
        Self {
            cache,
            source,
            page_ceiling,
            api_token: None,
        }
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let harvester = Self::new(
            Cache::new(config.cache_dir.clone()),
            Arc::new(http),
            config.page_ceiling,
        );
        Ok(match &config.api_token {
            Some(token) => harvester.with_api_token(token.clone()),
            None => harvester,
        })
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Fetch (or reuse) one folder and normalize it.
    ///
    /// Failures are logged and produce an empty list; one bad folder never stops a batch.
    pub async fn harvest_folder(
        &self,
        subdir: impl AsRef<Path>,
        portal_url: &str,
        force: bool,
        throttle: Duration,
    ) -> Vec<MetadataRecord> {
        match self.try_harvest(subdir.as_ref(), portal_url, force, throttle).await {
            Ok((_, records)) => records,
            Err(err) => {
                log_failure(portal_url, &err);
                Vec::new()
            }
        }
    }

    /// Harvest several folders in order, sleeping `throttle` after any folder that hit the network.
    pub async fn harvest_folders<S: AsRef<str>>(
        &self,
        subdir: impl AsRef<Path>,
        portal_urls: &[S],
        force: bool,
        throttle: Duration,
    ) -> HarvestSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let subdir = subdir.as_ref();
        let mut summary = HarvestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            folders: portal_urls.len(),
            fetched: 0,
            cached: 0,
            failed: 0,
            records: Vec::new(),
        };

        let mut pending_throttle = false;
        for portal_url in portal_urls {
            let portal_url = portal_url.as_ref();
            if pending_throttle {
                tokio::time::sleep(throttle).await;
            }
            match self.try_harvest(subdir, portal_url, force, throttle).await {
                Ok((fetch, records)) => {
                    pending_throttle = fetch.touched_network();
                    if fetch.touched_network() {
                        summary.fetched += 1;
                    } else {
                        summary.cached += 1;
                    }
                    summary.records.extend(records);
                }
                Err(err) => {
                    pending_throttle = !matches!(err, PortalError::UnrecognizedPortalShape { .. });
                    log_failure(portal_url, &err);
                    summary.failed += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            folders = summary.folders,
            fetched = summary.fetched,
            cached = summary.cached,
            failed = summary.failed,
            records = summary.records.len(),
            "harvest complete"
        );
        summary
    }

    async fn try_harvest(
        &self,
        subdir: &Path,
        portal_url: &str,
        force: bool,
        throttle: Duration,
    ) -> Result<(FolderFetch, Vec<MetadataRecord>), PortalError> {
        let profile = fingerprint(portal_url)?;
        let target = subdir.join(profile.cache_file_name());
        let settings = FetchSettings {
            force,
            throttle,
            page_ceiling: self.page_ceiling,
            options: request_options(&profile, self.api_token.as_deref()),
        };
        let fetch = fetch_folder(&self.cache, self.source.as_ref(), &profile, &target, &settings).await?;
        let records = normalize_cached(&self.cache, &profile, fetch.path()).await?;
        Ok((fetch, records))
    }
}

fn log_failure(portal_url: &str, err: &PortalError) {
    match err {
        PortalError::RecordCeilingExceeded { .. } | PortalError::PageCeilingExceeded { .. } => {
            warn!(url = portal_url, error = %err, "folder skipped")
        }
        _ => error!(url = portal_url, error = %err, "folder failed"),
    }
}
