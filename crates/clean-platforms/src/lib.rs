//! Records-portal variants: URL fingerprinting and normalization of portal JSON.

use std::collections::BTreeMap;
use std::path::Path;

use clean_core::{
    json_at, DocumentEntry, FetchProfile, FieldMapping, MetadataRecord, Paging, PortalVariant,
    DECLARED_TOTAL_FIELD, SOURCE_PAGE_URL_FIELD,
};
use clean_storage::{Cache, FetchError, RequestOptions};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const BASE_PLACEHOLDER: &str = "{base}";
const FOLDER_PLACEHOLDER: &str = "{folder}";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("unrecognized portal shape: {url}")]
    UnrecognizedPortalShape { url: String },
    #[error(transparent)]
    Network(FetchError),
    #[error("malformed response from {url}: {detail}")]
    MalformedResponse { url: String, detail: String },
    #[error("folder {folder_id} declares {declared} records, above the ceiling of {ceiling}")]
    RecordCeilingExceeded {
        folder_id: String,
        declared: u64,
        ceiling: u64,
    },
    #[error("folder {folder_id} spans {total_pages} pages, above the ceiling of {ceiling}")]
    PageCeilingExceeded {
        folder_id: String,
        total_pages: u64,
        ceiling: u32,
    },
    #[error(transparent)]
    Cache(#[from] anyhow::Error),
}

impl From<FetchError> for PortalError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Decode { url, source } => Self::MalformedResponse {
                url,
                detail: source.to_string(),
            },
            other => Self::Network(other),
        }
    }
}

/// Constants describing one portal variant.
#[derive(Debug)]
pub struct VariantRules {
    pub variant: PortalVariant,
    pub paging: Paging,
    pub documents_field: &'static str,
    pub group_field: Option<&'static str>,
    pub asset_path: &'static [&'static str],
    pub title_path: &'static [&'static str],
    pub subfolder_path: Option<&'static [&'static str]>,
    pub case_path: Option<&'static [&'static str]>,
    pub field_map: &'static [FieldMapping],
    pub auth_scheme: Option<&'static str>,
    /// Listing URL with `{base}` and `{folder}` placeholders, plus `{page}` for numbered paging.
    pub listing_template: &'static str,
}

impl VariantRules {
    pub fn profile(&self, base_url: &str, folder_id: &str) -> FetchProfile {
        let encoded_folder: String = url::form_urlencoded::byte_serialize(folder_id.as_bytes()).collect();
        let listing_url_template = self
            .listing_template
            .replace(BASE_PLACEHOLDER, base_url)
            .replace(FOLDER_PLACEHOLDER, &encoded_folder);
        FetchProfile {
            variant: self.variant,
            base_url: base_url.to_string(),
            folder_id: folder_id.to_string(),
            paging: self.paging,
            documents_field: self.documents_field,
            group_field: self.group_field,
            asset_path: self.asset_path,
            title_path: self.title_path,
            subfolder_path: self.subfolder_path,
            case_path: self.case_path,
            field_map: self.field_map,
            auth_scheme: self.auth_scheme,
            listing_url_template,
        }
    }
}

const FOLDER_DOCUMENTS_FIELDS: &[FieldMapping] = &[
    FieldMapping::new("created_at", &["created_at"]),
    FieldMapping::new("description", &["description"]),
    FieldMapping::new("redacted_at", &["redacted_at"]),
    FieldMapping::new("doc_date", &["doc_date"]),
    FieldMapping::new("highlights", &["highlights"]),
];

const REQUEST_DOCUMENTS_FIELDS: &[FieldMapping] = &[
    FieldMapping::new("description", &["description"]),
    FieldMapping::new("upload_date", &["upload_date"]),
    FieldMapping::new("folder_name", &["folder_name"]),
    FieldMapping::new("scan_id", &["document_scan", "id"]),
    FieldMapping::new("file_extension", &["document_scan", "file_extension"]),
];

const FOIA_REQUEST_FIELDS: &[FieldMapping] = &[
    FieldMapping::root("page_title", &["title"]),
    FieldMapping::root("user_id", &["user"]),
    FieldMapping::root("username", &["username"]),
    FieldMapping::root("agency_id", &["agency"]),
    FieldMapping::root("absolute_url", &["absolute_url"]),
    FieldMapping::root("datetime_submitted", &["datetime_submitted"]),
    FieldMapping::root("date_due", &["date_due"]),
    FieldMapping::root("date_followup", &["date_followup"]),
    FieldMapping::root("datetime_done", &["datetime_done"]),
    FieldMapping::root("datetime_updated", &["datetime_updated"]),
    FieldMapping::group("subject", &["subject"]),
    FieldMapping::group("datetime", &["datetime"]),
    FieldMapping::group("communication", &["communication"]),
    FieldMapping::new("doc_id", &["doc_id"]),
    FieldMapping::new("pages", &["pages"]),
    FieldMapping::new("source", &["source"]),
    FieldMapping::new("description", &["description"]),
];

pub static FOLDER_DOCUMENTS: VariantRules = VariantRules {
    variant: PortalVariant::FolderDocuments,
    paging: Paging::Numbered {
        page_size: 50,
        tally_field: "total_count",
        record_ceiling: 10_000,
    },
    documents_field: "documents",
    group_field: None,
    asset_path: &["document_path"],
    title_path: &["title"],
    subfolder_path: None,
    case_path: None,
    field_map: FOLDER_DOCUMENTS_FIELDS,
    auth_scheme: None,
    listing_template: "{base}/client/documents?sort_field=count&sort_order=desc&page_size=50&folder_filter={folder}&page_number={page}",
};

pub static REQUEST_DOCUMENTS: VariantRules = VariantRules {
    variant: PortalVariant::RequestDocuments,
    paging: Paging::Numbered {
        page_size: 25,
        tally_field: "total_documents_count",
        record_ceiling: 10_000,
    },
    documents_field: "documents",
    group_field: None,
    asset_path: &["document_scan", "document_path"],
    title_path: &["title"],
    subfolder_path: Some(&["folder_name"]),
    case_path: None,
    field_map: REQUEST_DOCUMENTS_FIELDS,
    auth_scheme: None,
    listing_template: "{base}/client/request_documents?request_id={folder}&page_number={page}",
};

pub static FOIA_REQUEST: VariantRules = VariantRules {
    variant: PortalVariant::FoiaRequest,
    paging: Paging::Single,
    documents_field: "files",
    group_field: Some("communications"),
    asset_path: &["ffile"],
    title_path: &["title"],
    subfolder_path: None,
    case_path: Some(&["title"]),
    field_map: FOIA_REQUEST_FIELDS,
    auth_scheme: Some("Token"),
    listing_template: "{base}/api_v1/foia/{folder}",
};

/// A URL shape and the variant it identifies. Returns the folder id on a match.
struct PortalShape {
    rules: &'static VariantRules,
    folder_id: fn(&Url) -> Option<String>,
}

static PORTAL_SHAPES: &[PortalShape] = &[
    PortalShape {
        rules: &FOLDER_DOCUMENTS,
        folder_id: folder_filter_param,
    },
    PortalShape {
        rules: &REQUEST_DOCUMENTS,
        folder_id: request_path_id,
    },
    PortalShape {
        rules: &FOIA_REQUEST,
        folder_id: foia_slug_id,
    },
];

fn folder_filter_param(url: &Url) -> Option<String> {
    if url.path() != "/documents" {
        return None;
    }
    url.query_pairs()
        .find(|(key, _)| key == "folder_filter")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn request_path_id(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.collect();
    match segments.as_slice() {
        ["requests", id] if !id.is_empty() => Some((*id).to_string()),
        _ => None,
    }
}

/// `/foi/{agency}/{slug}-{id}/`: the request id is the numeric tail of the slug.
fn foia_slug_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    if segments.next()? != "foi" || segments.next()?.is_empty() {
        return None;
    }
    let slug = segments.next()?;
    if segments.any(|rest| !rest.is_empty()) {
        return None;
    }
    let id = slug.rsplit('-').next()?;
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.to_string())
}

/// Folder ids become cache file names, so they must stay a single path component.
fn is_single_component(folder_id: &str) -> bool {
    !matches!(folder_id, "." | "..") && !folder_id.contains(['/', '\\', '\0'])
}

pub fn variant_rules(variant: PortalVariant) -> &'static VariantRules {
    match variant {
        PortalVariant::FolderDocuments => &FOLDER_DOCUMENTS,
        PortalVariant::RequestDocuments => &REQUEST_DOCUMENTS,
        PortalVariant::FoiaRequest => &FOIA_REQUEST,
    }
}

/// Classify a portal URL from its path and query alone. No network access.
pub fn fingerprint(portal_url: &str) -> Result<FetchProfile, PortalError> {
    let unrecognized = || PortalError::UnrecognizedPortalShape {
        url: portal_url.to_string(),
    };
    let url = Url::parse(portal_url.trim()).map_err(|_| unrecognized())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(unrecognized());
    }
    let base_url = url.origin().ascii_serialization();

    for shape in PORTAL_SHAPES {
        if let Some(folder_id) = (shape.folder_id)(&url) {
            if !is_single_component(&folder_id) {
                warn!(url = portal_url, %folder_id, "folder id is not a plain name, refusing");
                return Err(unrecognized());
            }
            debug!(
                url = portal_url,
                variant = shape.rules.variant.as_str(),
                %folder_id,
                "fingerprinted portal"
            );
            return Ok(shape.rules.profile(&base_url, &folder_id));
        }
    }
    Err(unrecognized())
}

/// Request extras for one profile. The API token is only sent to portals that take one.
pub fn request_options(profile: &FetchProfile, api_token: Option<&str>) -> RequestOptions {
    let token = api_token.map(str::trim).filter(|token| !token.is_empty());
    match (profile.auth_scheme, token) {
        (Some(scheme), Some(token)) => {
            RequestOptions::default().with_header("Authorization", format!("{scheme} {token}"))
        }
        _ => RequestOptions::default(),
    }
}

/// Make an asset reference absolute: relative paths get `base_url`, protocol-relative ones `https:`.
pub fn resolve_asset_url(base_url: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if Url::parse(raw).is_ok_and(|u| u.host_str().is_some()) {
        return Some(raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    let base = base_url.trim_end_matches('/');
    let with_base = if raw.starts_with('/') {
        format!("{base}{raw}")
    } else {
        format!("{base}/{raw}")
    };
    Url::parse(&with_base)
        .is_ok_and(|u| u.host_str().is_some())
        .then_some(with_base)
}

fn non_empty_str<'a>(value: Option<&'a JsonValue>) -> Option<&'a str> {
    value
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn last_path_segment(asset_url: &str) -> String {
    Url::parse(asset_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(ToString::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| asset_url.to_string())
}

/// Every document entry of a stored response, in order. `None` when the documents array
/// (or the group array holding them) has the wrong shape.
pub fn document_entries<'a>(profile: &FetchProfile, raw: &'a JsonValue) -> Option<Vec<DocumentEntry<'a>>> {
    let Some(group_field) = profile.group_field else {
        let documents = raw.get(profile.documents_field)?.as_array()?;
        return Some(documents.iter().map(|entry| DocumentEntry::flat(raw, entry)).collect());
    };

    raw.as_object()?;
    let groups = match raw.get(group_field) {
        None | Some(JsonValue::Null) => return Some(Vec::new()),
        Some(groups) => groups.as_array()?,
    };
    let mut entries = Vec::new();
    for (group_index, group) in groups.iter().enumerate() {
        match group.get(profile.documents_field).and_then(JsonValue::as_array) {
            Some(documents) => entries.extend(documents.iter().map(|entry| DocumentEntry {
                root: raw,
                group: Some(group),
                entry,
            })),
            None => warn!(
                folder_id = %profile.folder_id,
                group_index,
                field = profile.documents_field,
                "group has no document array, skipping"
            ),
        }
    }
    Some(entries)
}

fn normalize_entry(
    profile: &FetchProfile,
    doc: &DocumentEntry<'_>,
    index: usize,
    parent_page: &str,
) -> Option<MetadataRecord> {
    let entry = doc.entry;
    let Some(raw_asset) = non_empty_str(json_at(entry, profile.asset_path)) else {
        warn!(
            folder_id = %profile.folder_id,
            index,
            path = %profile.asset_path.join("."),
            "document entry has no asset path, skipping"
        );
        return None;
    };
    let Some(asset_url) = resolve_asset_url(&profile.base_url, raw_asset) else {
        warn!(folder_id = %profile.folder_id, index, raw_asset, "unusable asset path, skipping");
        return None;
    };

    let title = match non_empty_str(json_at(entry, profile.title_path)) {
        Some(title) => title.to_string(),
        None => {
            warn!(
                folder_id = %profile.folder_id,
                index,
                field = "title",
                source = %profile.title_path.join("."),
                "field missing from document entry"
            );
            last_path_segment(&asset_url)
        }
    };

    let mut details = BTreeMap::new();
    for mapping in profile.field_map {
        match mapping.lookup(doc) {
            Some(value) => {
                details.insert(mapping.output.to_string(), value.clone());
            }
            None => warn!(
                folder_id = %profile.folder_id,
                index,
                field = mapping.output,
                source = %mapping.source_display(),
                "field missing from document entry"
            ),
        }
    }
    for key in [SOURCE_PAGE_URL_FIELD, DECLARED_TOTAL_FIELD] {
        if let Some(value) = entry.get(key) {
            details.insert(key.to_string(), value.clone());
        }
    }

    let case = profile
        .case_path
        .and_then(|path| non_empty_str(json_at(doc.root, path)))
        .unwrap_or(profile.folder_id.as_str());
    let case_id = match profile
        .subfolder_path
        .and_then(|path| non_empty_str(json_at(entry, path)))
    {
        Some(subfolder) => format!("{case}/{subfolder}"),
        None => case.to_string(),
    };

    Some(MetadataRecord {
        asset_url,
        name: title.clone(),
        title,
        case_id,
        parent_page: parent_page.to_string(),
        details,
    })
}

/// Turn one stored document set into records, in document order.
pub fn normalize_documents(
    profile: &FetchProfile,
    raw: &JsonValue,
    parent_page: &str,
) -> Result<Vec<MetadataRecord>, PortalError> {
    let entries = document_entries(profile, raw).ok_or_else(|| PortalError::MalformedResponse {
        url: parent_page.to_string(),
        detail: format!(
            "missing `{}` array",
            profile.group_field.unwrap_or(profile.documents_field)
        ),
    })?;

    Ok(entries
        .iter()
        .enumerate()
        .filter_map(|(index, doc)| normalize_entry(profile, doc, index, parent_page))
        .collect())
}

/// Read a cached document set back through the cache and normalize it.
pub async fn normalize_cached(
    cache: &Cache,
    profile: &FetchProfile,
    relative_path: &Path,
) -> Result<Vec<MetadataRecord>, PortalError> {
    let raw: JsonValue = cache.read_json(relative_path).await?;
    let parent_page = relative_path.to_string_lossy().replace('\\', "/");
    normalize_documents(profile, &raw, &parent_page)
}
