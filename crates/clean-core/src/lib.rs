//! Core domain model for the records-portal integration engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Placeholder substituted with the page number in a listing URL template.
pub const PAGE_PLACEHOLDER: &str = "{page}";

/// Provenance key injected into every merged document entry: the listing page it came from.
pub const SOURCE_PAGE_URL_FIELD: &str = "source_page_url";

/// Provenance key injected into every merged document entry: the portal's declared total.
pub const DECLARED_TOTAL_FIELD: &str = "declared_total_count";

/// Known third-party portal shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalVariant {
    /// `/documents?folder_filter=...` listings with flat document entries.
    FolderDocuments,
    /// `/requests/{id}` listings whose entries nest the file under `document_scan`.
    RequestDocuments,
    /// `/foi/{agency}/{slug}-{id}/` request pages backed by a single API document that
    /// bundles files per communication.
    FoiaRequest,
}

impl PortalVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FolderDocuments => "folder_documents",
            Self::RequestDocuments => "request_documents",
            Self::FoiaRequest => "foia_request",
        }
    }
}

/// How a folder's documents are retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Paging {
    /// Numbered listing pages. Page 1 declares the folder total in `tally_field`.
    Numbered {
        page_size: u32,
        tally_field: &'static str,
        record_ceiling: u64,
    },
    /// The whole folder arrives in one response.
    Single,
}

/// Which object a mapped field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    Entry,
    /// The object an entry is nested in, e.g. one communication of a request.
    Group,
    /// The top-level response object.
    Root,
}

/// One document entry together with the objects it is nested in.
#[derive(Debug, Clone, Copy)]
pub struct DocumentEntry<'a> {
    pub root: &'a JsonValue,
    pub group: Option<&'a JsonValue>,
    pub entry: &'a JsonValue,
}

impl<'a> DocumentEntry<'a> {
    /// An entry from a flat documents array.
    pub fn flat(root: &'a JsonValue, entry: &'a JsonValue) -> Self {
        Self {
            root,
            group: None,
            entry,
        }
    }
}

/// One output field and the JSON path it is read from.
///
/// Paths have one segment for top-level fields and two for a field of a nested object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldMapping {
    pub output: &'static str,
    pub scope: FieldScope,
    pub source: &'static [&'static str],
}

impl FieldMapping {
    pub const fn new(output: &'static str, source: &'static [&'static str]) -> Self {
        Self {
            output,
            scope: FieldScope::Entry,
            source,
        }
    }

    pub const fn group(output: &'static str, source: &'static [&'static str]) -> Self {
        Self {
            output,
            scope: FieldScope::Group,
            source,
        }
    }

    pub const fn root(output: &'static str, source: &'static [&'static str]) -> Self {
        Self {
            output,
            scope: FieldScope::Root,
            source,
        }
    }

    /// Dotted form of the source path, used in diagnostics.
    pub fn source_display(&self) -> String {
        let path = self.source.join(".");
        match self.scope {
            FieldScope::Entry => path,
            FieldScope::Group => format!("group.{path}"),
            FieldScope::Root => format!("root.{path}"),
        }
    }

    pub fn lookup<'a>(&self, doc: &DocumentEntry<'a>) -> Option<&'a JsonValue> {
        let scope = match self.scope {
            FieldScope::Entry => Some(doc.entry),
            FieldScope::Group => doc.group,
            FieldScope::Root => Some(doc.root),
        };
        json_at(scope?, self.source)
    }
}

/// Walk `path` through nested JSON objects.
pub fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Everything needed to retrieve and normalize one portal folder.
///
/// Built fresh by fingerprinting a URL and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchProfile {
    pub variant: PortalVariant,
    pub base_url: String,
    pub folder_id: String,
    pub paging: Paging,
    /// Array of document entries: inside every `group_field` element when that is set,
    /// otherwise at the top level.
    pub documents_field: &'static str,
    pub group_field: Option<&'static str>,
    pub asset_path: &'static [&'static str],
    pub title_path: &'static [&'static str],
    pub subfolder_path: Option<&'static [&'static str]>,
    /// Top-level field naming the case. The folder id is used when it is absent.
    pub case_path: Option<&'static [&'static str]>,
    pub field_map: &'static [FieldMapping],
    /// `Authorization` scheme for portals that accept an API token.
    pub auth_scheme: Option<&'static str>,
    pub listing_url_template: String,
}

impl FetchProfile {
    pub fn listing_url(&self, page_number: u32) -> String {
        self.listing_url_template
            .replace(PAGE_PLACEHOLDER, &page_number.to_string())
    }

    /// `ceil(declared_total / page_size)` for numbered listings, always 1 otherwise.
    pub fn total_pages(&self, declared_total: u64) -> u64 {
        match self.paging {
            Paging::Numbered { page_size, .. } => declared_total.div_ceil(u64::from(page_size.max(1))),
            Paging::Single => 1,
        }
    }

    /// Conventional cache file name for this folder.
    pub fn cache_file_name(&self) -> String {
        format!("{}.json", self.folder_id)
    }
}

/// Flat, portal-independent description of one downloadable asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Always absolute (scheme and host present).
    pub asset_url: String,
    pub name: String,
    pub title: String,
    pub case_id: String,
    /// Cache-relative path of the raw JSON the record was read from.
    pub parent_page: String,
    #[serde(default)]
    pub details: BTreeMap<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAP: &[FieldMapping] = &[
        FieldMapping::new("size", &["document_scan", "file_size"]),
        FieldMapping::group("subject", &["subject"]),
        FieldMapping::root("page_title", &["title"]),
    ];

    fn profile(paging: Paging) -> FetchProfile {
        FetchProfile {
            variant: PortalVariant::FolderDocuments,
            base_url: "https://portal.test".into(),
            folder_id: "F1".into(),
            paging,
            documents_field: "documents",
            group_field: None,
            asset_path: &["document_path"],
            title_path: &["title"],
            subfolder_path: None,
            case_path: None,
            field_map: MAP,
            auth_scheme: None,
            listing_url_template: "https://portal.test/client/documents?folder_filter=F1&page_number={page}"
                .into(),
        }
    }

    fn numbered() -> Paging {
        Paging::Numbered {
            page_size: 50,
            tally_field: "total_count",
            record_ceiling: 10_000,
        }
    }

    #[test]
    fn listing_url_substitutes_page_number() {
        assert_eq!(
            profile(numbered()).listing_url(3),
            "https://portal.test/client/documents?folder_filter=F1&page_number=3"
        );
    }

    #[test]
    fn total_pages_rounds_up() {
        let p = profile(numbered());
        assert_eq!(p.total_pages(0), 0);
        assert_eq!(p.total_pages(50), 1);
        assert_eq!(p.total_pages(51), 2);
        assert_eq!(p.total_pages(120), 3);
        assert_eq!(profile(Paging::Single).total_pages(120), 1);
    }

    #[test]
    fn nested_field_lookup() {
        let entry = json!({"document_scan": {"file_size": 42}});
        assert_eq!(MAP[0].lookup(&DocumentEntry::flat(&json!({}), &entry)), Some(&json!(42)));
        assert_eq!(MAP[0].source_display(), "document_scan.file_size");
        let bare = json!({"document_scan": {}});
        assert!(MAP[0].lookup(&DocumentEntry::flat(&json!({}), &bare)).is_none());
    }

    #[test]
    fn scoped_lookup_reads_group_and_root() {
        let root = json!({"title": "SB1421 records"});
        let group = json!({"subject": "Re: records"});
        let entry = json!({"ffile": "https://cdn.test/a.pdf"});
        let doc = DocumentEntry {
            root: &root,
            group: Some(&group),
            entry: &entry,
        };

        assert_eq!(MAP[1].lookup(&doc), Some(&json!("Re: records")));
        assert_eq!(MAP[2].lookup(&doc), Some(&json!("SB1421 records")));
        assert!(MAP[1].lookup(&DocumentEntry::flat(&root, &entry)).is_none());
        assert_eq!(MAP[2].source_display(), "root.title");
    }
}
