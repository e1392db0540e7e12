//! Search client for the procurement-notice API and the XML normalizer.

use std::time::Duration;

use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::{debug, info, warn};
use tw_core::NoticeDraft;

pub const CRATE_NAME: &str = "tw-search";

pub const DEFAULT_API_URL: &str = "http://www.kkj.go.jp/api/";

/// Upstream page-size ceiling. Requests never ask for more than this.
pub const MAX_PAGE_SIZE: u32 = 100;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SearchError {
    /// Network-level failure: the request never reached the server or the
    /// response never came back.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with a non-success status code.
    #[error("api failure: http status {status}")]
    Api { status: u16 },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

#[derive(Debug)]
pub struct SearchClient {
    http: reqwest::Client,
    api_url: String,
    organization: String,
    page_size: u32,
}

impl SearchClient {
    pub fn new(organization: &str, page_size: u32) -> Result<Self, SearchError> {
        Self::with_api_url(organization, page_size, DEFAULT_API_URL)
    }

    pub fn with_api_url(
        organization: &str,
        page_size: u32,
        api_url: &str,
    ) -> Result<Self, SearchError> {
        if organization.trim().is_empty() {
            return Err(SearchError::InvalidRequest("organization must not be empty"));
        }
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            organization: organization.to_string(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        })
    }

    /// Issue one query for one keyword and return the raw XML payload.
    pub async fn search(&self, keyword: &str) -> Result<String, SearchError> {
        if keyword.trim().is_empty() {
            return Err(SearchError::InvalidRequest("keyword must not be empty"));
        }

        debug!(organization = %self.organization, keyword, "issuing search request");
        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("Organization_Name", self.organization.as_str()),
                ("Query", keyword),
                ("Count", &self.page_size.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Api {
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Xml(#[from] roxmltree::Error),
    /// Well-formed error envelope embedded in the response body.
    #[error("api error envelope: {0}")]
    ApiEnvelope(String),
    /// The mandatory external key is absent or empty on one hit.
    #[error("malformed record: missing external key")]
    MalformedRecord,
}

/// Result of normalizing one payload: the usable records plus the count of
/// hits dropped as malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayload {
    pub records: Vec<NoticeDraft>,
    pub skipped_malformed: usize,
}

/// Parse one raw search payload into canonical drafts. Malformed hits are
/// logged and skipped; an error envelope or unparseable XML fails the whole
/// payload (the caller then skips the keyword for this run).
pub fn parse_payload(xml: &str, keyword: &str) -> Result<ParsedPayload, ParseError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();

    if let Some(error) = find_child(root, "Error") {
        let message = error.text().unwrap_or("unspecified error").trim().to_string();
        return Err(ParseError::ApiEnvelope(message));
    }

    let Some(results) = find_child(root, "SearchResults") else {
        return Ok(ParsedPayload {
            records: Vec::new(),
            skipped_malformed: 0,
        });
    };

    if let Some(hits) = child_text(results, "SearchHits") {
        info!(keyword, hits = %hits, "search hit count reported by upstream");
    }

    let mut records = Vec::new();
    let mut skipped_malformed = 0;
    for hit in results.children().filter(|n| n.has_tag_name("SearchResult")) {
        match normalize_hit(hit, keyword) {
            Ok(draft) => records.push(draft),
            Err(ParseError::MalformedRecord) => {
                warn!(keyword, "dropping search hit without an external key");
                skipped_malformed += 1;
            }
            Err(other) => return Err(other),
        }
    }

    Ok(ParsedPayload {
        records,
        skipped_malformed,
    })
}

/// Normalize one raw search hit. Only the external key is mandatory; every
/// other field degrades to `None` when missing, including an integer field
/// that fails to parse. Partial data beats dropping the record.
pub fn normalize_hit(node: Node<'_, '_>, keyword: &str) -> Result<NoticeDraft, ParseError> {
    let external_key = child_text(node, "Key").ok_or(ParseError::MalformedRecord)?;

    Ok(NoticeDraft {
        external_key,
        project_name: child_text(node, "ProjectName"),
        organization_name: child_text(node, "OrganizationName"),
        category: child_text(node, "Category"),
        procedure_type: child_text(node, "ProcedureType"),
        location: child_text(node, "Location"),
        cft_issue_date: child_text(node, "CftIssueDate"),
        tender_submission_deadline: child_text(node, "TenderSubmissionDeadline"),
        opening_tenders_event: child_text(node, "OpeningTendersEvent"),
        period_end_time: child_text(node, "PeriodEndTime"),
        external_document_uri: child_text(node, "ExternalDocumentURI"),
        file_type: child_text(node, "FileType"),
        file_size: child_text(node, "FileSize")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|size| *size >= 0),
        search_keyword: keyword.to_string(),
    })
}

fn find_child<'a, 'b>(node: Node<'a, 'b>, tag: &str) -> Option<Node<'a, 'b>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    let text = find_child(node, tag)?.text()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
