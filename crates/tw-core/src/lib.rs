//! Core domain model and configuration for Tenderwatch.

pub mod config;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tw-core";

/// One parsed search hit, not yet persisted. Produced by the normalizer;
/// every field except the external key and the originating keyword is
/// optional, and "missing" is always `None`, never an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeDraft {
    /// Upstream unique identifier. The sole dedup identity.
    pub external_key: String,
    pub project_name: Option<String>,
    pub organization_name: Option<String>,
    pub category: Option<String>,
    pub procedure_type: Option<String>,
    pub location: Option<String>,
    pub cft_issue_date: Option<String>,
    pub tender_submission_deadline: Option<String>,
    pub opening_tenders_event: Option<String>,
    pub period_end_time: Option<String>,
    pub external_document_uri: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<i64>,
    /// Keyword that produced this hit. Provenance, not identity.
    pub search_keyword: String,
}

/// Persisted notice. Created exactly once by the store; immutable afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeRecord {
    pub external_key: String,
    pub project_name: Option<String>,
    pub organization_name: Option<String>,
    pub category: Option<String>,
    pub procedure_type: Option<String>,
    pub location: Option<String>,
    pub cft_issue_date: Option<String>,
    pub tender_submission_deadline: Option<String>,
    pub opening_tenders_event: Option<String>,
    pub period_end_time: Option<String>,
    pub external_document_uri: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<i64>,
    pub search_keyword: String,
    /// Set by the store at first persistence.
    pub created_at: DateTime<Utc>,
    /// Reserved for per-record notification tracking.
    pub notified: bool,
}

impl NoticeRecord {
    pub fn from_draft(draft: NoticeDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            external_key: draft.external_key,
            project_name: draft.project_name,
            organization_name: draft.organization_name,
            category: draft.category,
            procedure_type: draft.procedure_type,
            location: draft.location,
            cft_issue_date: draft.cft_issue_date,
            tender_submission_deadline: draft.tender_submission_deadline,
            opening_tenders_event: draft.opening_tenders_event,
            period_end_time: draft.period_end_time,
            external_document_uri: draft.external_document_uri,
            file_type: draft.file_type,
            file_size: draft.file_size,
            search_keyword: draft.search_keyword,
            created_at,
            notified: false,
        }
    }
}

/// A notice paired with its optional enrichment summary for the digest.
/// The summary is informational only and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestItem {
    pub record: NoticeRecord,
    pub summary: Option<String>,
}

/// Per-keyword counters for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordRunCount {
    pub keyword: String,
    pub parsed: usize,
    pub newly_inserted: usize,
}

/// Outcome of the single delivery attempt at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeliveryOutcome {
    Delivered,
    /// Dry run requested; no attempt was made.
    Skipped,
    Failed(String),
}

/// Ephemeral aggregate of one pipeline execution. Owned by the orchestrator
/// for the duration of the run; not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_parsed: usize,
    pub keyword_counts: Vec<KeywordRunCount>,
    pub new_records: Vec<NoticeRecord>,
    pub delivery: DeliveryOutcome,
}

/// Composed notification, built fresh per run and consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMessage {
    pub subject: String,
    pub body: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to_emails: Vec<String>,
}
