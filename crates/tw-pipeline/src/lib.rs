//! Pipeline orchestration: one run is one linear pass over the configured
//! keywords, ending in exactly one delivery attempt.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};
use tw_core::config::AppConfig;
use tw_core::{DeliveryOutcome, DigestItem, KeywordRunCount, NoticeRecord, RunSummary};
use tw_enrich::{Enricher, OpenAiClient};
use tw_notify::{compose, deliver, RunContext};
use tw_search::{parse_payload, SearchClient, DEFAULT_API_URL, MAX_PAGE_SIZE};
use tw_store::NoticeStore;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tw-pipeline";

/// Pause between keyword queries. An upstream scheduling requirement, not a
/// performance knob.
const INTER_REQUEST_PAUSE: Duration = Duration::from_secs(1);

pub struct Pipeline {
    config: AppConfig,
    store: NoticeStore,
    search: SearchClient,
    enricher: Enricher,
    dry_run: bool,
}

impl Pipeline {
    pub async fn bootstrap(config: AppConfig, dry_run: bool) -> Result<Self> {
        Self::bootstrap_with_api_url(config, dry_run, DEFAULT_API_URL).await
    }

    pub async fn bootstrap_with_api_url(
        config: AppConfig,
        dry_run: bool,
        api_url: &str,
    ) -> Result<Self> {
        let database_url = format!("sqlite:{}?mode=rwc", config.database.path);
        let store = NoticeStore::open(&database_url)
            .await
            .with_context(|| format!("opening notice store at {}", config.database.path))?;

        let search = SearchClient::with_api_url(&config.organization, MAX_PAGE_SIZE, api_url)
            .context("building search client")?;

        let enricher = match &config.openai {
            Some(openai) if !openai.api_key.trim().is_empty() => {
                let llm = OpenAiClient::new(&openai.api_key, &openai.model)
                    .context("building llm client")?;
                Enricher::new(Box::new(llm)).context("building enricher")?
            }
            _ => Enricher::disabled(),
        };
        if !enricher.is_enabled() {
            info!("no llm api key configured; summaries disabled");
        }

        Ok(Self {
            config,
            store,
            search,
            enricher,
            dry_run,
        })
    }

    pub fn store(&self) -> &NoticeStore {
        &self.store
    }

    /// One full pass. Keyword-level failures degrade that keyword to zero
    /// new records; the run always reaches the delivery step. The digest is
    /// composed and sent even with nothing new, as a liveness heartbeat.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let keywords = active_keywords(&self.config.keywords);
        info!(
            %run_id,
            organization = %self.config.organization,
            keywords = keywords.len(),
            "starting run"
        );

        let mut total_parsed = 0usize;
        let mut keyword_counts = Vec::new();
        let mut new_records: Vec<NoticeRecord> = Vec::new();

        for (index, keyword) in keywords.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(INTER_REQUEST_PAUSE).await;
            }
            let (parsed, inserted) = self.run_keyword(keyword).await;
            total_parsed += parsed;
            keyword_counts.push(KeywordRunCount {
                keyword: keyword.clone(),
                parsed,
                newly_inserted: inserted.len(),
            });
            new_records.extend(inserted);
        }

        // Only records the composer will render get an LLM round trip; the
        // rest land in the digest's omission count untouched.
        let (to_enrich, omitted) =
            enrichment_split(&new_records, self.config.notification.max_items_per_mail);
        let mut items = Vec::with_capacity(new_records.len());
        for record in to_enrich {
            let summary = match &record.external_document_uri {
                Some(uri) => self.enricher.summarize_document(uri).await,
                None => None,
            };
            items.push(DigestItem {
                record: record.clone(),
                summary,
            });
        }
        for record in omitted {
            items.push(DigestItem {
                record: record.clone(),
                summary: None,
            });
        }

        let run_context = RunContext {
            organization: self.config.organization.clone(),
            keywords,
            searched_at: started_at,
        };
        let message = compose(&items, &run_context, &self.config.notification);

        let delivery = if self.dry_run {
            info!(%run_id, "dry run; digest composed but not delivered");
            DeliveryOutcome::Skipped
        } else {
            match deliver(&message, &self.config.smtp).await {
                Ok(()) => DeliveryOutcome::Delivered,
                // Terminal for the delivery step only; the run still
                // completes and reports the failure.
                Err(err) => DeliveryOutcome::Failed(err.to_string()),
            }
        };

        let finished_at = Utc::now();
        info!(
            %run_id,
            total_parsed,
            new = new_records.len(),
            delivery = ?delivery,
            "run completed"
        );

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            total_parsed,
            keyword_counts,
            new_records,
            delivery,
        })
    }

    async fn run_keyword(&self, keyword: &str) -> (usize, Vec<NoticeRecord>) {
        let payload = match self.search.search(keyword).await {
            Ok(payload) => payload,
            Err(err) => {
                error!(keyword, %err, "search failed; skipping keyword for this run");
                return (0, Vec::new());
            }
        };

        let parsed = match parse_payload(&payload, keyword) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(keyword, %err, "payload unusable; skipping keyword for this run");
                return (0, Vec::new());
            }
        };
        info!(
            keyword,
            parsed = parsed.records.len(),
            skipped_malformed = parsed.skipped_malformed,
            "keyword searched"
        );

        let inserted = self.store.persist_new(&parsed.records).await;
        info!(keyword, new = inserted.len(), "batch persisted");
        (parsed.records.len(), inserted)
    }
}

/// The keyword list as actually searched and reported: blanks dropped,
/// order preserved. Digest metadata uses the same list.
fn active_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .cloned()
        .collect()
}

/// Split new records at the mail cap. The first slice is enriched and
/// rendered; the second only counts toward the omission notice.
fn enrichment_split(records: &[NoticeRecord], cap: usize) -> (&[NoticeRecord], &[NoticeRecord]) {
    records.split_at(records.len().min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tw_core::config::{
        DatabaseSettings, NotificationSettings, SmtpSettings,
    };

    fn config_with_db(path: &str) -> AppConfig {
        AppConfig {
            organization: "Ministry of Example".to_string(),
            keywords: vec!["security".to_string(), "  ".to_string(), "system".to_string()],
            database: DatabaseSettings {
                path: path.to_string(),
            },
            smtp: SmtpSettings {
                server: "smtp.example.com".to_string(),
                port: 587,
                use_tls: true,
                use_ssl: false,
                username: "u".to_string(),
                password: "p".to_string(),
            },
            notification: NotificationSettings {
                from_email: "watcher@example.com".to_string(),
                from_name: None,
                to_emails: vec!["ops@example.com".to_string()],
                subject: "[tenderwatch] new notices".to_string(),
                max_items_per_mail: 50,
            },
            openai: None,
        }
    }

    #[tokio::test]
    async fn unreachable_api_degrades_every_keyword_and_still_reaches_delivery() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("notices.db");
        let config = config_with_db(db_path.to_str().unwrap());

        // Nothing listens here; every keyword fails its search and the run
        // must still complete with a (dry-run) delivery step.
        let pipeline =
            Pipeline::bootstrap_with_api_url(config, true, "http://127.0.0.1:9/")
                .await
                .expect("bootstrap");
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.total_parsed, 0);
        assert!(summary.new_records.is_empty());
        // Blank keywords are filtered before any request is made.
        assert_eq!(summary.keyword_counts.len(), 2);
        assert!(summary
            .keyword_counts
            .iter()
            .all(|c| c.parsed == 0 && c.newly_inserted == 0));
        assert_eq!(summary.delivery, DeliveryOutcome::Skipped);
        assert_eq!(pipeline.store().count().await.unwrap(), 0);
    }

    fn record(key: &str) -> NoticeRecord {
        let draft = tw_core::NoticeDraft {
            external_key: key.to_string(),
            project_name: Some(format!("project {key}")),
            organization_name: None,
            category: None,
            procedure_type: None,
            location: None,
            cft_issue_date: None,
            tender_submission_deadline: None,
            opening_tenders_event: None,
            period_end_time: None,
            external_document_uri: Some("https://example.com/doc.pdf".to_string()),
            file_type: None,
            file_size: None,
            search_keyword: "security".to_string(),
        };
        NoticeRecord::from_draft(draft, Utc::now())
    }

    #[test]
    fn records_past_the_mail_cap_are_not_handed_to_the_enricher() {
        let records: Vec<NoticeRecord> = (1..=5).map(|i| record(&format!("K-{i}"))).collect();

        let (to_enrich, omitted) = enrichment_split(&records, 2);
        assert_eq!(to_enrich.len(), 2);
        assert_eq!(to_enrich[1].external_key, "K-2");
        assert_eq!(omitted.len(), 3);
        assert_eq!(omitted[0].external_key, "K-3");

        let (all, none) = enrichment_split(&records, 50);
        assert_eq!(all.len(), 5);
        assert!(none.is_empty());
    }

    #[test]
    fn blank_keywords_are_dropped_from_searches_and_run_metadata() {
        let keywords = vec![
            "security".to_string(),
            "  ".to_string(),
            String::new(),
            "system".to_string(),
        ];
        assert_eq!(
            active_keywords(&keywords),
            vec!["security".to_string(), "system".to_string()]
        );
        assert!(active_keywords(&[]).is_empty());
    }
}
