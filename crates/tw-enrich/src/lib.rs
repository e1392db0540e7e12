//! Best-effort notice enrichment: fetch the linked document and produce a
//! short LLM summary. Every failure degrades to "no summary".

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "tw-enrich";

/// Longest text prefix handed to the summarizer for non-PDF documents.
pub const TEXT_PREFIX_LIMIT: usize = 4000;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The ~100 character budget is enforced by instruction, not truncation.
const SUMMARY_PROMPT: &str = "Summarize this procurement notice document in roughly 100 characters. \
     Mention the subject and, if stated, the submission deadline. \
     Reply with the summary only.";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("document fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("document fetch returned http status {0}")]
    Status(u16),
    #[error("scratch file error: {0}")]
    Scratch(#[from] std::io::Error),
    #[error("llm api error: {0}")]
    Api(String),
    #[error("llm response contained no usable text")]
    EmptyResponse,
}

/// Seam for the summarization backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn summarize_text(&self, text: &str) -> Result<String, EnrichError>;
    async fn summarize_pdf(&self, path: &Path, file_name: &str) -> Result<String, EnrichError>;
}

/// OpenAI-compatible client: chat completions for text, file upload plus the
/// responses endpoint for PDFs.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: &str) -> Result<Self, EnrichError> {
        Self::with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, EnrichError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, EnrichError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EnrichError::Api(format!("http {status}: {body}")))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<ResponsesOutput>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutput {
    #[serde(default)]
    content: Vec<ResponsesContent>,
}

#[derive(Debug, Deserialize)]
struct ResponsesContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn summarize_text(&self, text: &str) -> Result<String, EnrichError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": format!("{SUMMARY_PROMPT}\n\n{text}") }
            ],
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let reply: ChatResponse = Self::expect_success(response).await?.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(EnrichError::EmptyResponse)
    }

    async fn summarize_pdf(&self, path: &Path, file_name: &str) -> Result<String, EnrichError> {
        let bytes = std::fs::read(path)?;
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = multipart::Form::new()
            .text("purpose", "user_data")
            .part("file", part);
        let upload = self
            .http
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let uploaded: FileUploadResponse = Self::expect_success(upload).await?.json().await?;
        debug!(file_id = %uploaded.id, "uploaded pdf for summarization");

        let body = serde_json::json!({
            "model": self.model,
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_file", "file_id": uploaded.id },
                    { "type": "input_text", "text": SUMMARY_PROMPT },
                ],
            }],
        });
        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let reply: ResponsesReply = Self::expect_success(response).await?.json().await?;
        reply
            .output
            .into_iter()
            .flat_map(|o| o.content)
            .find(|c| c.kind == "output_text" && !c.text.trim().is_empty())
            .map(|c| c.text.trim().to_string())
            .ok_or(EnrichError::EmptyResponse)
    }
}

pub struct Enricher {
    http: reqwest::Client,
    llm: Option<Box<dyn LlmClient>>,
}

impl Enricher {
    /// No summarization capability configured; every call yields `None`.
    pub fn disabled() -> Self {
        Self {
            http: reqwest::Client::new(),
            llm: None,
        }
    }

    pub fn new(llm: Box<dyn LlmClient>) -> Result<Self, EnrichError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            llm: Some(llm),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.llm.is_some()
    }

    /// Fetch the linked document and summarize it. Never fails outward: any
    /// error is logged and collapses to `None`.
    pub async fn summarize_document(&self, uri: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;
        match self.try_summarize(llm.as_ref(), uri).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(uri, %err, "enrichment failed; continuing without summary");
                None
            }
        }
    }

    async fn try_summarize(&self, llm: &dyn LlmClient, uri: &str) -> Result<String, EnrichError> {
        let response = self.http.get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if looks_like_pdf(&content_type, uri) {
            let bytes = response.bytes().await?;
            // Scratch file; removed on drop on every exit path.
            let mut scratch = tempfile::NamedTempFile::new()?;
            scratch.write_all(&bytes)?;
            scratch.flush()?;
            llm.summarize_pdf(scratch.path(), "notice.pdf").await
        } else {
            let text = response.text().await?;
            llm.summarize_text(truncate_chars(&text, TEXT_PREFIX_LIMIT)).await
        }
    }
}

pub fn looks_like_pdf(content_type: &str, uri: &str) -> bool {
    if content_type.contains("application/pdf") {
        return true;
    }
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.to_ascii_lowercase().ends_with(".pdf")
}

/// Truncate to at most `limit` characters on a char boundary.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreachableLlm;

    #[async_trait]
    impl LlmClient for UnreachableLlm {
        async fn summarize_text(&self, _text: &str) -> Result<String, EnrichError> {
            panic!("llm must not be called when the fetch fails");
        }

        async fn summarize_pdf(&self, _path: &Path, _name: &str) -> Result<String, EnrichError> {
            panic!("llm must not be called when the fetch fails");
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Multi-byte: 4 chars, 12 bytes.
        assert_eq!(truncate_chars("調達公告", 2), "調達");
    }

    #[test]
    fn pdf_detection_by_content_type_and_extension() {
        assert!(looks_like_pdf("application/pdf", "https://example.com/doc"));
        assert!(looks_like_pdf("application/pdf; charset=binary", "https://example.com/doc"));
        assert!(looks_like_pdf("", "https://example.com/notice.PDF"));
        assert!(looks_like_pdf("text/html", "https://example.com/notice.pdf?dl=1"));
        assert!(!looks_like_pdf("text/html", "https://example.com/notice.html"));
        assert!(!looks_like_pdf("", "https://example.com/pdf-guide.html"));
    }

    #[tokio::test]
    async fn disabled_enricher_returns_none_without_fetching() {
        let enricher = Enricher::disabled();
        assert!(!enricher.is_enabled());
        assert_eq!(enricher.summarize_document("https://example.com/x.pdf").await, None);
    }

    #[tokio::test]
    async fn unreachable_document_uri_degrades_to_none() {
        let enricher = Enricher::new(Box::new(UnreachableLlm)).expect("enricher");
        // Nothing listens here; the fetch fails before the LLM is consulted.
        let summary = enricher.summarize_document("http://127.0.0.1:9/doc.pdf").await;
        assert_eq!(summary, None);
    }
}
