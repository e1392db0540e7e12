//! Digest composition and SMTP delivery, plus the staged connection
//! diagnostic used for operational troubleshooting.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{error, info};
use tw_core::config::{NotificationSettings, SmtpSettings};
use tw_core::{DigestItem, DigestMessage};

pub const CRATE_NAME: &str = "tw-notify";

/// Rendered in place of any absent field. Never an empty value.
pub const PLACEHOLDER: &str = "unknown";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Digest composition
// ---------------------------------------------------------------------------

/// Run metadata rendered into every digest, including the empty variant.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub organization: String,
    pub keywords: Vec<String>,
    pub searched_at: DateTime<Utc>,
}

fn field(value: Option<&str>) -> &str {
    value.unwrap_or(PLACEHOLDER)
}

/// Compose the digest for one run. Always produces a message: the pipeline
/// sends it even with zero new notices, so the mail channel doubles as a
/// liveness heartbeat.
pub fn compose(
    items: &[DigestItem],
    run: &RunContext,
    settings: &NotificationSettings,
) -> DigestMessage {
    let mut lines = vec![
        "Procurement notice digest".to_string(),
        String::new(),
        format!("Searched at: {}", run.searched_at.format("%Y-%m-%d %H:%M UTC")),
        format!("Organization: {}", run.organization),
        format!("Keywords: {}", run.keywords.join(", ")),
        format!("New notices: {}", items.len()),
        String::new(),
    ];

    if items.is_empty() {
        lines.push("No new notices were found in this run.".to_string());
    } else {
        let shown = items.len().min(settings.max_items_per_mail);
        for (index, item) in items.iter().take(shown).enumerate() {
            let record = &item.record;
            lines.push(format!("[Notice {}]", index + 1));
            lines.push(format!("Title: {}", field(record.project_name.as_deref())));
            lines.push(format!(
                "Organization: {}",
                field(record.organization_name.as_deref())
            ));
            lines.push(format!("Category: {}", field(record.category.as_deref())));
            lines.push(format!(
                "Procedure: {}",
                field(record.procedure_type.as_deref())
            ));
            lines.push(format!("Issued: {}", field(record.cft_issue_date.as_deref())));
            lines.push(format!(
                "Submission deadline: {}",
                field(record.tender_submission_deadline.as_deref())
            ));
            lines.push(format!(
                "Tender opening: {}",
                field(record.opening_tenders_event.as_deref())
            ));
            lines.push(format!(
                "Period end: {}",
                field(record.period_end_time.as_deref())
            ));
            lines.push(format!("Location: {}", field(record.location.as_deref())));
            lines.push(format!(
                "Document: {}",
                field(record.external_document_uri.as_deref())
            ));
            lines.push(format!("File type: {}", field(record.file_type.as_deref())));
            lines.push(format!(
                "File size: {}",
                record
                    .file_size
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| PLACEHOLDER.to_string())
            ));
            lines.push(format!("Keyword: {}", record.search_keyword));
            if let Some(summary) = &item.summary {
                lines.push(format!("Summary: {summary}"));
            }
            lines.push("-".repeat(40));
        }

        let omitted = items.len() - shown;
        if omitted > 0 {
            lines.push(format!(
                "... and {omitted} more new notices omitted from this digest."
            ));
        }
    }

    lines.push(String::new());
    lines.push("This message was sent automatically by tenderwatch.".to_string());

    DigestMessage {
        subject: settings.subject.clone(),
        body: lines.join("\n"),
        from_email: settings.from_email.clone(),
        from_name: settings.from_name.clone(),
        to_emails: settings.to_emails.clone(),
    }
}

/// Fixed message used by the diagnostic test send. Same delivery path as the
/// digest; only the content differs.
pub fn test_message(settings: &NotificationSettings, smtp: &SmtpSettings) -> DigestMessage {
    let mode = TransportMode::from_settings(smtp);
    let body = [
        "This is a test message from the tenderwatch SMTP diagnostic.".to_string(),
        String::new(),
        format!("Server: {}:{}", smtp.server, smtp.port),
        format!("Mode: {mode}"),
        format!("From: {}", settings.from_email),
        format!("To: {}", settings.to_emails.join(", ")),
        String::new(),
        "If this message arrived, the SMTP settings are working.".to_string(),
    ]
    .join("\n");

    DigestMessage {
        subject: "[tenderwatch] SMTP connection test".to_string(),
        body,
        from_email: settings.from_email.clone(),
        from_name: settings.from_name.clone(),
        to_emails: settings.to_emails.clone(),
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Transport mode is a configuration value, never auto-negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Unencrypted session.
    Plain,
    /// Plain connect, then a required STARTTLS upgrade.
    StartTls,
    /// TLS from the first byte (typically port 465).
    ImplicitTls,
}

impl TransportMode {
    pub fn from_settings(settings: &SmtpSettings) -> Self {
        if settings.use_ssl {
            Self::ImplicitTls
        } else if settings.use_tls {
            Self::StartTls
        } else {
            Self::Plain
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::StartTls => write!(f, "starttls"),
            Self::ImplicitTls => write!(f, "implicit-tls"),
        }
    }
}

/// Closed failure set for one delivery attempt. All variants are terminal
/// for that run's delivery; there is no automatic retry.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("server closed the session unexpectedly: {0}")]
    UnexpectedDisconnect(String),
    #[error("timed out")]
    Timeout,
    #[error("smtp transport error: {0}")]
    Transport(String),
}

// Reply codes the server uses to refuse credentials.
const AUTH_REJECTION_CODES: &[&str] = &["530", "534", "535", "538"];

fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> DeliveryError {
    if err.is_timeout() {
        return DeliveryError::Timeout;
    }
    if let Some(code) = err.status() {
        let code = code.to_string();
        if AUTH_REJECTION_CODES.contains(&code.as_str()) {
            return DeliveryError::Authentication(format!("server replied {code}"));
        }
        return DeliveryError::Transport(format!("server replied {code}"));
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::TimedOut => DeliveryError::Timeout,
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                    DeliveryError::Connect(io.to_string())
                }
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => {
                    DeliveryError::UnexpectedDisconnect(io.to_string())
                }
                _ => DeliveryError::Connect(io.to_string()),
            };
        }
        source = cause.source();
    }

    DeliveryError::Transport(err.to_string())
}

fn build_transport(
    settings: &SmtpSettings,
    with_credentials: bool,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
    let mode = TransportMode::from_settings(settings);
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.server)
        .port(settings.port)
        .timeout(Some(DELIVERY_TIMEOUT));

    builder = match mode {
        TransportMode::Plain => builder.tls(Tls::None),
        TransportMode::StartTls => {
            let params = TlsParameters::new(settings.server.clone())
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            builder.tls(Tls::Required(params))
        }
        TransportMode::ImplicitTls => {
            let params = TlsParameters::new(settings.server.clone())
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            builder.tls(Tls::Wrapper(params))
        }
    };

    if with_credentials {
        builder = builder.credentials(Credentials::new(
            settings.username.clone(),
            settings.password.clone(),
        ));
    }

    Ok(builder.build())
}

fn build_email(message: &DigestMessage) -> Result<Message, DeliveryError> {
    let from_address = message
        .from_email
        .parse()
        .map_err(|e| DeliveryError::Transport(format!("invalid sender address: {e}")))?;
    let mut builder = Message::builder()
        .from(Mailbox::new(message.from_name.clone(), from_address))
        .subject(message.subject.clone())
        .header(ContentType::TEXT_PLAIN);
    for to in &message.to_emails {
        let address = to
            .parse()
            .map_err(|e| DeliveryError::Transport(format!("invalid recipient address: {e}")))?;
        builder = builder.to(Mailbox::new(None, address));
    }
    builder
        .body(message.body.clone())
        .map_err(|e| DeliveryError::Transport(e.to_string()))
}

/// Single delivery attempt over the configured transport mode. Connect,
/// upgrade when the mode says so, authenticate, transmit, close.
pub async fn deliver(message: &DigestMessage, settings: &SmtpSettings) -> Result<(), DeliveryError> {
    let mode = TransportMode::from_settings(settings);
    let email = build_email(message)?;
    let transport = build_transport(settings, true)?;

    info!(
        server = %settings.server,
        port = settings.port,
        %mode,
        recipients = message.to_emails.len(),
        "delivering digest"
    );

    match tokio::time::timeout(DELIVERY_TIMEOUT, transport.send(email)).await {
        Ok(Ok(_)) => {
            info!(server = %settings.server, port = settings.port, %mode, "digest delivered");
            Ok(())
        }
        Ok(Err(err)) => {
            let classified = classify_smtp_error(&err);
            error!(
                server = %settings.server,
                port = settings.port,
                %mode,
                error = %classified,
                "delivery failed"
            );
            Err(classified)
        }
        Err(_) => {
            error!(server = %settings.server, port = settings.port, %mode, "delivery timed out");
            Err(DeliveryError::Timeout)
        }
    }
}

// ---------------------------------------------------------------------------
// Staged diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticStage {
    Resolve,
    TcpConnect,
    SmtpHandshake,
    TlsUpgrade,
    Authenticate,
    TestSend,
}

impl fmt::Display for DiagnosticStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve => write!(f, "name resolution"),
            Self::TcpConnect => write!(f, "tcp connection"),
            Self::SmtpHandshake => write!(f, "smtp handshake"),
            Self::TlsUpgrade => write!(f, "tls upgrade"),
            Self::Authenticate => write!(f, "authentication"),
            Self::TestSend => write!(f, "test send"),
        }
    }
}

#[derive(Debug)]
pub struct StagePass {
    pub stage: DiagnosticStage,
    pub detail: String,
}

#[derive(Debug)]
pub struct DiagnosticReport {
    pub mode: TransportMode,
    pub passed: Vec<StagePass>,
    pub failure: Option<(DiagnosticStage, DeliveryError)>,
}

impl DiagnosticReport {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// Validate the mail path stage by stage, stopping at the first failure.
/// Reuses the delivery transport semantics throughout; the optional test
/// send goes through `deliver` with a fixed message.
pub async fn diagnose(
    settings: &SmtpSettings,
    test_send: Option<&DigestMessage>,
) -> DiagnosticReport {
    let mode = TransportMode::from_settings(settings);
    let mut report = DiagnosticReport {
        mode,
        passed: Vec::new(),
        failure: None,
    };

    // 1. Name resolution.
    let target = (settings.server.as_str(), settings.port);
    match tokio::net::lookup_host(target).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => report.passed.push(StagePass {
                stage: DiagnosticStage::Resolve,
                detail: format!("{} -> {}", settings.server, addr.ip()),
            }),
            None => {
                report.failure = Some((
                    DiagnosticStage::Resolve,
                    DeliveryError::Connect("no addresses returned".to_string()),
                ));
                return report;
            }
        },
        Err(err) => {
            report.failure = Some((
                DiagnosticStage::Resolve,
                DeliveryError::Connect(err.to_string()),
            ));
            return report;
        }
    }

    // 2. Raw port reachability.
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => report.passed.push(StagePass {
            stage: DiagnosticStage::TcpConnect,
            detail: format!("port {} reachable", settings.port),
        }),
        Ok(Err(err)) => {
            report.failure = Some((
                DiagnosticStage::TcpConnect,
                DeliveryError::Connect(err.to_string()),
            ));
            return report;
        }
        Err(_) => {
            report.failure = Some((DiagnosticStage::TcpConnect, DeliveryError::Timeout));
            return report;
        }
    }

    // 3. Protocol handshake (and TLS, when the mode requires it), without
    // credentials so an auth problem cannot mask a transport problem.
    let handshake = match build_transport(settings, false) {
        Ok(transport) => transport,
        Err(err) => {
            report.failure = Some((DiagnosticStage::SmtpHandshake, err));
            return report;
        }
    };
    match handshake.test_connection().await {
        Ok(true) => {
            report.passed.push(StagePass {
                stage: DiagnosticStage::SmtpHandshake,
                detail: "EHLO accepted".to_string(),
            });
            if mode != TransportMode::Plain {
                report.passed.push(StagePass {
                    stage: DiagnosticStage::TlsUpgrade,
                    detail: format!("session encrypted ({mode})"),
                });
            }
        }
        Ok(false) => {
            report.failure = Some((
                DiagnosticStage::SmtpHandshake,
                DeliveryError::Transport("server rejected the handshake probe".to_string()),
            ));
            return report;
        }
        Err(err) => {
            let stage = if err.is_tls() {
                DiagnosticStage::TlsUpgrade
            } else {
                DiagnosticStage::SmtpHandshake
            };
            report.failure = Some((stage, classify_smtp_error(&err)));
            return report;
        }
    }

    // 4. Authentication.
    let authed = match build_transport(settings, true) {
        Ok(transport) => transport,
        Err(err) => {
            report.failure = Some((DiagnosticStage::Authenticate, err));
            return report;
        }
    };
    match authed.test_connection().await {
        Ok(true) => report.passed.push(StagePass {
            stage: DiagnosticStage::Authenticate,
            detail: format!("credentials accepted for {}", settings.username),
        }),
        Ok(false) => {
            report.failure = Some((
                DiagnosticStage::Authenticate,
                DeliveryError::Transport("probe rejected after authentication".to_string()),
            ));
            return report;
        }
        Err(err) => {
            report.failure = Some((DiagnosticStage::Authenticate, classify_smtp_error(&err)));
            return report;
        }
    }

    // 5. Optional test send through the normal delivery path.
    if let Some(message) = test_send {
        match deliver(message, settings).await {
            Ok(()) => report.passed.push(StagePass {
                stage: DiagnosticStage::TestSend,
                detail: format!("sent to {}", message.to_emails.join(", ")),
            }),
            Err(err) => {
                report.failure = Some((DiagnosticStage::TestSend, err));
                return report;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tw_core::{NoticeDraft, NoticeRecord};

    fn settings(max_items: usize) -> NotificationSettings {
        NotificationSettings {
            from_email: "watcher@example.com".to_string(),
            from_name: Some("Tenderwatch".to_string()),
            to_emails: vec!["ops@example.com".to_string()],
            subject: "[tenderwatch] new notices".to_string(),
            max_items_per_mail: max_items,
        }
    }

    fn run_context() -> RunContext {
        RunContext {
            organization: "Ministry of Example".to_string(),
            keywords: vec!["security".to_string(), "research".to_string()],
            searched_at: Utc.with_ymd_and_hms(2026, 8, 26, 9, 0, 0).single().unwrap(),
        }
    }

    fn item(key: &str, location: Option<&str>, summary: Option<&str>) -> DigestItem {
        let draft = NoticeDraft {
            external_key: key.to_string(),
            project_name: Some(format!("project {key}")),
            organization_name: Some("Ministry of Example".to_string()),
            category: Some("services".to_string()),
            procedure_type: None,
            location: location.map(str::to_string),
            cft_issue_date: Some("2026-08-01".to_string()),
            tender_submission_deadline: None,
            opening_tenders_event: None,
            period_end_time: None,
            external_document_uri: Some("https://example.com/doc.pdf".to_string()),
            file_type: Some("pdf".to_string()),
            file_size: Some(1024),
            search_keyword: "security".to_string(),
        };
        DigestItem {
            record: NoticeRecord::from_draft(draft, Utc::now()),
            summary: summary.map(str::to_string),
        }
    }

    #[test]
    fn item_cap_renders_first_n_and_exact_omission_count() {
        let items: Vec<DigestItem> = (1..=5)
            .map(|i| item(&format!("K-{i}"), Some("Tokyo"), None))
            .collect();
        let message = compose(&items, &run_context(), &settings(2));

        assert_eq!(message.body.matches("[Notice ").count(), 2);
        assert!(message.body.contains("project K-1"));
        assert!(message.body.contains("project K-2"));
        assert!(!message.body.contains("project K-3"));
        assert!(message.body.contains("and 3 more new notices omitted"));
    }

    #[test]
    fn zero_new_records_still_composes_a_full_message() {
        let message = compose(&[], &run_context(), &settings(50));

        assert_eq!(message.subject, "[tenderwatch] new notices");
        assert_eq!(message.to_emails, vec!["ops@example.com".to_string()]);
        assert!(message.body.contains("No new notices were found in this run."));
        assert!(message.body.contains("Organization: Ministry of Example"));
        assert!(message.body.contains("Keywords: security, research"));
        assert!(!message.body.contains("[Notice "));
    }

    #[test]
    fn missing_fields_render_the_placeholder_never_an_empty_value() {
        let items = vec![item("K-1", None, None)];
        let message = compose(&items, &run_context(), &settings(50));

        assert!(message.body.contains("Location: unknown"));
        assert!(message.body.contains("Procedure: unknown"));
        assert!(message.body.contains("Submission deadline: unknown"));
        assert!(!message.body.contains("Location: \n"));
    }

    #[test]
    fn summary_line_appears_only_when_enrichment_produced_one() {
        let with = compose(
            &[item("K-1", Some("Tokyo"), Some("Short summary."))],
            &run_context(),
            &settings(50),
        );
        assert!(with.body.contains("Summary: Short summary."));

        let without = compose(&[item("K-1", Some("Tokyo"), None)], &run_context(), &settings(50));
        assert!(!without.body.contains("Summary:"));
    }

    #[test]
    fn transport_mode_selection_is_explicit_and_ssl_wins() {
        let base = SmtpSettings {
            server: "smtp.example.com".to_string(),
            port: 587,
            use_tls: false,
            use_ssl: false,
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert_eq!(TransportMode::from_settings(&base), TransportMode::Plain);

        let starttls = SmtpSettings { use_tls: true, ..base.clone() };
        assert_eq!(TransportMode::from_settings(&starttls), TransportMode::StartTls);

        let both = SmtpSettings { use_tls: true, use_ssl: true, ..base };
        assert_eq!(TransportMode::from_settings(&both), TransportMode::ImplicitTls);
    }

    #[test]
    fn email_building_rejects_bad_addresses_and_accepts_good_ones() {
        let mut message = test_message(
            &settings(50),
            &SmtpSettings {
                server: "smtp.example.com".to_string(),
                port: 587,
                use_tls: true,
                use_ssl: false,
                username: "u".to_string(),
                password: "p".to_string(),
            },
        );
        assert!(build_email(&message).is_ok());

        message.from_email = "not an address".to_string();
        assert!(matches!(build_email(&message), Err(DeliveryError::Transport(_))));
    }

    #[tokio::test]
    async fn diagnose_stops_at_the_first_failing_stage() {
        // Nothing listens on this port; resolution succeeds, TCP fails.
        let unreachable = SmtpSettings {
            server: "127.0.0.1".to_string(),
            port: 9,
            use_tls: false,
            use_ssl: false,
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let report = diagnose(&unreachable, None).await;

        assert!(!report.is_ok());
        let (stage, err) = report.failure.expect("must fail");
        assert_eq!(stage, DiagnosticStage::TcpConnect);
        assert!(matches!(err, DeliveryError::Connect(_) | DeliveryError::Timeout));
        assert_eq!(report.passed.len(), 1);
        assert_eq!(report.passed[0].stage, DiagnosticStage::Resolve);
    }
}
