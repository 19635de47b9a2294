use crate::classifier::{ClassificationPolicy, Decision, InvoiceClassifier, Tier};
use crate::config::Config;
use crate::cursor::{CursorSnapshot, MailboxKey, PollMode};
use crate::ingestion_log::{BeginOutcome, IngestionLog, NewEntry};
use crate::llm::OpenAiClassifier;
use crate::mailbox::{fetch_into, FetchEvent, FetchRequest, FetchedMessage, ImapConnector, MailConnector};
use crate::message::ParsedEmail;
use crate::store::{EmailOrigin, FileIndex, FileRecord, FileStore};
use crate::vendors::VendorMatcher;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Messages buffered between the IMAP thread and the pipeline
const FETCH_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ingested,
    Skipped,
    AlreadyRecorded,
    OutOfWindow,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDetail {
    pub uid: u32,
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub outcome: Outcome,
    pub reason: String,
}

/// What one poll cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub mailbox: String,
    pub uid_validity: Option<u32>,
    pub total_fetched: usize,
    pub processed: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub already_recorded: usize,
    pub failed: usize,
    pub files_written: usize,
    pub errors: Vec<String>,
    pub details: Vec<MessageDetail>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(mailbox: &str) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn record(&mut self, envelope: &Envelope, outcome: Outcome, reason: impl Into<String>) {
        match outcome {
            Outcome::Ingested => {
                self.processed += 1;
                self.ingested += 1;
            }
            Outcome::Skipped => {
                self.processed += 1;
                self.skipped += 1;
            }
            Outcome::AlreadyRecorded => self.already_recorded += 1,
            Outcome::OutOfWindow => {}
            Outcome::Failed => self.failed += 1,
        }
        self.details.push(MessageDetail {
            uid: envelope.uid,
            message_id: envelope.message_id.clone(),
            from: envelope.from.clone(),
            subject: envelope.subject.clone(),
            outcome,
            reason: reason.into(),
        });
    }

    fn fail(&mut self, envelope: &Envelope, error: &anyhow::Error) {
        let message = format!("UID {}: {error:#}", envelope.uid);
        self.errors.push(message);
        self.record(envelope, Outcome::Failed, format!("{error:#}"));
    }

    pub fn log_summary(&self) {
        log::info!(
            "Poll of {} finished: fetched={} ingested={} skipped={} already_recorded={} failed={} files={}",
            self.mailbox,
            self.total_fetched,
            self.ingested,
            self.skipped,
            self.already_recorded,
            self.failed,
            self.files_written
        );
        for error in &self.errors {
            log::error!("  {error}");
        }
    }
}

/// Header fields known about a message before and after parsing
struct Envelope {
    uid: u32,
    message_id: Option<String>,
    from: Option<String>,
    subject: Option<String>,
}

impl Envelope {
    fn new(uid: u32, parsed: Option<&ParsedEmail>) -> Self {
        Self {
            uid,
            message_id: parsed.and_then(|p| p.message_id.clone()),
            from: parsed.map(ParsedEmail::from_text).filter(|f| !f.is_empty()),
            subject: parsed.and_then(|p| p.subject.clone()),
        }
    }
}

pub struct IngestionService<C = OpenAiClassifier> {
    config: Config,
    connector: Arc<dyn MailConnector>,
    log: IngestionLog,
    store: FileStore,
    policy: ClassificationPolicy<C>,
}

impl IngestionService<OpenAiClassifier> {
    pub fn from_config(config: Config) -> Result<Self> {
        let log = IngestionLog::open(&config.database_path)?;
        let index = FileIndex::open(&config.database_path)?;
        let store = FileStore::new(&config.storage, index);
        let policy = ClassificationPolicy::from_settings(
            &config.classification,
            VendorMatcher::new(config.vendors.clone()),
        )?;
        let connector = Arc::new(ImapConnector::new(config.imap.clone()));
        Ok(Self::new(config, connector, log, store, policy))
    }
}

impl<C: InvoiceClassifier> IngestionService<C> {
    pub fn new(
        config: Config,
        connector: Arc<dyn MailConnector>,
        log: IngestionLog,
        store: FileStore,
        policy: ClassificationPolicy<C>,
    ) -> Self {
        Self {
            config,
            connector,
            log,
            store,
            policy,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> &IngestionLog {
        &self.log
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn policy(&self) -> &ClassificationPolicy<C> {
        &self.policy
    }

    /// Poll immediately, then every polling interval, until `shutdown`
    /// resolves. A cycle in progress gets `shutdown_grace_seconds` to
    /// finish before it is abandoned.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_secs(self.config.polling_interval_seconds.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        log::info!(
            "Polling {} mailbox '{}' every {}s",
            self.connector.describe(),
            self.config.imap.mailbox,
            period.as_secs()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, stopping poller");
                    break;
                }
                _ = ticker.tick() => {
                    let cycle = self.poll_once(PollMode::Incremental);
                    tokio::pin!(cycle);
                    tokio::select! {
                        report = &mut cycle => report.log_summary(),
                        _ = &mut shutdown => {
                            let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
                            log::info!(
                                "Shutdown requested, waiting up to {}s for the current cycle",
                                grace.as_secs()
                            );
                            match tokio::time::timeout(grace, &mut cycle).await {
                                Ok(report) => report.log_summary(),
                                Err(_) => log::warn!("Abandoning unfinished poll cycle"),
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Run one ingestion cycle. Setup and connection failures end up in
    /// `RunReport::errors` rather than being returned.
    pub async fn poll_once(&self, mode: PollMode) -> RunReport {
        let mailbox = self.config.imap.mailbox.clone();
        let mut report = RunReport::new(&mailbox);

        let snapshot = match mode {
            PollMode::Incremental => {
                let max_attempts = self.config.retry_failed.then_some(self.config.max_attempts);
                match self.log.cursor_snapshot(&self.config.user_id, &mailbox, max_attempts) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        report.errors.push(format!("Failed to read ingestion cursor: {e:#}"));
                        report.finished_at = Some(Utc::now());
                        return report;
                    }
                }
            }
            _ => CursorSnapshot::default(),
        };

        let request = FetchRequest {
            mailbox: mailbox.clone(),
            snapshot,
            mode,
            batch_size: self.config.batch_size,
            today: Utc::now().date_naive(),
        };

        let (tx, mut rx) = mpsc::channel(FETCH_BUFFER);
        let connector = Arc::clone(&self.connector);
        let fetch = tokio::task::spawn_blocking(move || fetch_into(connector.as_ref(), &request, &tx));

        let mut key = None;
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Selected { status, plan } => {
                    log::debug!("Selected {mailbox}: {} UID(s) planned", plan.explicit_uids.len());
                    report.uid_validity = Some(status.uid_validity);
                    key = Some(MailboxKey::new(&self.config.user_id, &mailbox, status.uid_validity));
                }
                FetchEvent::Message(message) => {
                    let Some(key) = &key else {
                        log::warn!("Message UID {} arrived before mailbox selection", message.uid);
                        continue;
                    };
                    report.total_fetched += 1;
                    self.process_message(key, message, mode, &mut report).await;
                }
            }
        }

        match fetch.await {
            Ok(Ok(count)) => log::debug!("Fetched {count} message(s) from {mailbox}"),
            Ok(Err(e)) => {
                log::error!("Mailbox fetch failed: {e:#}");
                report.errors.push(format!("Mailbox fetch failed: {e:#}"));
            }
            Err(e) => report.errors.push(format!("Mailbox fetch task failed: {e}")),
        }

        report.finished_at = Some(Utc::now());
        report
    }

    async fn process_message(
        &self,
        key: &MailboxKey,
        message: FetchedMessage,
        mode: PollMode,
        report: &mut RunReport,
    ) {
        let parsed = ParsedEmail::parse(&message.raw);
        let envelope = Envelope::new(message.uid, parsed.as_ref().ok());
        let received = message
            .internal_date
            .or_else(|| parsed.as_ref().ok().and_then(|p| p.date));

        if let PollMode::Backfill { days, .. } = mode {
            // whole days, matching the SINCE search that fetched it
            let cutoff = Utc::now().date_naive() - ChronoDuration::days(i64::from(days));
            if received.is_some_and(|r| r.date_naive() < cutoff) {
                log::debug!("UID {} is outside the {days} day backfill window", message.uid);
                report.record(&envelope, Outcome::OutOfWindow, "outside backfill window");
                return;
            }
        }

        let entry = NewEntry {
            key: key.clone(),
            uid: message.uid,
            message_id: envelope.message_id.clone(),
            internal_date: message.internal_date,
            from: envelope.from.clone(),
            subject: envelope.subject.clone(),
        };
        match self.log.begin(&entry, mode.is_forced()) {
            Ok(BeginOutcome::AlreadyRecorded(status)) => {
                log::debug!("UID {} already {status}, skipping", message.uid);
                report.record(&envelope, Outcome::AlreadyRecorded, format!("already {status}"));
                return;
            }
            Ok(BeginOutcome::Retrying(attempt)) => {
                log::info!("Retrying UID {} (attempt {attempt})", message.uid);
            }
            Ok(BeginOutcome::Started) => {}
            Err(e) => {
                report.fail(&envelope, &e.context("failed to record message in ingestion log"));
                return;
            }
        }

        let result = match parsed {
            Ok(email) => self.ingest(key, &message, &email, received, mode).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(handled) => {
                let decision = handled.decision.to_string();
                if let Err(e) = self
                    .log
                    .mark_processed(key, message.uid, &handled.attachment_hashes, &decision)
                {
                    log::error!("Failed to mark UID {} processed: {e:#}", message.uid);
                    if let Err(discard_err) = self.store.discard(&key.user_id, &handled.written) {
                        log::error!("Could not discard files for UID {}: {discard_err:#}", message.uid);
                    }
                    if let Err(log_err) = self.log.mark_error(key, message.uid, &format!("{e:#}")) {
                        log::error!("Could not record failure for UID {}: {log_err:#}", message.uid);
                    }
                    report.fail(&envelope, &e);
                    return;
                }
                report.files_written += handled.written.len();
                let outcome = if handled.decision.should_ingest() {
                    log::info!("Ingested UID {}: {}", message.uid, handled.decision.reason());
                    Outcome::Ingested
                } else {
                    log::info!("Skipped UID {}: {}", message.uid, handled.decision.reason());
                    Outcome::Skipped
                };
                report.record(&envelope, outcome, handled.decision.reason());
            }
            Err(e) => {
                log::error!("Failed to process UID {}: {e:#}", message.uid);
                if let Err(log_err) = self.log.mark_error(key, message.uid, &format!("{e:#}")) {
                    log::error!("Could not record failure for UID {}: {log_err:#}", message.uid);
                }
                report.fail(&envelope, &e);
            }
        }
    }

    async fn ingest(
        &self,
        key: &MailboxKey,
        message: &FetchedMessage,
        email: &ParsedEmail,
        received: Option<DateTime<Utc>>,
        mode: PollMode,
    ) -> Result<Handled> {
        let attachment_hashes: Vec<String> = email.pdf_attachments().map(|a| a.sha256_hex()).collect();

        let decision = if mode == PollMode::Incremental && self.is_before_first_date(received) {
            Decision::skip("before first_email_date")
        } else if mode.bypasses_policy() {
            Decision::Ingest {
                tier: Tier::Manual,
                reason: "re-ingested on request".to_string(),
            }
        } else {
            self.policy.decide(email).await
        };

        if !decision.should_ingest() {
            return Ok(Handled {
                decision,
                attachment_hashes,
                written: Vec::new(),
            });
        }

        let origin = EmailOrigin {
            mailbox: key.mailbox.clone(),
            uid: message.uid,
            uid_validity: key.uid_validity,
            internal_date: message.internal_date,
        };
        let materialized = self
            .store
            .materialize(&key.user_id, email, &origin)
            .with_context(|| format!("failed to store UID {}", message.uid))?;

        Ok(Handled {
            decision,
            attachment_hashes: materialized.attachment_hashes,
            written: materialized.written,
        })
    }

    fn is_before_first_date(&self, received: Option<DateTime<Utc>>) -> bool {
        match (self.config.first_email_date, received) {
            (Some(first), Some(received)) => received.date_naive() < first,
            _ => false,
        }
    }
}

struct Handled {
    decision: Decision,
    attachment_hashes: Vec<String>,
    /// Files this ingest created, reused PDFs excluded
    written: Vec<FileRecord>,
}

/// Parse a local `.eml` file and run the classification policy on it
/// without touching the ingestion log or the upload store.
pub async fn classify_file<C: InvoiceClassifier>(
    policy: &ClassificationPolicy<C>,
    path: &Path,
) -> Result<(ParsedEmail, Decision)> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read email file: {}", path.display()))?;
    let email = ParsedEmail::parse(&raw)
        .with_context(|| format!("Failed to parse email file: {}", path.display()))?;
    let decision = policy.decide(&email).await;
    Ok((email, decision))
}
