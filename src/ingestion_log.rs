use crate::cursor::{CursorSnapshot, MailboxKey};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Processed,
    Error,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Processed => "processed",
            IngestStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(IngestStatus::Pending),
            "processed" => Ok(IngestStatus::Processed),
            "error" => Ok(IngestStatus::Error),
            other => Err(anyhow!("unknown ingestion status '{other}'")),
        }
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope data recorded when processing of a message starts
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub key: MailboxKey,
    pub uid: u32,
    pub message_id: Option<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub key: MailboxKey,
    pub uid: u32,
    pub message_id: Option<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub status: IngestStatus,
    pub decision: Option<String>,
    pub error: Option<String>,
    pub attachment_hashes: Vec<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogEntry {
    /// Processed rows whose decision was to leave the message alone
    pub fn was_skipped(&self) -> bool {
        self.status == IngestStatus::Processed
            && self.decision.as_deref().is_some_and(|d| d.starts_with("skip"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// New row inserted as pending
    Started,
    /// Existing row reset to pending; carries the new attempt count
    Retrying(u32),
    /// Row exists and must not be processed again
    AlreadyRecorded(IngestStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub total: u64,
    pub pending: u64,
    pub processed: u64,
    pub errors: u64,
    pub ingested: u64,
    pub skipped: u64,
    pub last_activity: Option<String>,
}

/// Append-mostly record of per-message ingestion outcomes
pub struct IngestionLog {
    conn: Connection,
}

const ENTRY_COLUMNS: &str = "user_id, mailbox, uid_validity, uid, message_id, internal_date,
    from_addr, subject, status, decision, error, attachment_hashes, attempts, created_at, updated_at";

impl IngestionLog {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(crate::db::open(db_path)?))
    }

    /// Record that processing of a message is starting. Pending and
    /// processed rows are left alone unless `force` is set; error rows are
    /// always retried.
    pub fn begin(&self, entry: &NewEntry, force: bool) -> Result<BeginOutcome> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO email_ingestion_log
                (user_id, mailbox, uid_validity, uid, message_id, internal_date, from_addr,
                 subject, status, attachment_hashes, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', '[]', 1, ?9, ?9)",
            params![
                entry.key.user_id,
                entry.key.mailbox,
                entry.key.uid_validity,
                entry.uid,
                entry.message_id,
                entry.internal_date.map(|d| d.to_rfc3339()),
                entry.from,
                entry.subject,
                now,
            ],
        )?;
        if inserted == 1 {
            return Ok(BeginOutcome::Started);
        }

        let existing = self
            .get(&entry.key, entry.uid)?
            .context("ingestion log row vanished after insert conflict")?;
        if existing.status != IngestStatus::Error && !force {
            return Ok(BeginOutcome::AlreadyRecorded(existing.status));
        }

        self.conn.execute(
            "UPDATE email_ingestion_log
             SET status = 'pending', error = NULL, attempts = attempts + 1, updated_at = ?5
             WHERE user_id = ?1 AND mailbox = ?2 AND uid_validity = ?3 AND uid = ?4",
            params![
                entry.key.user_id,
                entry.key.mailbox,
                entry.key.uid_validity,
                entry.uid,
                now
            ],
        )?;
        Ok(BeginOutcome::Retrying(existing.attempts + 1))
    }

    pub fn mark_processed(
        &self,
        key: &MailboxKey,
        uid: u32,
        attachment_hashes: &[String],
        decision: &str,
    ) -> Result<()> {
        let hashes = serde_json::to_string(attachment_hashes)?;
        self.update_row(
            "UPDATE email_ingestion_log
             SET status = 'processed', attachment_hashes = ?5, decision = ?6, error = NULL,
                 updated_at = ?7
             WHERE user_id = ?1 AND mailbox = ?2 AND uid_validity = ?3 AND uid = ?4",
            key,
            uid,
            &hashes,
            decision,
        )
    }

    pub fn mark_error(&self, key: &MailboxKey, uid: u32, message: &str) -> Result<()> {
        self.update_row(
            "UPDATE email_ingestion_log
             SET status = 'error', error = ?5, decision = COALESCE(decision, ?6), updated_at = ?7
             WHERE user_id = ?1 AND mailbox = ?2 AND uid_validity = ?3 AND uid = ?4",
            key,
            uid,
            message,
            "error",
        )
    }

    fn update_row(&self, sql: &str, key: &MailboxKey, uid: u32, a: &str, b: &str) -> Result<()> {
        let changed = self.conn.execute(
            sql,
            params![
                key.user_id,
                key.mailbox,
                key.uid_validity,
                uid,
                a,
                b,
                Utc::now().to_rfc3339()
            ],
        )?;
        if changed == 0 {
            anyhow::bail!(
                "no ingestion log row for {}/{} uid {} (validity {})",
                key.user_id,
                key.mailbox,
                uid,
                key.uid_validity
            );
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn get(&self, key: &MailboxKey, uid: u32) -> Result<Option<LogEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM email_ingestion_log
             WHERE user_id = ?1 AND mailbox = ?2 AND uid_validity = ?3 AND uid = ?4"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![key.user_id, key.mailbox, key.uid_validity, uid],
                RawRow::from_row,
            )
            .optional()?;
        row.map(RawRow::into_entry).transpose()
    }

    /// Most recent rows for a user, newest first
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM email_ingestion_log
             WHERE user_id = ?1 ORDER BY updated_at DESC, uid DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], RawRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_entry).collect()
    }

    pub fn cursor_snapshot(
        &self,
        user_id: &str,
        mailbox: &str,
        max_attempts: Option<u32>,
    ) -> Result<CursorSnapshot> {
        let mut snapshot = CursorSnapshot::default();

        let mut stmt = self.conn.prepare(
            "SELECT uid_validity, MAX(uid) FROM email_ingestion_log
             WHERE user_id = ?1 AND mailbox = ?2 GROUP BY uid_validity",
        )?;
        let maxima = stmt.query_map(params![user_id, mailbox], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?))
        })?;
        for pair in maxima {
            let (validity, uid) = pair?;
            snapshot.last_uid.insert(validity, uid);
        }

        if let Some(max_attempts) = max_attempts {
            let mut stmt = self.conn.prepare(
                "SELECT uid_validity, uid FROM email_ingestion_log
                 WHERE user_id = ?1 AND mailbox = ?2 AND status = 'error' AND attempts < ?3
                 ORDER BY uid",
            )?;
            let failed = stmt.query_map(params![user_id, mailbox, max_attempts], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?))
            })?;
            for pair in failed {
                let (validity, uid) = pair?;
                snapshot.retry_uids.entry(validity).or_default().push(uid);
            }
        }

        Ok(snapshot)
    }

    pub fn summary(&self, user_id: &str) -> Result<LogSummary> {
        let summary = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'pending'), 0),
                    COALESCE(SUM(status = 'processed'), 0),
                    COALESCE(SUM(status = 'error'), 0),
                    COALESCE(SUM(status = 'processed' AND decision LIKE 'ingest%'), 0),
                    COALESCE(SUM(status = 'processed' AND decision LIKE 'skip%'), 0),
                    MAX(updated_at)
             FROM email_ingestion_log WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(LogSummary {
                    total: row.get::<_, i64>(0)? as u64,
                    pending: row.get::<_, i64>(1)? as u64,
                    processed: row.get::<_, i64>(2)? as u64,
                    errors: row.get::<_, i64>(3)? as u64,
                    ingested: row.get::<_, i64>(4)? as u64,
                    skipped: row.get::<_, i64>(5)? as u64,
                    last_activity: row.get(6)?,
                })
            },
        )?;
        Ok(summary)
    }
}

struct RawRow {
    user_id: String,
    mailbox: String,
    uid_validity: u32,
    uid: u32,
    message_id: Option<String>,
    internal_date: Option<String>,
    from: Option<String>,
    subject: Option<String>,
    status: String,
    decision: Option<String>,
    error: Option<String>,
    attachment_hashes: String,
    attempts: u32,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            user_id: row.get(0)?,
            mailbox: row.get(1)?,
            uid_validity: row.get(2)?,
            uid: row.get(3)?,
            message_id: row.get(4)?,
            internal_date: row.get(5)?,
            from: row.get(6)?,
            subject: row.get(7)?,
            status: row.get(8)?,
            decision: row.get(9)?,
            error: row.get(10)?,
            attachment_hashes: row.get(11)?,
            attempts: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            key: MailboxKey {
                user_id: self.user_id,
                mailbox: self.mailbox,
                uid_validity: self.uid_validity,
            },
            uid: self.uid,
            message_id: self.message_id,
            internal_date: self.internal_date.as_deref().map(parse_timestamp).transpose()?,
            from: self.from,
            subject: self.subject,
            status: IngestStatus::parse(&self.status)?,
            decision: self.decision,
            error: self.error,
            attachment_hashes: serde_json::from_str(&self.attachment_hashes)
                .context("corrupt attachment_hashes column")?,
            attempts: self.attempts,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp '{value}' in ingestion log"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> IngestionLog {
        IngestionLog::open(":memory:").unwrap()
    }

    fn key(validity: u32) -> MailboxKey {
        MailboxKey::new("user1", "INBOX", validity)
    }

    fn entry(validity: u32, uid: u32) -> NewEntry {
        NewEntry {
            key: key(validity),
            uid,
            message_id: Some(format!("msg-{uid}@example")),
            internal_date: None,
            from: Some("billing@power.example".to_string()),
            subject: Some("Invoice".to_string()),
        }
    }

    #[test]
    fn test_begin_is_idempotent() {
        let log = log();
        assert_eq!(log.begin(&entry(1, 5), false).unwrap(), BeginOutcome::Started);
        assert_eq!(
            log.begin(&entry(1, 5), false).unwrap(),
            BeginOutcome::AlreadyRecorded(IngestStatus::Pending)
        );

        log.mark_processed(&key(1), 5, &["abc".to_string()], "ingest: keyword")
            .unwrap();
        assert_eq!(
            log.begin(&entry(1, 5), false).unwrap(),
            BeginOutcome::AlreadyRecorded(IngestStatus::Processed)
        );

        let row = log.get(&key(1), 5).unwrap().unwrap();
        assert_eq!(row.status, IngestStatus::Processed);
        assert_eq!(row.attachment_hashes, vec!["abc".to_string()]);
        assert_eq!(row.attempts, 1);
    }

    #[test]
    fn test_errors_are_retried_and_force_reprocesses() {
        let log = log();
        log.begin(&entry(1, 8), false).unwrap();
        log.mark_error(&key(1), 8, "disk full").unwrap();

        let row = log.get(&key(1), 8).unwrap().unwrap();
        assert_eq!(row.status, IngestStatus::Error);
        assert_eq!(row.error.as_deref(), Some("disk full"));

        assert_eq!(log.begin(&entry(1, 8), false).unwrap(), BeginOutcome::Retrying(2));
        let row = log.get(&key(1), 8).unwrap().unwrap();
        assert_eq!(row.status, IngestStatus::Pending);
        assert_eq!(row.error, None);

        log.mark_processed(&key(1), 8, &[], "skip: no PDF attachment").unwrap();
        assert_eq!(log.begin(&entry(1, 8), true).unwrap(), BeginOutcome::Retrying(3));
    }

    #[test]
    fn test_mark_unknown_row_fails() {
        let log = log();
        assert!(log.mark_error(&key(1), 99, "boom").is_err());
    }

    #[test]
    fn test_cursor_snapshot() {
        let log = log();
        for uid in [3, 7, 5] {
            log.begin(&entry(100, uid), false).unwrap();
        }
        log.begin(&entry(200, 2), false).unwrap();
        log.mark_error(&key(100), 5, "parse").unwrap();

        let snapshot = log.cursor_snapshot("user1", "INBOX", Some(3)).unwrap();
        assert_eq!(snapshot.last_uid.get(&100), Some(&7));
        assert_eq!(snapshot.last_uid.get(&200), Some(&2));
        assert_eq!(snapshot.retry_uids.get(&100), Some(&vec![5]));

        // exhausted retry budget
        let snapshot = log.cursor_snapshot("user1", "INBOX", Some(1)).unwrap();
        assert!(snapshot.retry_uids.is_empty());

        let other = log.cursor_snapshot("user2", "INBOX", Some(3)).unwrap();
        assert_eq!(other, CursorSnapshot::default());
    }

    #[test]
    fn test_summary_and_recent() {
        let log = log();
        for uid in 1..=4 {
            log.begin(&entry(1, uid), false).unwrap();
        }
        log.mark_processed(&key(1), 1, &["h1".to_string()], "ingest: known vendor Power Co")
            .unwrap();
        log.mark_processed(&key(1), 2, &[], "skip: no PDF attachment").unwrap();
        log.mark_error(&key(1), 3, "boom").unwrap();

        let summary = log.summary("user1").unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.ingested, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.last_activity.is_some());

        let recent = log.recent("user1", 10).unwrap();
        assert_eq!(recent.len(), 4);
        let skipped: Vec<u32> = recent.iter().filter(|e| e.was_skipped()).map(|e| e.uid).collect();
        assert_eq!(skipped, vec![2]);
    }
}
