use crate::config::StorageSettings;
use crate::message::{sha256_hex, ParsedEmail};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

const MAX_FILENAME_CHARS: usize = 200;

/// Where a message came from in the mailbox
#[derive(Debug, Clone)]
pub struct EmailOrigin {
    pub mailbox: String,
    pub uid: u32,
    pub uid_validity: u32,
    pub internal_date: Option<DateTime<Utc>>,
}

/// One row of the `files` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    /// Relative to the user's upload directory
    pub path: String,
    pub mimetype: String,
    pub content_hash: String,
    pub metadata: Value,
    pub is_reviewed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Materialized {
    /// Records written by this call
    pub written: Vec<FileRecord>,
    /// Existing PDF records that matched by content hash
    pub reused: Vec<FileRecord>,
    /// SHA-256 of every PDF attachment, in message order
    pub attachment_hashes: Vec<String>,
}

pub struct FileIndex {
    conn: Connection,
}

const FILE_COLUMNS: &str =
    "id, user_id, filename, path, mimetype, content_hash, metadata, is_reviewed, created_at";

impl FileIndex {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(crate::db::open(db_path)?))
    }

    pub fn insert(&self, record: &FileRecord) -> Result<()> {
        self.conn
            .execute(
                &format!("INSERT INTO files ({FILE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    record.id,
                    record.user_id,
                    record.filename,
                    record.path,
                    record.mimetype,
                    record.content_hash,
                    record.metadata.to_string(),
                    record.is_reviewed,
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to index file {}", record.filename))?;
        Ok(())
    }

    pub fn find_by_hash(&self, user_id: &str, content_hash: &str) -> Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE user_id = ?1 AND content_hash = ?2
             ORDER BY created_at LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![user_id, content_hash], read_record)
            .optional()?
            .map(finish_record)
            .transpose()
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE user_id = ?1 ORDER BY created_at, filename");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_record).collect()
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to remove index row {id}"))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

struct RawFile {
    id: String,
    user_id: String,
    filename: String,
    path: String,
    mimetype: String,
    content_hash: String,
    metadata: String,
    is_reviewed: bool,
    created_at: String,
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFile> {
    Ok(RawFile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        path: row.get(3)?,
        mimetype: row.get(4)?,
        content_hash: row.get(5)?,
        metadata: row.get(6)?,
        is_reviewed: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn finish_record(raw: RawFile) -> Result<FileRecord> {
    let metadata = serde_json::from_str(&raw.metadata)
        .with_context(|| format!("corrupt metadata for file {}", raw.id))?;
    let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
        .with_context(|| format!("invalid created_at for file {}", raw.id))?
        .with_timezone(&Utc);
    Ok(FileRecord {
        id: raw.id,
        user_id: raw.user_id,
        filename: raw.filename,
        path: raw.path,
        mimetype: raw.mimetype,
        content_hash: raw.content_hash,
        metadata,
        is_reviewed: raw.is_reviewed,
        created_at,
    })
}

/// Per-user upload directory plus its metadata index
pub struct FileStore {
    upload_dir: PathBuf,
    dedupe: bool,
    index: FileIndex,
}

impl FileStore {
    pub fn new(settings: &StorageSettings, index: FileIndex) -> Self {
        Self {
            upload_dir: PathBuf::from(&settings.upload_dir),
            dedupe: settings.dedupe_attachments,
            index,
        }
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn user_dir(&self, user_id: &str) -> Result<PathBuf> {
        let segment = sanitize_user_id(user_id)?;
        Ok(self.upload_dir.join(segment))
    }

    /// Write the email body and every PDF attachment into the user's
    /// `unsorted` area and index them. On failure nothing written by this
    /// call is left behind.
    pub fn materialize(&self, user_id: &str, email: &ParsedEmail, origin: &EmailOrigin) -> Result<Materialized> {
        let user_dir = self.user_dir(user_id)?;
        let mut out = Materialized::default();
        match self.write_all(user_id, &user_dir, email, origin, &mut out) {
            Ok(()) => Ok(out),
            Err(e) => {
                self.roll_back(&user_dir, &out.written);
                Err(e)
            }
        }
    }

    /// Remove files written by an ingest whose outcome could not be recorded
    pub fn discard(&self, user_id: &str, written: &[FileRecord]) -> Result<()> {
        let user_dir = self.user_dir(user_id)?;
        self.roll_back(&user_dir, written);
        Ok(())
    }

    fn roll_back(&self, user_dir: &Path, written: &[FileRecord]) {
        for record in written {
            log::warn!("Rolling back {} ({})", record.filename, record.id);
            if let Ok(target) = safe_join(user_dir, &record.path) {
                if let Err(e) = std::fs::remove_file(&target) {
                    log::error!("Failed to remove {}: {e}", target.display());
                }
            }
            if let Err(e) = self.index.delete(&record.id) {
                log::error!("{e:#}");
            }
        }
    }

    fn write_all(
        &self,
        user_id: &str,
        user_dir: &Path,
        email: &ParsedEmail,
        origin: &EmailOrigin,
        out: &mut Materialized,
    ) -> Result<()> {
        let received = origin.internal_date.or(email.date).unwrap_or_else(Utc::now);

        let parent = match email.body_text() {
            Some(body) => {
                let record = self.write_email_text(user_id, user_dir, email, origin, received, &body)?;
                let id = record.id.clone();
                out.written.push(record);
                Some(id)
            }
            None => None,
        };

        for (n, attachment) in email.pdf_attachments().enumerate() {
            let hash = attachment.sha256_hex();
            out.attachment_hashes.push(hash.clone());

            if self.dedupe {
                if let Some(existing) = self.index.find_by_hash(user_id, &hash)? {
                    log::info!(
                        "PDF {} already stored as {} ({}), not writing again",
                        attachment.filename.as_deref().unwrap_or("(unnamed)"),
                        existing.filename,
                        existing.id
                    );
                    out.reused.push(existing);
                    continue;
                }
            }

            let filename = attachment
                .filename
                .as_deref()
                .and_then(sanitize_filename)
                .unwrap_or_else(|| match n {
                    0 => format!("invoice_{}.pdf", origin.uid),
                    _ => format!("invoice_{}_{}.pdf", origin.uid, n + 1),
                });

            let mut metadata = base_metadata(email, origin, received, attachment.content.len());
            metadata.insert("attachmentHash".into(), json!(hash));
            if let Some(original) = &attachment.filename {
                metadata.insert("originalFilename".into(), json!(original));
            }
            if let Some(parent) = &parent {
                metadata.insert("parentEmailFileId".into(), json!(parent));
            }

            let record = self.write_file(
                user_id,
                user_dir,
                filename,
                "pdf",
                "application/pdf",
                &attachment.content,
                hash,
                Value::Object(metadata),
            )?;
            out.written.push(record);
        }

        Ok(())
    }

    fn write_email_text(
        &self,
        user_id: &str,
        user_dir: &Path,
        email: &ParsedEmail,
        origin: &EmailOrigin,
        received: DateTime<Utc>,
        body: &str,
    ) -> Result<FileRecord> {
        let content = render_email_text(email, received, body);
        let hash = sha256_hex(content.as_bytes());

        let local = email
            .from_address()
            .and_then(|a| a.split('@').next())
            .and_then(sanitize_filename)
            .unwrap_or_else(|| "unknown".to_string());
        let filename = format!("email_{local}_{}.txt", received.format("%Y%m%d%H%M%S"));

        let mut metadata = base_metadata(email, origin, received, content.len());
        metadata.insert("contentHash".into(), json!(hash));

        self.write_file(
            user_id,
            user_dir,
            filename,
            "txt",
            "text/plain",
            content.as_bytes(),
            hash,
            Value::Object(metadata),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn write_file(
        &self,
        user_id: &str,
        user_dir: &Path,
        filename: String,
        extension: &str,
        mimetype: &str,
        content: &[u8],
        content_hash: String,
        metadata: Value,
    ) -> Result<FileRecord> {
        let id = Uuid::new_v4().simple().to_string();
        let relative = format!("unsorted/{}/{}/{id}.{extension}", &id[0..2], &id[2..4]);
        let target = safe_join(user_dir, &relative)?;

        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create upload directory: {}", dir.display()))?;
        }
        std::fs::write(&target, content)
            .with_context(|| format!("Failed to write {}", target.display()))?;

        let record = FileRecord {
            id,
            user_id: user_id.to_string(),
            filename,
            path: relative,
            mimetype: mimetype.to_string(),
            content_hash,
            metadata,
            is_reviewed: false,
            created_at: Utc::now(),
        };
        if let Err(e) = self.index.insert(&record) {
            // keep disk and index consistent
            let _ = std::fs::remove_file(&target);
            return Err(e);
        }

        log::info!("Stored {} ({} bytes) as {}", record.filename, content.len(), record.path);
        Ok(record)
    }
}

fn base_metadata(email: &ParsedEmail, origin: &EmailOrigin, received: DateTime<Utc>, size: usize) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("source".into(), json!("email"));
    metadata.insert("from".into(), json!(email.from_text()));
    metadata.insert("subject".into(), json!(email.subject.clone().unwrap_or_default()));
    metadata.insert("receivedDate".into(), json!(received.to_rfc3339()));
    metadata.insert("size".into(), json!(size));
    metadata.insert("emailUid".into(), json!(origin.uid));
    // UIDVALIDITY can exceed what JavaScript consumers represent safely
    metadata.insert("emailUidValidity".into(), json!(origin.uid_validity.to_string()));
    metadata.insert("emailMailbox".into(), json!(origin.mailbox));
    metadata.insert("messageId".into(), json!(email.message_id));
    metadata
}

fn render_email_text(email: &ParsedEmail, received: DateTime<Utc>, body: &str) -> String {
    let date = email.date.unwrap_or(received);
    format!(
        "From: {}\nTo: {}\nSubject: {}\nDate: {}\nMessage-ID: {}\n\n--- Email Content ---\n\n{}\n",
        email.from_text(),
        email.to_text(),
        email.subject.as_deref().unwrap_or(""),
        date.to_rfc2822(),
        email.message_id.as_deref().unwrap_or(""),
        body.trim_end()
    )
}

/// Join `relative` onto `base`, refusing anything that could escape it
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let mut joined = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("Refusing unsafe upload path: {relative}")
            }
        }
    }
    if joined == base {
        bail!("Empty upload path");
    }
    Ok(joined)
}

/// Reduce an attachment name to a single safe path segment
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim().to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn sanitize_user_id(user_id: &str) -> Result<String> {
    let segment: String = user_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if segment.is_empty() || segment.chars().all(|c| c == '.') {
        bail!("Invalid user id for upload directory: '{user_id}'");
    }
    Ok(segment)
}
