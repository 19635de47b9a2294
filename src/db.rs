use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// Open (and migrate) the SQLite database shared by the ingestion log and
/// the file index. `:memory:` is accepted for tests.
pub fn open(db_path: &str) -> Result<Connection> {
    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open ingestion database: {db_path}"))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS email_ingestion_log (
            user_id TEXT NOT NULL,
            mailbox TEXT NOT NULL,
            uid_validity INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            message_id TEXT,
            internal_date TEXT,
            from_addr TEXT,
            subject TEXT,
            status TEXT NOT NULL,
            decision TEXT,
            error TEXT,
            attachment_hashes TEXT NOT NULL DEFAULT '[]',
            attempts INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (user_id, mailbox, uid_validity, uid)
        );

        CREATE INDEX IF NOT EXISTS idx_ingestion_log_status
            ON email_ingestion_log (user_id, mailbox, status);

        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            path TEXT NOT NULL,
            mimetype TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            metadata TEXT NOT NULL,
            is_reviewed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_files_hash ON files (user_id, content_hash);",
    )
    .context("Failed to migrate ingestion database")?;
    Ok(())
}
