pub mod classifier;
pub mod config;
pub mod cursor;
pub mod db;
pub mod ingestion_log;
pub mod llm;
pub mod mailbox;
pub mod message;
pub mod service;
pub mod store;
pub mod triage;
pub mod vendors;

pub use classifier::{ClassificationPolicy, Decision, InvoiceClassifier, Tier};
pub use config::Config;
pub use cursor::{MailboxKey, PollMode};
pub use ingestion_log::{IngestStatus, IngestionLog};
pub use message::ParsedEmail;
pub use service::{IngestionService, RunReport};
pub use store::{FileIndex, FileStore};
pub use vendors::{Vendor, VendorMatcher};
