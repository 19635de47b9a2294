use crate::ingestion_log::LogEntry;
use serde::Serialize;

const REPLY_PREFIXES: &[&str] = &["re:", "fwd:", "fw:"];
const BILLING_SENDER_HINTS: &[&str] = &["billing", "invoice", "accounting", "noreply"];
const BILLING_SUBJECT_HINTS: &[&str] = &["invoice", "bill", "payment", "receipt"];

/// Advice on whether a skipped message deserves a manual re-ingest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub should_process: bool,
    pub reason: String,
    pub confidence: f32,
}

impl Recommendation {
    fn new(should_process: bool, reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            should_process,
            reason: reason.into(),
            confidence,
        }
    }
}

/// Cheap rule-based second opinion on a logged message. First matching
/// rule wins.
pub fn recommend(entry: &LogEntry, known_vendors: &[String]) -> Recommendation {
    let subject = entry.subject.as_deref().unwrap_or("").trim().to_lowercase();
    let from = entry.from.as_deref().unwrap_or("").to_lowercase();
    let attachments = entry.attachment_hashes.len();

    if REPLY_PREFIXES.iter().any(|p| subject.starts_with(p)) {
        return Recommendation::new(false, "Reply or forwarded email", 0.9);
    }
    if attachments > 0 {
        return Recommendation::new(
            true,
            format!("Has {attachments} PDF attachment(s), likely an invoice"),
            0.8,
        );
    }
    if BILLING_SENDER_HINTS.iter().any(|h| from.contains(h)) {
        return Recommendation::new(true, "Sent from a billing address", 0.7);
    }
    if BILLING_SUBJECT_HINTS.iter().any(|h| subject.contains(h)) {
        return Recommendation::new(true, "Subject mentions billing", 0.7);
    }
    if subject.contains("newsletter") || subject.contains("unsubscribe") || from.contains("newsletter") {
        return Recommendation::new(false, "Newsletter or promotional email", 0.8);
    }
    let vendor_hit = known_vendors
        .iter()
        .map(|v| v.to_lowercase())
        .filter(|v| !v.is_empty())
        .any(|v| from.contains(&v) || subject.contains(&v));
    if vendor_hit {
        return Recommendation::new(true, "Mentions a known vendor", 0.9);
    }

    Recommendation::new(false, "No clear indicators", 0.5)
}
