use crate::config::ClassificationSettings;
use crate::llm::OpenAiClassifier;
use crate::message::ParsedEmail;
use crate::vendors::VendorMatcher;
use anyhow::{Context, Result};
use regex::Regex;
use std::fmt;
use std::future::Future;

/// Which tier of the policy accepted a message
#[derive(Debug, Clone, PartialEq)]
pub enum Tier {
    KnownVendor(String),
    Keyword(String),
    Llm { confidence: f32 },
    /// Operator asked for the message explicitly
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ingest { tier: Tier, reason: String },
    Skip { reason: String },
}

impl Decision {
    pub fn should_ingest(&self) -> bool {
        matches!(self, Decision::Ingest { .. })
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Decision::Skip {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::Ingest { reason, .. } | Decision::Skip { reason } => reason,
        }
    }
}

/// Rendered as the `decision` column of the ingestion log
impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Ingest { reason, .. } => write!(f, "ingest: {reason}"),
            Decision::Skip { reason } => write!(f, "skip: {reason}"),
        }
    }
}

/// The fields an LLM sees when asked about a message
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationPrompt {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
}

/// Subjects shorter than this get a body snippet attached
const SHORT_SUBJECT_CHARS: usize = 8;

impl ClassificationPrompt {
    pub fn from_email(email: &ParsedEmail, snippet_chars: usize) -> Self {
        let subject = email.subject.clone().unwrap_or_default();
        let snippet = if subject.chars().count() < SHORT_SUBJECT_CHARS {
            email
                .body_text()
                .map(|body| body.chars().take(snippet_chars).collect())
                .unwrap_or_default()
        } else {
            String::new()
        };
        Self {
            from: email.from_text(),
            to: email.to_text(),
            subject,
            snippet,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "from: {}\nto: {}\nsubject: {}\nsnippet: {}",
            self.from, self.to, self.subject, self.snippet
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LlmVerdict {
    pub is_invoice: bool,
    pub confidence: f32,
}

/// Third-tier classifier, normally an LLM
pub trait InvoiceClassifier {
    fn classify(&self, prompt: &ClassificationPrompt) -> impl Future<Output = Result<LlmVerdict>>;
}

/// Known vendor → keyword heuristic → LLM
pub struct ClassificationPolicy<C = OpenAiClassifier> {
    vendors: VendorMatcher,
    keywords: Option<Regex>,
    require_pdf: bool,
    llm: Option<C>,
    min_confidence: f32,
    snippet_chars: usize,
}

impl ClassificationPolicy<OpenAiClassifier> {
    /// Production policy: the LLM tier is wired up only when it has an API key
    pub fn from_settings(settings: &ClassificationSettings, vendors: VendorMatcher) -> Result<Self> {
        let llm = if settings.llm.is_usable() {
            Some(OpenAiClassifier::new(&settings.llm)?)
        } else {
            if settings.llm.enabled {
                log::info!("LLM classification enabled but no API key configured; tier disabled");
            }
            None
        };
        Self::new(settings, vendors, llm)
    }
}

impl<C: InvoiceClassifier> ClassificationPolicy<C> {
    pub fn new(settings: &ClassificationSettings, vendors: VendorMatcher, llm: Option<C>) -> Result<Self> {
        Ok(Self {
            vendors,
            keywords: compile_keywords(&settings.keywords)?,
            require_pdf: settings.require_pdf,
            llm,
            min_confidence: settings.llm.min_confidence,
            snippet_chars: settings.llm.snippet_chars,
        })
    }

    pub fn vendors(&self) -> &VendorMatcher {
        &self.vendors
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn decide(&self, email: &ParsedEmail) -> Decision {
        let has_pdf = email.has_pdf();

        if let Some(vendor) = self.vendors.match_email(email) {
            if has_pdf || !self.require_pdf {
                return Decision::Ingest {
                    tier: Tier::KnownVendor(vendor.name.clone()),
                    reason: format!("known vendor {}", vendor.name),
                };
            }
            return Decision::skip(format!("known vendor {} but no PDF attachment", vendor.name));
        }

        if self.require_pdf && !has_pdf {
            return Decision::skip("no PDF attachment");
        }

        if let Some(keyword) = self.keyword_hit(email) {
            return Decision::Ingest {
                reason: format!("invoice keyword '{keyword}'"),
                tier: Tier::Keyword(keyword),
            };
        }

        let Some(llm) = &self.llm else {
            return Decision::skip("no invoice indicators");
        };

        let prompt = ClassificationPrompt::from_email(email, self.snippet_chars);
        match llm.classify(&prompt).await {
            Ok(verdict) if verdict.is_invoice && verdict.confidence >= self.min_confidence => {
                Decision::Ingest {
                    tier: Tier::Llm {
                        confidence: verdict.confidence,
                    },
                    reason: format!("LLM classified as invoice ({:.0}%)", verdict.confidence * 100.0),
                }
            }
            Ok(verdict) => Decision::skip(format!(
                "LLM not confident it is an invoice (is_invoice={}, {:.0}%)",
                verdict.is_invoice,
                verdict.confidence * 100.0
            )),
            Err(e) => {
                log::warn!("LLM classification failed, treating as not an invoice: {e:#}");
                Decision::skip("LLM classification unavailable")
            }
        }
    }

    /// First invoice keyword found in the subject, text or HTML body
    pub fn keyword_hit(&self, email: &ParsedEmail) -> Option<String> {
        let regex = self.keywords.as_ref()?;
        [email.subject.as_deref(), email.text.as_deref(), email.html.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|field| regex.find(field))
            .map(|m| m.as_str().to_lowercase())
    }
}

/// Keywords match at the start of a word, so "bill" also catches "billing"
/// but "due" does not fire inside "residue".
fn compile_keywords(keywords: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)\b(?:{})", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .context("failed to compile invoice keyword pattern")
}


#[cfg(test)]
mod tests {
    use super::testing::FakeClassifier;
    use super::*;
    use crate::message::fixtures;
    use crate::vendors::Vendor;

    fn vendors() -> VendorMatcher {
        let mut power = Vendor::named("Power Co");
        power.from_domains = vec!["power.example".to_string()];
        VendorMatcher::new(vec![power])
    }

    fn build(llm: Option<FakeClassifier>) -> ClassificationPolicy<FakeClassifier> {
        ClassificationPolicy::new(&ClassificationSettings::default(), vendors(), llm).unwrap()
    }

    fn parse(raw: Vec<u8>) -> ParsedEmail {
        ParsedEmail::parse(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_known_vendor_with_pdf_is_ingested() {
        let policy = build(Some(FakeClassifier::answering(false, 0.0)));
        let email = parse(fixtures::invoice_with_pdf("noreply@power.example", "March"));
        let decision = policy.decide(&email).await;
        assert_eq!(
            decision,
            Decision::Ingest {
                tier: Tier::KnownVendor("Power Co".to_string()),
                reason: "known vendor Power Co".to_string(),
            }
        );
        assert_eq!(decision.to_string(), "ingest: known vendor Power Co");
    }

    #[tokio::test]
    async fn test_known_vendor_without_pdf_is_skipped() {
        let policy = build(None);
        let email = parse(fixtures::plain("noreply@power.example", "Your bill", "see portal"));
        let decision = policy.decide(&email).await;
        assert!(!decision.should_ingest());
        assert!(decision.reason().contains("no PDF"));
    }

    #[tokio::test]
    async fn test_known_vendor_without_pdf_when_pdf_optional() {
        let mut settings = ClassificationSettings::default();
        settings.require_pdf = false;
        let policy: ClassificationPolicy<FakeClassifier> =
            ClassificationPolicy::new(&settings, vendors(), None).unwrap();
        let email = parse(fixtures::plain("noreply@power.example", "Hello", "body"));
        assert!(policy.decide(&email).await.should_ingest());
    }

    #[tokio::test]
    async fn test_no_pdf_never_reaches_llm() {
        let llm = FakeClassifier::answering(true, 0.99);
        let policy = build(Some(llm));
        let email = parse(fixtures::plain("a@unknown.example", "Invoice 12", "total due"));
        assert_eq!(policy.decide(&email).await, Decision::skip("no PDF attachment"));
        assert_eq!(policy.llm.as_ref().unwrap().call_count(), 0);
    }

    #[tokio::test]
    async fn test_keyword_tier() {
        let policy = build(Some(FakeClassifier::answering(false, 0.0)));
        let email = parse(fixtures::invoice_with_pdf("ar@unknown.example", "Invoice #42"));
        match policy.decide(&email).await {
            Decision::Ingest {
                tier: Tier::Keyword(keyword),
                ..
            } => assert_eq!(keyword, "invoice"),
            other => panic!("expected keyword ingest, got {other:?}"),
        }
        assert_eq!(policy.llm.as_ref().unwrap().call_count(), 0);
    }

    #[test]
    fn test_keywords_match_word_starts_only() {
        let policy = build(None);
        let mut email = ParsedEmail {
            subject: Some("Residue report".to_string()),
            ..Default::default()
        };
        assert_eq!(policy.keyword_hit(&email), None);

        email.text = Some("Your BILLING summary".to_string());
        assert_eq!(policy.keyword_hit(&email), Some("bill".to_string()));
    }

    fn pdf_without_keywords() -> ParsedEmail {
        let mut email = parse(fixtures::invoice_with_pdf("ar@unknown.example", "Hi"));
        email.text = Some("See attached.".to_string());
        email
    }

    #[tokio::test]
    async fn test_llm_tier_confident() {
        let policy = build(Some(FakeClassifier::answering(true, 0.82)));
        let decision = policy.decide(&pdf_without_keywords()).await;
        assert_eq!(
            decision,
            Decision::Ingest {
                tier: Tier::Llm { confidence: 0.82 },
                reason: "LLM classified as invoice (82%)".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_llm_tier_below_threshold_and_failure() {
        let policy = build(Some(FakeClassifier::answering(true, 0.4)));
        assert!(!policy.decide(&pdf_without_keywords()).await.should_ingest());

        let policy = build(Some(FakeClassifier::failing()));
        let decision = policy.decide(&pdf_without_keywords()).await;
        assert_eq!(decision, Decision::skip("LLM classification unavailable"));
    }

    #[tokio::test]
    async fn test_without_llm_falls_through_to_skip() {
        let policy = build(None);
        let decision = policy.decide(&pdf_without_keywords()).await;
        assert_eq!(decision.to_string(), "skip: no invoice indicators");
    }

    #[test]
    fn test_prompt_snippet_only_for_short_subjects() {
        let mut email = pdf_without_keywords();
        email.text = Some("x".repeat(500));
        let prompt = ClassificationPrompt::from_email(&email, 240);
        assert_eq!(prompt.snippet.len(), 240);
        assert_eq!(prompt.from, "Billing Dept <ar@unknown.example>");

        email.subject = Some("Quarterly service charges".to_string());
        let prompt = ClassificationPrompt::from_email(&email, 240);
        assert!(prompt.snippet.is_empty());
        assert!(prompt.render().contains("subject: Quarterly service charges"));
    }
}
