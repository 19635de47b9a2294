use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref SCRIPT_STYLE: Regex = Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap();
    static ref BLOCK_BREAK: Regex = Regex::new(r"(?i)<\s*(br|/p|/div|/tr|/li)[^>]*>").unwrap();
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
    static ref BLANK_RUNS: Regex = Regex::new(r"[ \t]+").unwrap();
    static ref EXTRA_NEWLINES: Regex = Regex::new(r"\n\s*\n+").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address: String,
    pub name: Option<String>,
}

impl Address {
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.address),
            _ => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn is_pdf(&self) -> bool {
        if self.content_type == "application/pdf" {
            return true;
        }
        // Some mailers label PDFs generically
        self.content_type == "application/octet-stream"
            && self
                .filename
                .as_deref()
                .is_some_and(|f| f.to_lowercase().ends_with(".pdf"))
    }

    pub fn sha256_hex(&self) -> String {
        sha256_hex(&self.content)
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Decoded view of a raw RFC 822 message
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl ParsedEmail {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        let parsed = mailparse::parse_mail(raw).context("failed to parse MIME message")?;
        let headers = parsed.headers.as_slice();

        let message_id = headers
            .get_first_value("Message-ID")
            .map(|v| normalize_message_id(&v))
            .filter(|v| !v.is_empty());
        let from = headers
            .get_first_value("From")
            .map(|v| parse_addresses(&v))
            .unwrap_or_default();
        let to = headers
            .get_first_value("To")
            .map(|v| parse_addresses(&v))
            .unwrap_or_default();
        let subject = headers
            .get_first_value("Subject")
            .map(|s| s.trim().to_string());
        let date = headers
            .get_first_value("Date")
            .and_then(|v| mailparse::dateparse(&v).ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        let mut parts = Parts::default();
        collect_parts(&parsed, &mut parts)?;

        Ok(ParsedEmail {
            message_id,
            from,
            to,
            subject,
            date,
            text: join_non_empty(parts.text),
            html: join_non_empty(parts.html),
            attachments: parts.attachments,
        })
    }

    pub fn has_pdf(&self) -> bool {
        self.attachments.iter().any(Attachment::is_pdf)
    }

    pub fn pdf_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_pdf())
    }

    pub fn from_address(&self) -> Option<&str> {
        self.from.first().map(|a| a.address.as_str())
    }

    pub fn from_text(&self) -> String {
        self.from.iter().map(Address::display).collect::<Vec<_>>().join(", ")
    }

    pub fn to_text(&self) -> String {
        self.to.iter().map(Address::display).collect::<Vec<_>>().join(", ")
    }

    /// Plain text body, falling back to the HTML body with markup removed
    pub fn body_text(&self) -> Option<String> {
        if let Some(text) = &self.text {
            return Some(text.clone());
        }
        self.html.as_deref().map(html_to_text).filter(|t| !t.is_empty())
    }
}

#[derive(Default)]
struct Parts {
    text: Vec<String>,
    html: Vec<String>,
    attachments: Vec<Attachment>,
}

fn collect_parts(part: &ParsedMail<'_>, out: &mut Parts) -> anyhow::Result<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, out)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let mime_type = part.ctype.mimetype.to_ascii_lowercase();
    let is_attachment =
        matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some();

    if is_attachment {
        let content = part
            .get_body_raw()
            .with_context(|| format!("failed to decode attachment {filename:?}"))?;
        out.attachments.push(Attachment {
            filename,
            content_type: mime_type,
            content,
        });
        return Ok(());
    }

    if mime_type == "text/plain" {
        if let Ok(body) = part.get_body() {
            out.text.push(body);
        }
    } else if mime_type == "text/html" {
        if let Ok(body) = part.get_body() {
            out.html.push(body);
        }
    }
    Ok(())
}

fn join_non_empty(parts: Vec<String>) -> Option<String> {
    let parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.replace("\r\n", "\n").trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn parse_addresses(header_value: &str) -> Vec<Address> {
    let Ok(list) = mailparse::addrparse(header_value) else {
        // Fall back to a bare "Name <addr>" scrape for malformed headers
        return scrape_address(header_value).into_iter().collect();
    };

    let mut addresses = Vec::new();
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => addresses.push(Address {
                address: info.addr.to_lowercase(),
                name: info.display_name.clone(),
            }),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    addresses.push(Address {
                        address: info.addr.to_lowercase(),
                        name: info.display_name.clone(),
                    });
                }
            }
        }
    }
    addresses
}

fn scrape_address(value: &str) -> Option<Address> {
    let (start, end) = (value.rfind('<')?, value.rfind('>')?);
    if end <= start + 1 {
        return None;
    }
    let name = value[..start].trim().trim_matches('"').trim();
    Some(Address {
        address: value[start + 1..end].trim().to_lowercase(),
        name: (!name.is_empty()).then(|| name.to_string()),
    })
}

pub fn normalize_message_id(value: &str) -> String {
    value.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string()
}

pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, "");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let text = BLANK_RUNS.replace_all(&text, " ");
    let text = EXTRA_NEWLINES.replace_all(&text, "\n\n");
    text.lines().map(str::trim).collect::<Vec<_>>().join("\n").trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_multipart_with_pdf() {
        let raw = invoice_with_pdf("billing@power.example", "Your invoice");
        let email = ParsedEmail::parse(&raw).unwrap();

        assert_eq!(email.message_id.as_deref(), Some("inv-42@billing.example"));
        assert_eq!(email.from_address(), Some("billing@power.example"));
        assert_eq!(email.from[0].name.as_deref(), Some("Billing Dept"));
        assert_eq!(email.to_text(), "ap@acme.example");
        assert_eq!(email.subject.as_deref(), Some("Your invoice"));
        assert_eq!(
            email.date.map(|d| d.to_rfc3339()),
            Some("2025-09-13T10:15:00+00:00".to_string())
        );
        assert_eq!(
            email.text.as_deref(),
            Some("Please find attached your monthly statement.")
        );

        assert_eq!(email.attachments.len(), 1);
        let pdf = &email.attachments[0];
        assert!(pdf.is_pdf());
        assert_eq!(pdf.filename.as_deref(), Some("invoice-42.pdf"));
        assert_eq!(pdf.content, b"%PDF-1.4 fake invoice");
        assert_eq!(pdf.sha256_hex(), PDF_SHA256);
        assert!(email.has_pdf());
    }

    #[test]
    fn test_encoded_subject_is_decoded() {
        let raw = plain("a@b.example", "=?UTF-8?B?SW52b2ljZSAjNDI=?=", "hi");
        let email = ParsedEmail::parse(&raw).unwrap();
        assert_eq!(email.subject.as_deref(), Some("Invoice #42"));
        assert!(!email.has_pdf());
    }

    #[test]
    fn test_missing_headers_are_none() {
        let raw = b"Content-Type: text/plain\r\n\r\nbody only\r\n";
        let email = ParsedEmail::parse(raw).unwrap();
        assert!(email.message_id.is_none());
        assert!(email.subject.is_none());
        assert!(email.date.is_none());
        assert!(email.from.is_empty());
        assert_eq!(email.body_text().as_deref(), Some("body only"));
    }

    #[test]
    fn test_unparseable_date_is_none() {
        let raw = b"Date: sometime last week\r\nSubject: x\r\n\r\nbody\r\n";
        let email = ParsedEmail::parse(raw).unwrap();
        assert!(email.date.is_none());
    }

    #[test]
    fn test_octet_stream_pdf_by_extension() {
        let attachment = Attachment {
            filename: Some("Statement.PDF".to_string()),
            content_type: "application/octet-stream".to_string(),
            content: vec![1, 2, 3],
        };
        assert!(attachment.is_pdf());

        let other = Attachment {
            filename: Some("photo.jpg".to_string()),
            content_type: "application/octet-stream".to_string(),
            content: vec![],
        };
        assert!(!other.is_pdf());
    }

    #[test]
    fn test_html_fallback_body() {
        let raw = b"From: a@b.example\r\n\
                    Content-Type: text/html; charset=utf-8\r\n\r\n\
                    <html><style>p{color:red}</style><body><p>Amount&nbsp;due: &lt;$40&gt;</p><p>Thanks &amp; bye</p></body></html>\r\n";
        let email = ParsedEmail::parse(raw).unwrap();
        assert!(email.text.is_none());
        let body = email.body_text().unwrap();
        assert!(body.contains("Amount due: <$40>"));
        assert!(body.contains("Thanks & bye"));
        assert!(!body.contains("color"));
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id(" <abc@x> "), "abc@x");
        assert_eq!(normalize_message_id("abc@x"), "abc@x");
    }

    #[test]
    fn test_scrape_address_fallback() {
        let addr = scrape_address("\"Acme Billing\" <AR@Acme.example>").unwrap();
        assert_eq!(addr.address, "ar@acme.example");
        assert_eq!(addr.name.as_deref(), Some("Acme Billing"));
        assert!(scrape_address("no brackets").is_none());
    }
}
