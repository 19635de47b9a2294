use crate::message::ParsedEmail;
use serde::{Deserialize, Serialize};

/// A known biller. Matching uses the sender and subject fields only; the
/// remaining fields ride along for downstream bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vendor {
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub from_emails: Vec<String>,
    #[serde(default)]
    pub from_domains: Vec<String>,
    #[serde(default)]
    pub subject_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_category_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Vendor {
    pub fn named(name: &str) -> Self {
        Vendor {
            name: name.to_string(),
            is_active: true,
            from_emails: Vec::new(),
            from_domains: Vec::new(),
            subject_keywords: Vec::new(),
            payment_method: None,
            default_category_code: None,
            notes: None,
        }
    }
}

/// Extract the domain part of an email address, lowercased
pub fn extract_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|d| !d.is_empty())
}

/// Matches incoming mail against the user's vendor allowlist
#[derive(Debug, Clone, Default)]
pub struct VendorMatcher {
    vendors: Vec<Vendor>,
}

impl VendorMatcher {
    pub fn new(vendors: Vec<Vendor>) -> Self {
        Self { vendors }
    }

    pub fn vendors(&self) -> &[Vendor] {
        &self.vendors
    }

    pub fn active_names(&self) -> Vec<String> {
        self.vendors
            .iter()
            .filter(|v| v.is_active)
            .map(|v| v.name.clone())
            .collect()
    }

    /// First active vendor whose sender address, sender domain or subject
    /// keyword matches the message.
    pub fn match_email(&self, email: &ParsedEmail) -> Option<&Vendor> {
        let from_addrs: Vec<String> = email
            .from
            .iter()
            .map(|a| a.address.to_lowercase())
            .collect();
        let domains: Vec<String> = from_addrs.iter().filter_map(|a| extract_domain(a)).collect();
        let subject = email.subject.as_deref().unwrap_or_default().to_lowercase();

        self.vendors
            .iter()
            .filter(|v| v.is_active)
            .find(|v| Self::vendor_matches(v, &from_addrs, &domains, &subject))
    }

    fn vendor_matches(vendor: &Vendor, from_addrs: &[String], domains: &[String], subject: &str) -> bool {
        if vendor
            .from_emails
            .iter()
            .any(|e| from_addrs.contains(&e.trim().to_lowercase()))
        {
            log::debug!("Vendor '{}' matched on sender address", vendor.name);
            return true;
        }

        if vendor
            .from_domains
            .iter()
            .any(|d| domains.contains(&d.trim().trim_start_matches('@').to_lowercase()))
        {
            log::debug!("Vendor '{}' matched on sender domain", vendor.name);
            return true;
        }

        if vendor.subject_keywords.iter().any(|k| {
            let k = k.trim().to_lowercase();
            !k.is_empty() && subject.contains(&k)
        }) {
            log::debug!("Vendor '{}' matched on subject keyword", vendor.name);
            return true;
        }

        false
    }
}
