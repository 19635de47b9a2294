use crate::vendors::Vendor;
use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Owner of everything this instance ingests (log rows, upload directory)
    pub user_id: String,
    pub imap: ImapSettings,
    pub polling_interval_seconds: u64,
    /// Upper bound on messages fetched per poll cycle
    pub batch_size: usize,
    /// Messages older than this date are recorded but never ingested
    pub first_email_date: Option<NaiveDate>,
    pub database_path: String,
    pub storage: StorageSettings,
    pub classification: ClassificationSettings,
    pub vendors: Vec<Vendor>,
    /// Optional YAML file holding additional vendors
    pub vendors_file: Option<String>,
    pub retry_failed: bool,
    pub max_attempts: u32,
    /// How long the daemon waits for an in-flight cycle on shutdown
    pub shutdown_grace_seconds: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, STARTTLS otherwise
    pub tls: bool,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    /// Connect, read and write deadline for the IMAP socket
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub upload_dir: String,
    pub dedupe_attachments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSettings {
    /// Only messages carrying a PDF attachment can be ingested
    pub require_pdf: bool,
    pub keywords: Vec<String>,
    pub llm: LlmSettings,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub min_confidence: f32,
    pub timeout_seconds: u64,
    /// Body characters sent along when the subject is too short to judge
    pub snippet_chars: usize,
}

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "invoice", "bill", "payment", "receipt", "statement", "due", "amount", "total", "tax",
    "vendor", "supplier",
];

impl Default for Config {
    fn default() -> Self {
        Config {
            user_id: "default".to_string(),
            imap: ImapSettings::default(),
            polling_interval_seconds: 300,
            batch_size: 50,
            first_email_date: None,
            database_path: "/var/lib/bill-ingest/ingest.db".to_string(),
            storage: StorageSettings::default(),
            classification: ClassificationSettings::default(),
            vendors: Vec::new(),
            vendors_file: None,
            retry_failed: true,
            max_attempts: 3,
            shutdown_grace_seconds: 30,
        }
    }
}

impl Default for ImapSettings {
    fn default() -> Self {
        ImapSettings {
            host: "localhost".to_string(),
            port: 993,
            tls: true,
            username: String::new(),
            password: String::new(),
            mailbox: "INBOX".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            upload_dir: "./uploads".to_string(),
            dedupe_attachments: true,
        }
    }
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        ClassificationSettings {
            require_pdf: true,
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            llm: LlmSettings::default(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        LlmSettings {
            enabled: true,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1/".to_string(),
            min_confidence: 0.6,
            timeout_seconds: 30,
            snippet_chars: 240,
        }
    }
}

impl LlmSettings {
    /// The LLM tier only runs when it is enabled and has a key to call with
    pub fn is_usable(&self) -> bool {
        self.enabled && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("mailbox", &self.mailbox)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("min_confidence", &self.min_confidence)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("snippet_chars", &self.snippet_chars)
            .finish()
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` if it exists, fall back to defaults otherwise, then
    /// layer environment overrides and the external vendor list on top.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with<F>(path: &str, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if Path::new(path).exists() {
            Config::from_file(path)?
        } else {
            log::warn!("Configuration file '{path}' not found, using default configuration");
            Config::default()
        };

        config.apply_env(lookup);
        config.load_vendors_file()?;
        Ok(config)
    }

    /// Apply environment overrides. `EMAIL_INGESTION_*` names win over the
    /// shorter `IMAP_*` aliases.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, alias: &str| {
            lookup(primary)
                .filter(|v| !v.is_empty())
                .or_else(|| lookup(alias).filter(|v| !v.is_empty()))
        };

        if let Some(host) = get("EMAIL_INGESTION_HOST", "IMAP_HOST") {
            self.imap.host = host;
        }
        if let Some(port) = get("EMAIL_INGESTION_PORT", "IMAP_PORT") {
            match port.parse() {
                Ok(port) => self.imap.port = port,
                Err(_) => log::warn!("Ignoring invalid IMAP port from environment: {port}"),
            }
        }
        if let Some(secure) = get("EMAIL_INGESTION_SECURE", "IMAP_SECURE") {
            self.imap.tls = secure.eq_ignore_ascii_case("true");
        }
        if let Some(user) = get("EMAIL_INGESTION_USER", "IMAP_USER") {
            self.imap.username = user;
        }
        if let Some(pass) = get("EMAIL_INGESTION_PASSWORD", "IMAP_PASS") {
            self.imap.password = pass;
        }
        if let Some(mailbox) = get("EMAIL_INGESTION_MAILBOX", "IMAP_MAILBOX") {
            self.imap.mailbox = mailbox;
        }
        if let Some(interval) = get(
            "EMAIL_INGESTION_POLLING_INTERVAL",
            "IMAP_POLLING_INTERVAL",
        ) {
            // milliseconds in the environment, seconds in the file
            match interval.parse::<u64>() {
                Ok(ms) => self.polling_interval_seconds = (ms / 1000).max(1),
                Err(_) => log::warn!("Ignoring invalid polling interval: {interval}"),
            }
        }
        if let Some(date) = lookup("EMAIL_INGESTION_FIRST_EMAIL_DATE").filter(|v| !v.is_empty()) {
            match NaiveDate::parse_from_str(&date, "%Y-%m-%d") {
                Ok(date) => self.first_email_date = Some(date),
                Err(e) => log::warn!("Ignoring invalid first email date '{date}': {e}"),
            }
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()) {
            self.classification.llm.api_key = Some(key);
        }
        if let Some(model) = lookup("OPENAI_MODEL_NAME").filter(|v| !v.is_empty()) {
            self.classification.llm.model = model;
        }
        if let Some(dir) = get("UPLOAD_PATH", "UPLOADS_DIR") {
            self.storage.upload_dir = dir;
        }
        if let Some(user_id) = lookup("INGEST_USER_ID").filter(|v| !v.is_empty()) {
            self.user_id = user_id;
        }
    }

    fn load_vendors_file(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.vendors_file.clone() else {
            return Ok(());
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read vendors file: {path}"))?;
        let vendors: Vec<Vendor> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse vendors file: {path}"))?;
        log::info!("Loaded {} vendors from {path}", vendors.len());
        self.vendors.extend(vendors);
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.user_id.trim().is_empty() {
            bail!("user_id must not be empty");
        }
        if self.imap.host.trim().is_empty() {
            bail!("imap.host must not be empty");
        }
        if self.imap.port == 0 {
            bail!("imap.port must be non-zero");
        }
        if self.imap.username.trim().is_empty() {
            bail!("imap.username must be set (or EMAIL_INGESTION_USER)");
        }
        if self.imap.timeout_seconds == 0 {
            bail!("imap.timeout_seconds must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        let confidence = self.classification.llm.min_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            bail!("classification.llm.min_confidence must be within 0..1, got {confidence}");
        }
        if self.classification.keywords.iter().any(|k| k.trim().is_empty()) {
            bail!("classification.keywords must not contain empty entries");
        }
        for vendor in &self.vendors {
            if vendor.from_emails.is_empty()
                && vendor.from_domains.is_empty()
                && vendor.subject_keywords.is_empty()
            {
                bail!(
                    "vendor '{}' has no from_emails, from_domains or subject_keywords",
                    vendor.name
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.imap.username = "bills@example.com".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.imap.port, 993);
        assert!(config.imap.tls);
        assert_eq!(config.imap.mailbox, "INBOX");
        assert_eq!(config.polling_interval_seconds, 300);
        assert!(config.classification.require_pdf);
        assert_eq!(config.classification.keywords.len(), DEFAULT_KEYWORDS.len());
        assert!((config.classification.llm.min_confidence - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
user_id: acme
imap:
  host: imap.example.com
  username: ap@example.com
first_email_date: 2025-01-15
vendors:
  - name: Power Co
    from_domains: [power.example]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.user_id, "acme");
        assert_eq!(config.imap.host, "imap.example.com");
        assert_eq!(config.imap.port, 993);
        assert_eq!(
            config.first_email_date,
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
        assert_eq!(config.vendors.len(), 1);
        assert!(config.vendors[0].is_active);
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_env_overrides_prefer_primary_names() {
        let env: HashMap<&str, &str> = [
            ("EMAIL_INGESTION_HOST", "mail.primary.example"),
            ("IMAP_HOST", "mail.alias.example"),
            ("IMAP_USER", "alias-user"),
            ("IMAP_PASS", "secret"),
            ("EMAIL_INGESTION_SECURE", "false"),
            ("EMAIL_INGESTION_POLLING_INTERVAL", "60000"),
            ("EMAIL_INGESTION_FIRST_EMAIL_DATE", "2025-03-01"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.imap.host, "mail.primary.example");
        assert_eq!(config.imap.username, "alias-user");
        assert_eq!(config.imap.password, "secret");
        assert!(!config.imap.tls);
        assert_eq!(config.polling_interval_seconds, 60);
        assert_eq!(config.first_email_date, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert!(config.classification.llm.is_usable());
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "EMAIL_INGESTION_PORT" => Some("not-a-port".to_string()),
            "EMAIL_INGESTION_FIRST_EMAIL_DATE" => Some("yesterday".to_string()),
            _ => None,
        });
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.first_email_date, None);
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());
        assert!(Config::default().validate().is_err());

        let mut config = valid_config();
        config.classification.llm.min_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.vendors.push(Vendor::named("Empty"));
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.classification.keywords.push("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = valid_config();
        config.imap.password = "hunter2".to_string();
        config.classification.llm.api_key = Some("sk-live-123".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("sk-live-123"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let path = path.to_str().unwrap();

        let mut config = valid_config();
        config.batch_size = 7;
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.batch_size, 7);
        assert_eq!(loaded.imap.username, "bills@example.com");
    }

    #[test]
    fn test_load_merges_vendors_file() {
        let dir = tempfile::tempdir().unwrap();
        let vendors_path = dir.path().join("vendors.yaml");
        std::fs::write(
            &vendors_path,
            "- name: Water Board\n  from_domains: [water.example]\n- name: Phone Co\n  from_emails: [bills@phone.example]\n",
        )
        .unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            format!(
                "imap:\n  username: ap@example.com\nvendors:\n  - name: Power Co\n    from_domains: [power.example]\nvendors_file: {}\n",
                vendors_path.display()
            ),
        )
        .unwrap();

        let config = Config::load_with(config_path.to_str().unwrap(), |key| match key {
            "IMAP_MAILBOX" => Some("Bills".to_string()),
            _ => None,
        })
        .unwrap();
        let names: Vec<&str> = config.vendors.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["Power Co", "Water Board", "Phone Co"]);
        assert_eq!(config.imap.mailbox, "Bills");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_fails_on_missing_vendors_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "vendors_file: /nonexistent/bill-ingest/vendors.yaml\n").unwrap();

        let err = Config::load_with(config_path.to_str().unwrap(), |_| None).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read vendors file"));
    }

    #[test]
    fn test_load_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let config = Config::load_with(missing.to_str().unwrap(), |key| match key {
            "EMAIL_INGESTION_USER" => Some("env-user".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.imap.username, "env-user");
        assert_eq!(config.imap.timeout_seconds, 30);
        assert!(config.vendors.is_empty());
    }
}
