use crate::classifier::{ClassificationPrompt, InvoiceClassifier, LlmVerdict};
use crate::config::LlmSettings;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

const SYSTEM_PROMPT: &str = "You decide whether an email is a genuine bill or invoice that \
an accounts payable team should file. Marketing, newsletters, shipping notices and order \
confirmations without an amount owed are not invoices. Reply with a JSON object \
{\"is_invoice\": boolean, \"confidence\": number between 0 and 1}. Be conservative.";

/// Chat-completions client for any OpenAI compatible endpoint
pub struct OpenAiClassifier {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context("LLM classification requires an API key")?;

        let mut base = settings.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .with_context(|| format!("Invalid LLM base URL: {}", settings.base_url))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .user_agent(concat!("bill-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: settings.model.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl InvoiceClassifier for OpenAiClassifier {
    async fn classify(&self, prompt: &ClassificationPrompt) -> Result<LlmVerdict> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt.render() },
            ],
        });

        log::debug!("Asking {} ({}) about '{}'", self.endpoint, self.model, prompt.subject);
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("LLM request failed: {status} {}", truncate(&detail, 200));
        }

        let chat: ChatResponse = response.json().await.context("Malformed LLM response")?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("LLM response had no content"))?;
        parse_verdict(&content)
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    is_invoice: bool,
    #[serde(default)]
    confidence: f64,
}

/// Parse the model's JSON answer, tolerating a markdown code fence around it
pub fn parse_verdict(content: &str) -> Result<LlmVerdict> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let raw: RawVerdict = serde_json::from_str(json)
        .with_context(|| format!("LLM answer is not a verdict: {}", truncate(json, 120)))?;
    let confidence = if raw.confidence.is_finite() {
        raw.confidence.clamp(0.0, 1.0) as f32
    } else {
        0.0
    };
    Ok(LlmVerdict {
        is_invoice: raw.is_invoice,
        confidence,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let verdict = parse_verdict(r#"{"is_invoice": true, "confidence": 0.91}"#).unwrap();
        assert!(verdict.is_invoice);
        assert!((verdict.confidence - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "```json\n{\"is_invoice\": false, \"confidence\": 0.2}\n```";
        let verdict = parse_verdict(content).unwrap();
        assert!(!verdict.is_invoice);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let verdict = parse_verdict(r#"{"is_invoice": true, "confidence": 7}"#).unwrap();
        assert_eq!(verdict.confidence, 1.0);
        let verdict = parse_verdict(r#"{"is_invoice": true}"#).unwrap();
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_verdict("I think this is an invoice").is_err());
        assert!(parse_verdict(r#"{"confidence": 0.9}"#).is_err());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let mut settings = LlmSettings {
            api_key: Some("sk-test".to_string()),
            base_url: "https://llm.internal.example/v1".to_string(),
            ..Default::default()
        };
        let classifier = OpenAiClassifier::new(&settings).unwrap();
        assert_eq!(
            classifier.endpoint().as_str(),
            "https://llm.internal.example/v1/chat/completions"
        );

        settings.api_key = Some("  ".to_string());
        assert!(OpenAiClassifier::new(&settings).is_err());
    }

    /// Answer exactly one HTTP request with `status` and `body`, returning
    /// the base URL to point the classifier at.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // read headers and the JSON body before answering
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/v1")
    }

    fn prompt() -> ClassificationPrompt {
        ClassificationPrompt {
            from: "ops@unknown.example".to_string(),
            to: "ap@acme.example".to_string(),
            subject: "Hi".to_string(),
            snippet: "See attached.".to_string(),
        }
    }

    fn classifier_for(base_url: String) -> OpenAiClassifier {
        let mut classifier = OpenAiClassifier::new(&LlmSettings {
            api_key: Some("sk-test".to_string()),
            base_url,
            timeout_seconds: 5,
            ..Default::default()
        })
        .unwrap();
        // a proxy from the environment must not intercept loopback
        classifier.client = Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .unwrap();
        classifier
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let base = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let err = classifier_for(base).classify(&prompt()).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("503"), "{message}");
        assert!(message.contains("busy"), "{message}");
    }

    #[tokio::test]
    async fn test_successful_completion_is_parsed() {
        let base = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"content":"{\"is_invoice\": true, \"confidence\": 0.8}"}}]}"#,
        )
        .await;
        let verdict = classifier_for(base).classify(&prompt()).await.unwrap();
        assert!(verdict.is_invoice);
        assert!((verdict.confidence - 0.8).abs() < 1e-6);
    }
}
