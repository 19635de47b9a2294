use crate::config::ImapSettings;
use crate::cursor::{CursorSnapshot, FetchPlan, PollMode};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use native_tls::TlsStream;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio::sync::mpsc;

/// UIDs requested per FETCH command
const FETCH_CHUNK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub uid_validity: u32,
    pub uid_next: Option<u32>,
    pub exists: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// `UID start:*`
    UidFrom(u32),
    /// Internal date on or after the given day
    Since(NaiveDate),
}

impl SearchQuery {
    pub fn to_imap(&self) -> String {
        match self {
            SearchQuery::UidFrom(start) => format!("UID {start}:*"),
            SearchQuery::Since(date) => format!("SINCE {}", date.format("%d-%b-%Y")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub internal_date: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

/// Blocking view of one mailbox connection
pub trait MailSource: Send {
    /// Select `mailbox` read-only and report its UID state
    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus>;
    fn search(&mut self, query: &SearchQuery) -> Result<Vec<u32>>;
    fn fetch(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>>;
    fn logout(&mut self) -> Result<()>;
}

pub trait MailConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MailSource>>;
    fn describe(&self) -> String;
}

pub struct ImapConnector {
    settings: ImapSettings,
}

impl ImapConnector {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }

    /// TCP socket with connect, read and write deadlines
    fn open_socket(&self) -> Result<TcpStream> {
        let s = &self.settings;
        let timeout = Duration::from_secs(s.timeout_seconds.max(1));
        let addrs = (s.host.as_str(), s.port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve IMAP server '{}'", s.host))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(timeout))?;
                    tcp.set_write_timeout(Some(timeout))?;
                    return Ok(tcp);
                }
                Err(e) => last_error = Some(e),
            }
        }
        let reason = last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string());
        Err(anyhow!(
            "failed to connect to IMAP server '{}:{}': {reason}",
            s.host,
            s.port
        ))
    }
}

impl MailConnector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn MailSource>> {
        let s = &self.settings;
        let tls = native_tls::TlsConnector::builder()
            .build()
            .context("failed to build TLS connector for IMAP")?;
        let tcp = self.open_socket()?;

        let client = if s.tls {
            let stream = tls
                .connect(s.host.as_str(), tcp)
                .map_err(|e| anyhow!("TLS handshake with '{}' failed: {e}", s.host))?;
            let mut client = imap::Client::new(stream);
            client.read_greeting().context("IMAP server sent no greeting")?;
            client
        } else {
            let mut client = imap::Client::new(tcp);
            client.read_greeting().context("IMAP server sent no greeting")?;
            client.secure(s.host.as_str(), &tls).with_context(|| {
                format!(
                    "failed to connect to IMAP server '{}:{}' with STARTTLS",
                    s.host, s.port
                )
            })?
        };

        let session = client
            .login(s.username.as_str(), s.password.as_str())
            .map_err(|(error, _client)| anyhow!(error))
            .context("failed to authenticate to IMAP server")?;

        log::debug!("Logged in to {}:{} as {}", s.host, s.port, s.username);
        Ok(Box::new(ImapMailbox { session }))
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.settings.username, self.settings.host, self.settings.port)
    }
}

struct ImapMailbox {
    session: imap::Session<TlsStream<TcpStream>>,
}

impl MailSource for ImapMailbox {
    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let selected = self
            .session
            .examine(mailbox)
            .with_context(|| format!("failed to select IMAP folder '{mailbox}'"))?;
        Ok(MailboxStatus {
            uid_validity: selected.uid_validity.unwrap_or(0),
            uid_next: selected.uid_next,
            exists: selected.exists,
        })
    }

    fn search(&mut self, query: &SearchQuery) -> Result<Vec<u32>> {
        let imap_query = query.to_imap();
        let uids = self
            .session
            .uid_search(&imap_query)
            .with_context(|| format!("IMAP search '{imap_query}' failed"))?;
        Ok(uids.into_iter().collect())
    }

    fn fetch(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let sequence = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let fetches = self
            .session
            .uid_fetch(&sequence, "(UID INTERNALDATE RFC822)")
            .with_context(|| format!("failed to fetch UIDs {sequence}"))?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else {
                log::warn!("IMAP fetch response without UID, ignoring");
                continue;
            };
            let Some(body) = fetch.body() else {
                log::warn!("IMAP fetch for UID {uid} returned no body");
                continue;
            };
            messages.push(FetchedMessage {
                uid,
                internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                raw: body.to_vec(),
            });
        }
        Ok(messages)
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout().context("IMAP logout failed")?;
        Ok(())
    }
}

/// Events streamed from the blocking fetch task to the async pipeline
#[derive(Debug)]
pub enum FetchEvent {
    Selected {
        status: MailboxStatus,
        plan: FetchPlan,
    },
    Message(FetchedMessage),
}

pub struct FetchRequest {
    pub mailbox: String,
    pub snapshot: CursorSnapshot,
    pub mode: PollMode,
    pub batch_size: usize,
    pub today: NaiveDate,
}

/// Resolve the UID list for a plan against the server's search results.
/// Explicit UIDs come first, followed by new search hits in ascending order.
pub fn resolve_uids(plan: &FetchPlan, mut found: Vec<u32>) -> Vec<u32> {
    if let Some(SearchQuery::UidFrom(start)) = &plan.query {
        // `UID n:*` always matches the highest UID, even when it is below n
        found.retain(|uid| uid >= start);
    }
    found.sort_unstable();
    found.dedup();
    found.retain(|uid| !plan.explicit_uids.contains(uid));
    if let Some(limit) = plan.limit {
        found.truncate(limit);
    }

    let mut uids = plan.explicit_uids.clone();
    uids.extend(found);
    uids
}

/// Connect, select, search and stream messages to `tx` chunk by chunk.
/// Runs on a blocking thread; returns when the plan is exhausted or the
/// receiver goes away.
pub fn fetch_into(
    connector: &dyn MailConnector,
    request: &FetchRequest,
    tx: &mpsc::Sender<FetchEvent>,
) -> Result<usize> {
    let mut source = connector.connect()?;
    let result = stream_messages(source.as_mut(), request, tx);
    if let Err(e) = source.logout() {
        log::warn!("Error closing IMAP connection: {e}");
    }
    result
}

fn stream_messages(
    source: &mut dyn MailSource,
    request: &FetchRequest,
    tx: &mpsc::Sender<FetchEvent>,
) -> Result<usize> {
    let status = source.select(&request.mailbox)?;
    let plan = request
        .snapshot
        .plan(&status, request.mode, request.batch_size, request.today);
    log::debug!(
        "Mailbox {} has {} messages (UIDVALIDITY {}, UIDNEXT {:?}); plan {:?}",
        request.mailbox,
        status.exists,
        status.uid_validity,
        status.uid_next,
        plan
    );

    let found = match &plan.query {
        Some(query) => source.search(query)?,
        None => Vec::new(),
    };
    let uids = resolve_uids(&plan, found);

    if tx.blocking_send(FetchEvent::Selected { status, plan }).is_err() {
        return Ok(0);
    }

    let mut sent = 0;
    for chunk in uids.chunks(FETCH_CHUNK) {
        for message in source.fetch(chunk)? {
            if tx.blocking_send(FetchEvent::Message(message)).is_err() {
                log::debug!("Fetch receiver closed, stopping early");
                return Ok(sent);
            }
            sent += 1;
        }
    }
    Ok(sent)
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryConnector;
    use super::*;
    use chrono::TimeZone;

    fn plan(query: Option<SearchQuery>, explicit: Vec<u32>, limit: Option<usize>) -> FetchPlan {
        FetchPlan {
            query,
            explicit_uids: explicit,
            limit,
            validity_changed: false,
        }
    }

    #[test]
    fn test_search_query_rendering() {
        assert_eq!(SearchQuery::UidFrom(43).to_imap(), "UID 43:*");
        let since = SearchQuery::Since(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap());
        assert_eq!(since.to_imap(), "SINCE 07-Mar-2025");
    }

    #[test]
    fn test_resolve_uids_drops_star_quirk() {
        let p = plan(Some(SearchQuery::UidFrom(43)), vec![], Some(10));
        assert!(resolve_uids(&p, vec![42]).is_empty());
        assert_eq!(resolve_uids(&p, vec![45, 43, 44, 43]), vec![43, 44, 45]);
    }

    #[test]
    fn test_resolve_uids_limit_keeps_lowest_and_retries_first() {
        let p = plan(Some(SearchQuery::UidFrom(10)), vec![3, 11], Some(2));
        assert_eq!(resolve_uids(&p, vec![13, 10, 11, 12]), vec![3, 11, 10, 12]);
    }

    #[test]
    fn test_fetch_into_streams_status_then_messages() {
        let connector = MemoryConnector::new(9);
        let when = Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap();
        for uid in 1..=25 {
            connector.push(uid, when, format!("Subject: {uid}\r\n\r\nbody").into_bytes());
        }

        let request = FetchRequest {
            mailbox: "INBOX".to_string(),
            snapshot: CursorSnapshot::default(),
            mode: PollMode::Incremental,
            batch_size: 30,
            today: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let sent = fetch_into(&connector, &request, &tx).unwrap();
        drop(tx);
        assert_eq!(sent, 25);

        match rx.blocking_recv() {
            Some(FetchEvent::Selected { status, .. }) => assert_eq!(status.uid_validity, 9),
            other => panic!("expected Selected first, got {other:?}"),
        }
        let mut uids = Vec::new();
        while let Some(FetchEvent::Message(m)) = rx.blocking_recv() {
            uids.push(m.uid);
        }
        assert_eq!(uids, (1..=25).collect::<Vec<_>>());
        assert_eq!(connector.state.lock().unwrap().logouts, 1);
    }

    #[test]
    fn test_connect_failure_is_an_error() {
        let connector = MemoryConnector::new(1);
        connector.state.lock().unwrap().fail_connect = true;
        let request = FetchRequest {
            mailbox: "INBOX".to_string(),
            snapshot: CursorSnapshot::default(),
            mode: PollMode::Incremental,
            batch_size: 5,
            today: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
        };
        let (tx, _rx) = mpsc::channel(4);
        assert!(fetch_into(&connector, &request, &tx).is_err());
    }
}
