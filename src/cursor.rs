use crate::mailbox::{MailboxStatus, SearchQuery};
use chrono::{Duration, NaiveDate};
use std::collections::HashMap;

/// Identity of one mailbox generation. A UIDVALIDITY change starts a new
/// generation whose UIDs are unrelated to the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxKey {
    pub user_id: String,
    pub mailbox: String,
    pub uid_validity: u32,
}

impl MailboxKey {
    pub fn new(user_id: &str, mailbox: &str, uid_validity: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            mailbox: mailbox.to_string(),
            uid_validity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Everything above the highest recorded UID
    Incremental,
    /// Messages received in the last `days` days, regardless of the cursor
    Backfill { days: u32, force: bool },
    /// One message by UID
    Single { uid: u32, bypass_policy: bool },
}

impl PollMode {
    pub fn is_forced(&self) -> bool {
        match self {
            PollMode::Incremental => false,
            PollMode::Backfill { force, .. } => *force,
            PollMode::Single { .. } => true,
        }
    }

    pub fn bypasses_policy(&self) -> bool {
        matches!(self, PollMode::Single { bypass_policy: true, .. })
    }
}

/// What the ingestion log knows about one (user, mailbox) pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorSnapshot {
    /// Highest recorded UID per UIDVALIDITY
    pub last_uid: HashMap<u32, u32>,
    /// Failed UIDs per UIDVALIDITY that still have retry budget
    pub retry_uids: HashMap<u32, Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub query: Option<SearchQuery>,
    /// UIDs fetched ahead of the search results (retries, single message)
    pub explicit_uids: Vec<u32>,
    /// Cap on search results taken this cycle
    pub limit: Option<usize>,
    pub validity_changed: bool,
}

impl FetchPlan {
    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.explicit_uids.is_empty()
    }
}

impl CursorSnapshot {
    pub fn plan(
        &self,
        status: &MailboxStatus,
        mode: PollMode,
        batch_size: usize,
        today: NaiveDate,
    ) -> FetchPlan {
        match mode {
            PollMode::Incremental => self.incremental_plan(status, batch_size),
            PollMode::Backfill { days, .. } => FetchPlan {
                query: Some(SearchQuery::Since(today - Duration::days(i64::from(days)))),
                explicit_uids: Vec::new(),
                limit: None,
                validity_changed: false,
            },
            PollMode::Single { uid, .. } => FetchPlan {
                query: None,
                explicit_uids: vec![uid],
                limit: None,
                validity_changed: false,
            },
        }
    }

    fn incremental_plan(&self, status: &MailboxStatus, batch_size: usize) -> FetchPlan {
        let validity = status.uid_validity;
        let last = self.last_uid.get(&validity).copied().unwrap_or(0);
        let validity_changed = last == 0 && self.last_uid.keys().any(|v| *v != validity);
        if validity_changed {
            log::warn!(
                "UIDVALIDITY is now {validity} (previously {:?}); rescanning mailbox from UID 1",
                self.last_uid.keys().collect::<Vec<_>>()
            );
        }

        let start = last.saturating_add(1);
        let has_new = match status.uid_next {
            Some(next) => start < next,
            // Server did not report UIDNEXT, search and let the results decide
            None => status.exists > 0,
        };

        FetchPlan {
            query: has_new.then_some(SearchQuery::UidFrom(start)),
            explicit_uids: self.retry_uids.get(&validity).cloned().unwrap_or_default(),
            limit: Some(batch_size),
            validity_changed,
        }
    }
}
