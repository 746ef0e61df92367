use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Per-channel synchronization state for one piece of hub content.
///
/// The variants carry exactly the data that is valid for them: an
/// `Unpublished` link has no channel content, a `Drafting` or `Linked` link
/// always does. Rows that violate this are rejected at the store boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelLinkState {
    Unpublished,
    Drafting {
        content_id: String,
    },
    Linked {
        content_id: String,
        since: DateTime<Utc>,
    },
}

impl ChannelLinkState {
    pub fn tag(&self) -> &'static str {
        match self {
            ChannelLinkState::Unpublished => "UNPUBLISHED",
            ChannelLinkState::Drafting { .. } => "DRAFTING",
            ChannelLinkState::Linked { .. } => "LINKED",
        }
    }

    pub fn content_id(&self) -> Option<&str> {
        match self {
            ChannelLinkState::Unpublished => None,
            ChannelLinkState::Drafting { content_id } => Some(content_id),
            ChannelLinkState::Linked { content_id, .. } => Some(content_id),
        }
    }
}

/// One channel's link record, keyed by (hub content, channel) in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLink {
    pub hub_content_id: i64,
    pub channel: String,
    pub state: ChannelLinkState,
    pub updated_at: DateTime<Utc>,
}

/// A piece of content intended for distribution to multiple channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubContent {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub content_date: Option<chrono::NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Success/fail/sending/total counts, either for one group or aggregated
/// across a message's groups.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCounts {
    pub total: i64,
    pub success: i64,
    pub fail: i64,
    pub sending: i64,
}

impl GroupCounts {
    pub fn add(&mut self, other: &GroupCounts) {
        self.total += other.total;
        self.success += other.success;
        self.fail += other.fail;
        self.sending += other.sending;
    }

    /// A group is settled once the provider reports nothing in flight.
    pub fn is_settled(&self) -> bool {
        self.sending == 0
    }
}

/// One provider-reported status fact for a dispatch group.
///
/// `failed_addresses` is present only when the provider exposes per-recipient
/// outcomes; consumers must not assume that precision otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatusSnapshot {
    pub counts: GroupCounts,
    pub failed_addresses: Option<Vec<String>>,
    pub captured_at: DateTime<Utc>,
}

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{8,15}$").expect("valid address pattern"));

/// Strip separators and validate a destination address. Returns `None` when
/// the result is not a plausible subscriber number.
pub fn normalize_address(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '(' && *c != ')')
        .collect();
    if ADDRESS_RE.is_match(&cleaned) {
        Some(cleaned)
    } else {
        None
    }
}

/// A deduplicated, ordered list of destination addresses for one dispatch.
///
/// Order is first occurrence wins; duplicates are dropped, never reordered,
/// so a chunk index always correlates with original input position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientSet {
    addresses: Vec<String>,
}

impl RecipientSet {
    pub fn new<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = std::collections::HashSet::new();
        let addresses = addresses
            .into_iter()
            .filter(|a| seen.insert(a.clone()))
            .collect();
        Self { addresses }
    }

    /// Normalize and validate raw input. Fails on the first invalid address
    /// rather than silently dropping it.
    pub fn parse<I, S>(raw: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for item in raw {
            match normalize_address(item.as_ref()) {
                Some(addr) => out.push(addr),
                None => return Err(item.as_ref().to_string()),
            }
        }
        Ok(Self::new(out))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.addresses
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.addresses.iter()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.addresses
    }
}
