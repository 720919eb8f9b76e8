//! Dialog and registration bookkeeping
//!
//! Tokens (branches, tags, Call-IDs) are random and carry no meaning; only
//! their uniqueness matters.

use super::message::{extract_uri, strip_tag, ParsedMessage};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// RFC 3261 magic cookie every branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len.div_ceil(2)).map(|_| rng.gen()).collect();
    let mut encoded = hex::encode(bytes);
    encoded.truncate(len);
    encoded
}

pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_hex(16))
}

pub fn generate_tag() -> String {
    random_hex(10)
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", random_hex(16), host)
}

/// Host used in Via and Contact; WebSocket clients have no reachable address
pub fn generate_via_host() -> String {
    let label: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}.invalid", label)
}

/// Identity of a dialog from the local point of view
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
}

impl ParsedMessage {
    /// Dialog identity as seen by the receiver of this message.
    ///
    /// Responses answer our requests, so From carries the local tag; requests
    /// come from the peer, so From carries the remote tag.
    pub fn dialog_id(&self) -> Option<DialogId> {
        let call_id = self.call_id()?.to_string();
        let (local_tag, remote_tag) = if self.is_response {
            (self.from_tag(), self.to_tag())
        } else {
            (self.to_tag(), self.from_tag())
        };
        Some(DialogId {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

/// Monotonic CSeq source; only a full reconnect resets it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeqCounter {
    last: u32,
}

impl Default for CSeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CSeqCounter {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next(&mut self) -> u32 {
        self.last = self.last.wrapping_add(1).max(1);
        self.last
    }

    /// Last value handed out, zero before the first request
    pub fn current(&self) -> u32 {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}

/// Call-ID and From-tag that stay stable for one registration session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationContext {
    pub call_id: String,
    pub from_tag: String,
    pub cseq: CSeqCounter,
}

impl RegistrationContext {
    pub fn new(host: &str) -> Self {
        Self {
            call_id: generate_call_id(host),
            from_tag: generate_tag(),
            cseq: CSeqCounter::new(),
        }
    }
}

/// State of one call's dialog.
///
/// `local` and `remote` hold name-addr header values without tags; the
/// tags are kept separately so From/To can be rebuilt for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogContext {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local: String,
    pub remote: String,
    /// Peer Contact URI, the target of in-dialog requests
    pub remote_target: Option<String>,
    pub invite_branch: String,
    pub invite_cseq: u32,
}

impl DialogContext {
    /// Fresh dialog for an outgoing call
    pub fn outgoing(local: String, remote: String, host: &str) -> Self {
        Self {
            call_id: generate_call_id(host),
            local_tag: generate_tag(),
            remote_tag: None,
            local,
            remote,
            remote_target: None,
            invite_branch: generate_branch(),
            invite_cseq: 0,
        }
    }

    /// Dialog created by a peer INVITE; `None` if Call-ID or From is missing
    pub fn incoming(invite: &ParsedMessage) -> Option<Self> {
        let call_id = invite.call_id()?.to_string();
        let from = invite.header("from")?;
        let to = invite.header("to").unwrap_or_default();
        Some(Self {
            call_id,
            local_tag: generate_tag(),
            remote_tag: invite.from_tag(),
            local: strip_tag(to),
            remote: strip_tag(from),
            remote_target: invite.header("contact").map(extract_uri),
            invite_branch: String::new(),
            invite_cseq: invite.cseq().map(|(n, _)| n).unwrap_or_default(),
        })
    }

    pub fn id(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            local_tag: Some(self.local_tag.clone()),
            remote_tag: self.remote_tag.clone(),
        }
    }

    /// True when `other` belongs to this dialog. Missing tags on either
    /// side (early dialog, CANCEL) only require the Call-ID to match.
    pub fn matches(&self, other: &DialogId) -> bool {
        if other.call_id != self.call_id {
            return false;
        }
        let local_ok = other
            .local_tag
            .as_deref()
            .map_or(true, |tag| tag == self.local_tag);
        let remote_ok = match (other.remote_tag.as_deref(), self.remote_tag.as_deref()) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => true,
        };
        local_ok && remote_ok
    }

    pub fn local_uri(&self) -> String {
        extract_uri(&self.local)
    }

    pub fn remote_uri(&self) -> String {
        extract_uri(&self.remote)
    }

    /// Request-URI of in-dialog requests
    pub fn request_uri(&self) -> String {
        self.remote_target
            .clone()
            .unwrap_or_else(|| self.remote_uri())
    }

    pub fn from_header(&self) -> String {
        format!("{};tag={}", self.local, self.local_tag)
    }

    pub fn to_header(&self) -> String {
        match &self.remote_tag {
            Some(tag) => format!("{};tag={}", self.remote, tag),
            None => self.remote.clone(),
        }
    }

    /// Learn the remote tag and target from a response or request
    pub fn update_from_peer(&mut self, message: &ParsedMessage) {
        let peer_tag = if message.is_response {
            message.to_tag()
        } else {
            message.from_tag()
        };
        if let Some(tag) = peer_tag {
            self.remote_tag = Some(tag);
        }
        if let Some(contact) = message.header("contact") {
            let uri = extract_uri(contact);
            if !uri.is_empty() && uri != "*" {
                self.remote_target = Some(uri);
            }
        }
    }

    /// Fresh branch and CSeq for a new INVITE transaction in this dialog
    pub fn start_invite(&mut self, cseq: u32) {
        self.invite_branch = generate_branch();
        self.invite_cseq = cseq;
    }
}
