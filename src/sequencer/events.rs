/// Event payloads carried through the relay's log
use serde::{Deserialize, Serialize};

/// Largest inlined repository body; bigger commits are marked `too_big`
pub const MAX_INLINE_BLOCKS: usize = 1024 * 1024;

/// A repository moved to a new revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub repo: String,
    /// Content address of the fetched revision
    pub commit: String,
    pub rev: String,
    /// Revision this event follows, if the relay had seen one
    pub since: Option<String>,
    pub too_big: bool,
    #[serde(default)]
    pub blocks: Vec<u8>,
    #[serde(default)]
    pub ops: Vec<CommitOp>,
}

/// Operation within a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOp {
    pub action: OpAction,
    pub path: String,
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

/// An identity's document or handle changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEvent {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Hosting status of an account changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    pub did: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Takendown,
    Suspended,
    Deleted,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Takendown => "takendown",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Deleted => "deleted",
            AccountStatus::Deactivated => "deactivated",
        }
    }

    /// Parse an upstream status string; unknown values are ignored
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "takendown" => Some(AccountStatus::Takendown),
            "suspended" => Some(AccountStatus::Suspended),
            "deleted" => Some(AccountStatus::Deleted),
            "deactivated" => Some(AccountStatus::Deactivated),
            _ => None,
        }
    }
}

impl CommitEvent {
    /// Commit carrying `blocks`, dropping them when over the inline limit
    pub fn new(
        repo: String,
        commit: String,
        rev: String,
        since: Option<String>,
        blocks: Vec<u8>,
    ) -> Self {
        let too_big = blocks.len() > MAX_INLINE_BLOCKS;
        Self {
            repo,
            commit,
            rev,
            since,
            too_big,
            blocks: if too_big { Vec::new() } else { blocks },
            ops: Vec::new(),
        }
    }
}

impl IdentityEvent {
    pub fn new(did: String, handle: Option<String>) -> Self {
        Self { did, handle }
    }
}

impl AccountEvent {
    pub fn new(did: String, active: bool, status: Option<AccountStatus>) -> Self {
        Self { did, active, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_commit_is_marked() {
        let evt = CommitEvent::new(
            "did:plc:big".to_string(),
            "sha256:00".to_string(),
            "3kabc".to_string(),
            None,
            vec![0u8; MAX_INLINE_BLOCKS + 1],
        );
        assert!(evt.too_big);
        assert!(evt.blocks.is_empty());

        let evt = CommitEvent::new(
            "did:plc:small".to_string(),
            "sha256:01".to_string(),
            "3kabd".to_string(),
            Some("3kabc".to_string()),
            vec![1, 2, 3],
        );
        assert!(!evt.too_big);
        assert_eq!(evt.blocks, vec![1, 2, 3]);
    }

    #[test]
    fn test_account_status_parse() {
        assert_eq!(AccountStatus::parse("takendown"), Some(AccountStatus::Takendown));
        assert_eq!(AccountStatus::parse("desynchronized"), None);
        assert_eq!(AccountStatus::Deactivated.as_str(), "deactivated");
    }
}
