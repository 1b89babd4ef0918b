/// Sequencer - Event log and firehose system
///
/// Every accepted repository change gets a strictly increasing sequence
/// number, is durably recorded by a persistence backend, and is fanned out
/// to live subscribers in sequence order.

pub mod db;
pub mod disk;
pub mod events;
pub mod manager;
pub mod persist;
pub mod subscription;

pub use db::DbPersistence;
pub use disk::{DiskPersistOptions, DiskPersistence};
pub use events::*;
pub use manager::{EventManager, EventManagerConfig};
pub use persist::{EventPersistence, PlaybackPage, TrimStats};
pub use subscription::Subscription;

use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type discriminator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Commit,
    Identity,
    Account,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Commit => "commit",
            EventType::Identity => "identity",
            EventType::Account => "account",
        }
    }

    /// Single-byte tag used in the disk log
    pub fn tag(&self) -> u8 {
        match self {
            EventType::Commit => 1,
            EventType::Identity => 2,
            EventType::Account => 3,
        }
    }

    pub fn from_tag(tag: u8) -> RelayResult<Self> {
        match tag {
            1 => Ok(EventType::Commit),
            2 => Ok(EventType::Identity),
            3 => Ok(EventType::Account),
            other => Err(RelayError::Encoding(format!("unknown event tag {}", other))),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(EventType::Commit),
            "identity" => Ok(EventType::Identity),
            "account" => Ok(EventType::Account),
            other => Err(RelayError::Encoding(format!("unknown event type {}", other))),
        }
    }
}

/// A repository change accepted by the relay, before sequencing
#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent {
    Commit(CommitEvent),
    Identity(IdentityEvent),
    Account(AccountEvent),
}

impl RepoEvent {
    /// Repository the event belongs to
    pub fn did(&self) -> &str {
        match self {
            RepoEvent::Commit(evt) => &evt.repo,
            RepoEvent::Identity(evt) => &evt.did,
            RepoEvent::Account(evt) => &evt.did,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            RepoEvent::Commit(_) => EventType::Commit,
            RepoEvent::Identity(_) => EventType::Identity,
            RepoEvent::Account(_) => EventType::Account,
        }
    }

    /// CBOR payload stored by persistence backends
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        let encoded = match self {
            RepoEvent::Commit(evt) => serde_cbor::to_vec(evt),
            RepoEvent::Identity(evt) => serde_cbor::to_vec(evt),
            RepoEvent::Account(evt) => serde_cbor::to_vec(evt),
        };
        encoded.map_err(|e| {
            RelayError::Encoding(format!("Failed to encode {} event: {}", self.event_type().as_str(), e))
        })
    }

    pub fn decode(event_type: EventType, bytes: &[u8]) -> RelayResult<Self> {
        let decoded = match event_type {
            EventType::Commit => serde_cbor::from_slice(bytes).map(RepoEvent::Commit),
            EventType::Identity => serde_cbor::from_slice(bytes).map(RepoEvent::Identity),
            EventType::Account => serde_cbor::from_slice(bytes).map(RepoEvent::Account),
        };
        decoded.map_err(|e| {
            RelayError::Encoding(format!("Failed to decode {} event: {}", event_type.as_str(), e))
        })
    }
}

/// A RepoEvent with its position in the global log
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub seq: i64,
    pub time: DateTime<Utc>,
    pub event: RepoEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_codec_preserves_payload() {
        let evt = RepoEvent::Account(AccountEvent::new(
            "did:plc:alice".to_string(),
            false,
            Some(AccountStatus::Takendown),
        ));
        let bytes = evt.encode().unwrap();
        let decoded = RepoEvent::decode(EventType::Account, &bytes).unwrap();
        assert_eq!(decoded, evt);
        assert_eq!(decoded.did(), "did:plc:alice");
    }

    #[test]
    fn test_decode_with_wrong_type_fails() {
        let evt = RepoEvent::Identity(IdentityEvent::new("did:plc:bob".to_string(), None));
        let bytes = evt.encode().unwrap();
        assert!(RepoEvent::decode(EventType::Commit, &bytes).is_err());
    }

    #[test]
    fn test_event_type_tags() {
        for t in [EventType::Commit, EventType::Identity, EventType::Account] {
            assert_eq!(EventType::from_tag(t.tag()).unwrap(), t);
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!(EventType::from_tag(9).is_err());
    }
}
