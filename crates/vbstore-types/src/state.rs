use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a vbucket (a shard of the keyspace).
pub type VBucketId = u16;

/// State of a vbucket.
///
/// The string form of each state (`active`, `replica`, `pending`, `dead`) is
/// the token exchanged with persistence collaborators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VBucketState {
    /// Serves reads and writes.
    Active = 1,

    /// Receives writes from a master copy.
    Replica = 2,

    /// Transitioning.  Clients may block until the state resolves.
    Pending = 3,

    /// Inert, eligible for removal.
    Dead = 4,
}

impl VBucketState {
    pub const ALL: [VBucketState; 4] = [Self::Active, Self::Replica, Self::Pending, Self::Dead];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Replica => "replica",
            Self::Pending => "pending",
            Self::Dead => "dead",
        }
    }

    /// Converts the `repr(u8)` value back into a state.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Active),
            2 => Some(Self::Replica),
            3 => Some(Self::Pending),
            4 => Some(Self::Dead),
            _ => None,
        }
    }
}

impl Display for VBucketState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unknown vbucket state {0:?}")]
pub struct UnknownVBucketState(pub String);

impl FromStr for VBucketState {
    type Err = UnknownVBucketState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "replica" => Ok(Self::Replica),
            "pending" => Ok(Self::Pending),
            "dead" => Ok(Self::Dead),
            _ => Err(UnknownVBucketState(s.to_string())),
        }
    }
}

/// Shard metadata as recorded by the backing store.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PersistedVBucketState {
    pub state: VBucketState,
    pub checkpoint_id: u64,
}

/// On-disk document form of [`PersistedVBucketState`].  Both fields are
/// strings, e.g. `{"state": "active", "checkpoint_id": "12"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VBucketStateDocument {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub checkpoint_id: String,
}

impl From<PersistedVBucketState> for VBucketStateDocument {
    fn from(value: PersistedVBucketState) -> Self {
        Self {
            state: value.state.to_string(),
            checkpoint_id: value.checkpoint_id.to_string(),
        }
    }
}

impl VBucketStateDocument {
    /// Converts the document back into a state record.  Returns `None` if
    /// either field is missing or unparseable.
    pub fn to_state(&self) -> Option<PersistedVBucketState> {
        let state = self.state.parse().ok()?;
        let checkpoint_id = self.checkpoint_id.parse().ok()?;
        Some(PersistedVBucketState {
            state,
            checkpoint_id,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{PersistedVBucketState, VBucketState, VBucketStateDocument};

    #[test]
    fn state_tokens() {
        for state in VBucketState::ALL {
            assert_eq!(state.as_str().parse::<VBucketState>().unwrap(), state);
            assert_eq!(VBucketState::from_u8(state as u8), Some(state));
        }
        assert!("Active".parse::<VBucketState>().is_err());
        assert!("".parse::<VBucketState>().is_err());
        assert_eq!(VBucketState::from_u8(0), None);
    }

    #[test]
    fn document_round_trip() {
        let state = PersistedVBucketState {
            state: VBucketState::Replica,
            checkpoint_id: 42,
        };
        let json = serde_json::to_string(&VBucketStateDocument::from(state)).unwrap();
        assert_eq!(json, r#"{"state":"replica","checkpoint_id":"42"}"#);
        let doc: VBucketStateDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc.to_state(), Some(state));
    }

    #[test]
    fn malformed_documents() {
        for json in [
            r#"{"state":"active"}"#,
            r#"{"checkpoint_id":"3"}"#,
            r#"{"state":"bogus","checkpoint_id":"3"}"#,
            r#"{"state":"active","checkpoint_id":"three"}"#,
        ] {
            let doc: VBucketStateDocument = serde_json::from_str(json).unwrap();
            assert_eq!(doc.to_state(), None, "{json}");
        }
    }
}
