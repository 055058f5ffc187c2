//! Change-sets: ordered batches of puts and deletes that move the local data set from one
//! server-side snapshot to the next.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::item::DataKind;

/// Identifies a consistent snapshot of the server's data set. A change-set's selector names the
/// snapshot reached after applying it, and is offered back to the server on reconnect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub state: String,
    pub version: u64,
}

impl Selector {
    pub fn new(state: impl Into<String>, version: u64) -> Self {
        Selector {
            state: state.into(),
            version,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.state, self.version)
    }
}

/// What the server intends to send next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentCode {
    /// Nothing changed; the local data is already current.
    #[serde(rename = "none")]
    None,
    /// A full data set follows and replaces everything held locally.
    #[serde(rename = "xfer-full")]
    TransferFull,
    /// Incremental changes follow.
    #[serde(rename = "xfer-changes")]
    TransferChanges,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub action: ChangeAction,
    pub kind: DataKind,
    pub key: String,
    pub version: u64,
    /// The raw item body; None for deletes.
    pub object: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSet {
    pub intent: IntentCode,
    pub changes: Vec<Change>,
    pub selector: Option<Selector>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChangeSetError {
    /// `finish` was called before any intent was started.
    #[error("cannot finish a change set without a server intent")]
    NoIntent,
    /// The server announced an intent with no payloads.
    #[error("server intent contained no payloads")]
    EmptyIntent,
}

/// Accumulates changes between a server intent and the event that closes the transfer.
///
/// After the first `finish`, the builder keeps accepting changes as an incremental transfer: the
/// server may stream further puts and deletes followed by another completion without announcing
/// a new intent.
#[derive(Debug, Default)]
pub struct ChangeSetBuilder {
    intent: Option<IntentCode>,
    changes: Vec<Change>,
}

impl ChangeSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A change-set saying nothing changed, with no selector.
    pub fn no_changes() -> ChangeSet {
        ChangeSet {
            intent: IntentCode::None,
            changes: Vec::new(),
            selector: None,
        }
    }

    /// A full transfer that leaves the store empty.
    pub fn empty(selector: Option<Selector>) -> ChangeSet {
        ChangeSet {
            intent: IntentCode::TransferFull,
            changes: Vec::new(),
            selector,
        }
    }

    /// Begins a transfer, discarding any changes accumulated so far.
    pub fn start(&mut self, intent: IntentCode) {
        self.intent = Some(intent);
        self.changes.clear();
    }

    pub fn has_intent(&self) -> bool {
        self.intent.is_some()
    }

    pub fn add_put(
        &mut self,
        kind: DataKind,
        key: impl Into<String>,
        version: u64,
        object: serde_json::Value,
    ) {
        self.changes.push(Change {
            action: ChangeAction::Put,
            kind,
            key: key.into(),
            version,
            object: Some(object),
        });
    }

    pub fn add_delete(&mut self, kind: DataKind, key: impl Into<String>, version: u64) {
        self.changes.push(Change {
            action: ChangeAction::Delete,
            kind,
            key: key.into(),
            version,
            object: None,
        });
    }

    /// Completes the transfer, producing a change-set that leads to `selector`.
    pub fn finish(&mut self, selector: Option<Selector>) -> Result<ChangeSet, ChangeSetError> {
        let intent = self.intent.ok_or(ChangeSetError::NoIntent)?;
        let change_set = ChangeSet {
            intent,
            changes: std::mem::take(&mut self.changes),
            selector,
        };
        if intent == IntentCode::TransferFull {
            self.intent = Some(IntentCode::TransferChanges);
        }
        Ok(change_set)
    }

    /// Drops the current intent and any pending changes, e.g. after the connection is lost.
    pub fn reset(&mut self) {
        self.intent = None;
        self.changes.clear();
    }
}
