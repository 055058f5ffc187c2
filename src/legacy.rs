//! The older streaming messages: `put` carries a whole data set, `patch` and `delete` address a
//! single item through a path such as `/flags/my-flag`.
use std::collections::HashMap;

use log::warn;
use serde::Deserialize;

use crate::changeset::{ChangeSet, ChangeSetBuilder, IntentCode};
use crate::item::DataKind;

const ROOT_PATH: &str = "/";
const FLAGS_PATH_PREFIX: &str = "/flags/";
const SEGMENTS_PATH_PREFIX: &str = "/segments/";

fn root_path() -> String {
    ROOT_PATH.to_string()
}

/// Resolves an item path to its kind and key. Returns None for the root path and for paths this
/// library does not know.
pub fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix(FLAGS_PATH_PREFIX) {
        Some((DataKind::Features, key))
    } else if let Some(key) = path.strip_prefix(SEGMENTS_PATH_PREFIX) {
        Some((DataKind::Segments, key))
    } else {
        None
    }
}

/// A complete data set keyed by item key, as carried by `put` and by legacy polling responses.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct LegacyData {
    #[serde(default)]
    pub flags: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub segments: HashMap<String, serde_json::Value>,
}

impl LegacyData {
    pub fn into_change_set(self) -> ChangeSet {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        for (kind, items) in [
            (DataKind::Segments, self.segments),
            (DataKind::Features, self.flags),
        ] {
            for (key, object) in items {
                let version = version_of(&object);
                builder.add_put(kind, key, version, object);
            }
        }
        builder
            .finish(None)
            .unwrap_or_else(|_| ChangeSetBuilder::empty(None))
    }
}

fn version_of(object: &serde_json::Value) -> u64 {
    object
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LegacyPut {
    #[serde(default = "root_path")]
    pub path: String,
    pub data: LegacyData,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LegacyPatch {
    pub path: String,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LegacyDelete {
    pub path: String,
    pub version: u64,
}

impl LegacyPut {
    /// A put replaces everything. Puts addressed anywhere but the root are ignored.
    pub fn into_change_set(self) -> Option<ChangeSet> {
        if self.path != ROOT_PATH {
            warn!("ignoring put for unsupported path '{}'", self.path);
            return None;
        }
        Some(self.data.into_change_set())
    }
}

impl LegacyPatch {
    pub fn into_change_set(self) -> Option<ChangeSet> {
        let (kind, key) = match parse_path(&self.path) {
            Some(target) => target,
            None => {
                warn!("ignoring patch for unknown path '{}'", self.path);
                return None;
            }
        };
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        let version = version_of(&self.data);
        builder.add_put(kind, key, version, self.data);
        builder.finish(None).ok()
    }
}

impl LegacyDelete {
    pub fn into_change_set(self) -> Option<ChangeSet> {
        let (kind, key) = match parse_path(&self.path) {
            Some(target) => target,
            None => {
                warn!("ignoring delete for unknown path '{}'", self.path);
                return None;
            }
        };
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        builder.add_delete(kind, key, self.version);
        builder.finish(None).ok()
    }
}
