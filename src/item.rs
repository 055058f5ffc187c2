use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::flag::Flag;
use crate::segment::Segment;

/// The kinds of items the data store holds.
///
/// The variant order is the order kinds are written in: segments before features, so a flag never
/// lands in a store ahead of the segments it references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
    Segments,
    Features,
}

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::Segments, DataKind::Features];

    /// The namespace the kind is stored under, e.g. `features`.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Maps a kind name as it appears in change events to a kind. Returns None for kinds this
    /// library does not know about, which callers skip.
    pub fn from_wire_name(name: &str) -> Option<DataKind> {
        match name {
            "flag" | "flags" | "features" => Some(DataKind::Features),
            "segment" | "segments" => Some(DataKind::Segments),
            _ => None,
        }
    }

    /// Deserializes the JSON body of an item of this kind.
    pub fn parse_item(&self, body: serde_json::Value) -> Result<StorableItem, serde_json::Error> {
        Ok(match self {
            DataKind::Features => StorableItem::Flag(serde_json::from_value(body)?),
            DataKind::Segments => StorableItem::Segment(serde_json::from_value(body)?),
        })
    }

    /// Decodes an item read back from a persistent store. A body carrying `"deleted": true` is a
    /// tombstone whatever the `deleted` flag on `item` says.
    pub fn deserialize_item(
        &self,
        item: &SerializedItem,
    ) -> Result<ItemDescriptor, serde_json::Error> {
        if item.deleted {
            return Ok(ItemDescriptor::tombstone(item.version));
        }

        let body: serde_json::Value = serde_json::from_str(&item.serialized_item)?;
        if body.get("deleted").and_then(serde_json::Value::as_bool) == Some(true) {
            let version = body
                .get("version")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(item.version);
            return Ok(ItemDescriptor::tombstone(version));
        }

        Ok(ItemDescriptor::new(item.version, self.parse_item(body)?))
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Builds the key an item is stored under in a persistent store: `{prefix}:{namespace}/{key}`.
pub fn storage_key(prefix: &str, kind: DataKind, key: &str) -> String {
    format!("{}:{}/{}", prefix, kind.namespace(), key)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StorableItem {
    Flag(Flag),
    Segment(Segment),
}

impl StorableItem {
    pub fn kind(&self) -> DataKind {
        match self {
            StorableItem::Flag(_) => DataKind::Features,
            StorableItem::Segment(_) => DataKind::Segments,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StorableItem::Flag(f) => &f.key,
            StorableItem::Segment(s) => &s.key,
        }
    }

    pub fn as_flag(&self) -> Option<&Flag> {
        match self {
            StorableItem::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Segment> {
        match self {
            StorableItem::Segment(s) => Some(s),
            _ => None,
        }
    }

    /// Keys of items of the same kind that should be stored before this one.
    pub(crate) fn same_kind_dependencies(&self) -> Vec<&str> {
        match self {
            StorableItem::Flag(f) => f.prerequisite_keys().collect(),
            StorableItem::Segment(s) => s.segment_keys().collect(),
        }
    }
}

impl From<Flag> for StorableItem {
    fn from(flag: Flag) -> Self {
        StorableItem::Flag(flag)
    }
}

impl From<Segment> for StorableItem {
    fn from(segment: Segment) -> Self {
        StorableItem::Segment(segment)
    }
}

/// A versioned slot in the data store. An item of None is a tombstone: a deleted item that still
/// holds its version so that older updates cannot resurrect it.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Arc<StorableItem>>,
}

#[derive(Serialize)]
struct Tombstone<'a> {
    key: &'a str,
    version: u64,
    deleted: bool,
}

impl ItemDescriptor {
    pub fn new(version: u64, item: impl Into<StorableItem>) -> Self {
        ItemDescriptor {
            version,
            item: Some(Arc::new(item.into())),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.item.is_none()
    }

    /// Encodes the item for a persistent store: the item's own JSON, or
    /// `{"key":…,"version":…,"deleted":true}` for a tombstone.
    pub fn serialize_item(&self, key: &str) -> Result<SerializedItem, serde_json::Error> {
        let serialized_item = match &self.item {
            Some(item) => serde_json::to_string(item.as_ref())?,
            None => serde_json::to_string(&Tombstone {
                key,
                version: self.version,
                deleted: true,
            })?,
        };
        Ok(SerializedItem {
            version: self.version,
            deleted: self.is_deleted(),
            serialized_item,
        })
    }
}

/// An item as a persistent store keeps it: the raw JSON body with its version alongside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedItem {
    pub version: u64,
    pub deleted: bool,
    pub serialized_item: String,
}
