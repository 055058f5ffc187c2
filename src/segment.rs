use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::context::{BucketPrefix, Context};
use crate::rule::Clause;
use crate::util::is_false;
use crate::variation::VariationWeight;

/// Segment describes a group of contexts based on keys and/or matching rules.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// The unique key of the segment.
    pub key: String,
    #[serde(default)]
    pub version: u64,

    /// Keys of contexts that are always members of the segment.
    #[serde(default)]
    pub included: Vec<String>,
    /// Keys of contexts that are never members, unless also listed in `included`.
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,

    /// Unbounded segments keep their membership lists outside the flag data. Membership for
    /// them is answered by the included/excluded lists and rules present here only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unbounded: bool,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SegmentRule {
    #[serde(default)]
    id: Option<String>,
    clauses: Vec<Clause>,
    #[serde(default)]
    weight: Option<VariationWeight>,
    #[serde(default)]
    bucket_by: Option<String>,
}

impl Segment {
    /// Builds a segment with explicit inclusions only.
    pub fn new(key: impl Into<String>, included: Vec<String>) -> Self {
        Segment {
            key: key.into(),
            included,
            ..Default::default()
        }
    }

    pub fn contains(&self, context: &Context) -> bool {
        let context_key = context.key();

        if self.included.iter().any(|k| k == context_key) {
            return true;
        }
        if self.excluded.iter().any(|k| k == context_key) {
            return false;
        }

        self.rules
            .iter()
            .any(|rule| rule.matches(context, &self.key, &self.salt))
    }

    /// Keys of segments named by `segmentMatch` clauses inside this segment's rules. Such
    /// clauses never match during evaluation, but the references still order storage writes.
    pub fn segment_keys(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|rule| rule.clauses.iter())
            .flat_map(|clause| clause.segment_keys())
    }
}

impl SegmentRule {
    fn matches(&self, context: &Context, key: &str, salt: &str) -> bool {
        // rules match if _all_ of their clauses do; segments cannot nest
        let clauses_match = self
            .clauses
            .iter()
            .all(|clause| !clause.is_segment_match() && clause.matches_non_segment(context));
        if !clauses_match {
            return false;
        }

        match self.weight {
            Some(weight) if weight >= 0.0 => {
                let bucket_by = self.bucket_by.as_deref();
                let prefix = BucketPrefix::KeyAndSalt(key, salt);
                let bucket = context.bucket(bucket_by, prefix);
                bucket < weight / 100_000.0
            }
            _ => true,
        }
    }
}
