use chrono::{self, Utc};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::store::Store;
use crate::util::is_false;
use crate::value::AttributeValue;
use crate::variation::VariationOrRollout;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Clause {
    pub(crate) attribute: String,
    #[serde(default)]
    pub(crate) negate: bool,
    pub(crate) op: Op,
    pub(crate) values: Vec<AttributeValue>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    pub(crate) clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_events: bool,
}

/// A clause operator. Operators this library does not know are kept by name so that they survive
/// a round trip; they never match.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(from = "String", into = "String")]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
    Unknown(String),
}

impl From<String> for Op {
    fn from(name: String) -> Self {
        match name.as_str() {
            "in" => Op::In,
            "startsWith" => Op::StartsWith,
            "endsWith" => Op::EndsWith,
            "contains" => Op::Contains,
            "matches" => Op::Matches,
            "lessThan" => Op::LessThan,
            "lessThanOrEqual" => Op::LessThanOrEqual,
            "greaterThan" => Op::GreaterThan,
            "greaterThanOrEqual" => Op::GreaterThanOrEqual,
            "before" => Op::Before,
            "after" => Op::After,
            "segmentMatch" => Op::SegmentMatch,
            "semVerEqual" => Op::SemVerEqual,
            "semVerGreaterThan" => Op::SemVerGreaterThan,
            "semVerLessThan" => Op::SemVerLessThan,
            _ => Op::Unknown(name),
        }
    }
}

impl From<Op> for String {
    fn from(op: Op) -> Self {
        match op {
            Op::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl Op {
    pub fn as_str(&self) -> &str {
        match self {
            Op::In => "in",
            Op::StartsWith => "startsWith",
            Op::EndsWith => "endsWith",
            Op::Contains => "contains",
            Op::Matches => "matches",
            Op::LessThan => "lessThan",
            Op::LessThanOrEqual => "lessThanOrEqual",
            Op::GreaterThan => "greaterThan",
            Op::GreaterThanOrEqual => "greaterThanOrEqual",
            Op::Before => "before",
            Op::After => "after",
            Op::SegmentMatch => "segmentMatch",
            Op::SemVerEqual => "semVerEqual",
            Op::SemVerGreaterThan => "semVerGreaterThan",
            Op::SemVerLessThan => "semVerLessThan",
            Op::Unknown(name) => name,
        }
    }
}

impl Clause {
    pub(crate) fn matches(&self, context: &Context, store: &dyn Store) -> bool {
        if let Op::SegmentMatch = self.op {
            self.matches_segment(context, store)
        } else {
            self.matches_non_segment(context)
        }
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    pub(crate) fn is_segment_match(&self) -> bool {
        self.op == Op::SegmentMatch
    }

    /// Keys of the segments a segmentMatch clause refers to; empty for any other operator.
    pub(crate) fn segment_keys(&self) -> impl Iterator<Item = &str> {
        let values: &[AttributeValue] = if self.is_segment_match() {
            &self.values
        } else {
            &[]
        };
        values.iter().filter_map(AttributeValue::as_str)
    }

    fn matches_segment(&self, context: &Context, store: &dyn Store) -> bool {
        let any_match = self.segment_keys().any(|segment_key| {
            store
                .segment(segment_key)
                .map(|segment| segment.contains(context))
                .unwrap_or(false)
        });
        self.maybe_negate(any_match)
    }

    pub(crate) fn matches_non_segment(&self, context: &Context) -> bool {
        let context_val = match context.value_of(&self.attribute) {
            Some(v) => v,
            None => return false,
        };

        let any_match = context_val.find(|context_val_v| {
            self.values
                .iter()
                .any(|clause_val| self.op.matches(context_val_v, clause_val))
        });

        self.maybe_negate(any_match.is_some())
    }

    #[cfg(test)]
    pub(crate) fn new_match(attribute: &str, value: AttributeValue) -> Self {
        Self {
            attribute: attribute.to_string(),
            negate: false,
            op: Op::Matches,
            values: vec![value],
        }
    }

    #[cfg(test)]
    pub(crate) fn new_segment_match(segment_keys: Vec<&str>) -> Self {
        Self {
            attribute: "key".to_string(),
            negate: false,
            op: Op::SegmentMatch,
            values: segment_keys.into_iter().map(AttributeValue::from).collect(),
        }
    }
}

impl FlagRule {
    pub fn matches(&self, context: &Context, store: &dyn Store) -> bool {
        // rules match if _all_ of their clauses do
        self.clauses
            .iter()
            .all(|clause| clause.matches(context, store))
    }

    #[cfg(test)]
    pub(crate) fn new_segment_match(segment_keys: Vec<&str>) -> Self {
        Self {
            id: "rule".to_string(),
            clauses: vec![Clause::new_segment_match(segment_keys)],
            variation_or_rollout: VariationOrRollout::Variation { variation: 1 },
            track_events: false,
        }
    }
}

impl Op {
    /// Applies the operator to a context value and a clause value. Values of a type the operator
    /// does not handle never match.
    pub(crate) fn matches(&self, lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
        match self {
            Op::In => lhs == rhs,

            // string ops
            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::Matches => string_op(lhs, rhs, |l, r| match Regex::new(r) {
                Ok(re) => re.is_match(l),
                Err(e) => {
                    warn!("Invalid regex for 'matches' operator ({}): {}", e, r);
                    false
                }
            }),

            // numeric ops
            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),

            Op::Before => time_op(lhs, rhs, |l, r| l < r),
            Op::After => time_op(lhs, rhs, |l, r| l > r),

            Op::SemVerEqual => semver_op(lhs, rhs, |l, r| l == r),
            Op::SemVerLessThan => semver_op(lhs, rhs, |l, r| l < r),
            Op::SemVerGreaterThan => semver_op(lhs, rhs, |l, r| l > r),

            Op::SegmentMatch => {
                warn!("segmentMatch operator should be special-cased, shouldn't get here");
                false
            }
            Op::Unknown(name) => {
                warn!("unknown clause operator '{}'", name);
                false
            }
        }
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn time_op<F: Fn(chrono::DateTime<Utc>, chrono::DateTime<Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.as_datetime(), rhs.as_datetime()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn semver_op<F: Fn(semver::Version, semver::Version) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.as_semver(), rhs.as_semver()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}
