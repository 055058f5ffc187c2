use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::context::{BucketPrefix, Context};
use crate::util::is_false;

pub type VariationIndex = usize;

#[derive(Debug, PartialEq)]
pub(crate) struct BucketResult {
    pub variation_index: VariationIndex,
    pub in_experiment: bool,
}

impl From<&VariationIndex> for BucketResult {
    fn from(variation_index: &VariationIndex) -> Self {
        BucketResult {
            variation_index: *variation_index,
            in_experiment: false, // single variations are never in an experiment
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

fn is_default_kind(kind: &RolloutKind) -> bool {
    *kind == RolloutKind::Rollout
}

#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default, skip_serializing_if = "is_default_kind")]
    kind: RolloutKind,
    bucket_by: Option<String>,
    variations: Vec<WeightedVariation>,
    seed: Option<i64>,
}

impl Rollout {
    #[cfg(test)]
    pub(crate) fn with_variations<V: Into<Vec<WeightedVariation>>>(variations: V) -> Self {
        Rollout {
            kind: RolloutKind::Rollout,
            bucket_by: None,
            seed: None,
            variations: variations.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[cfg(test)]
    pub(crate) fn bucket_by(mut self, attr: &str) -> Self {
        self.bucket_by = Some(attr.to_string());
        self
    }
}

// This enum is a bit oddly-shaped because data errors may cause the server to emit rules with neither or both of a
// variation or rollout, and we need to treat invalid states with grace (i.e. don't fail deserialization, and
// prefer variation if both are present)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation { variation: VariationIndex },
    Rollout { rollout: Rollout },
    Malformed(serde_json::Value),
}

pub(crate) type VariationWeight = f64;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: VariationWeight,
    #[serde(default, skip_serializing_if = "is_false")]
    pub untracked: bool,
}

impl WeightedVariation {
    #[cfg(test)]
    pub(crate) fn new(variation: VariationIndex, weight: VariationWeight) -> Self {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    fn as_bucket_result(&self, is_experiment: bool) -> BucketResult {
        BucketResult {
            variation_index: self.variation,
            in_experiment: is_experiment && !self.untracked,
        }
    }
}

impl VariationOrRollout {
    /// Picks a variation for `context`. Returns None when the data is malformed, including a
    /// rollout with no buckets.
    pub(crate) fn variation(
        &self,
        flag_key: &str,
        context: &Context,
        salt: &str,
    ) -> Option<BucketResult> {
        match self {
            VariationOrRollout::Variation { variation: var } => Some(var.into()),
            VariationOrRollout::Rollout {
                rollout:
                    Rollout {
                        kind,
                        bucket_by,
                        variations,
                        seed,
                    },
            } => {
                let is_experiment = kind == &RolloutKind::Experiment;

                let prefix = match seed {
                    Some(seed) => BucketPrefix::Seed(*seed),
                    None => BucketPrefix::KeyAndSalt(flag_key, salt),
                };

                let bucket = context.bucket(bucket_by.as_deref(), prefix);
                let mut sum = 0.0;
                for variation in variations {
                    sum += variation.weight / 100_000.0;
                    if bucket < sum {
                        return Some(variation.as_bucket_result(is_experiment));
                    }
                }
                // The weights didn't add up to 100%, or floating point drift left the context
                // just past the end: use the last bucket.
                variations
                    .last()
                    .map(|var| var.as_bucket_result(is_experiment))
            }
            VariationOrRollout::Malformed(_) => None,
        }
    }
}
