use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;

use crate::context::Context;
use crate::eval::{self, Detail, Reason};
use crate::rule::FlagRule;
use crate::util::is_false;
use crate::value::AttributeValue;
use crate::variation::{BucketResult, VariationIndex, VariationOrRollout};

/// Flag describes an individual feature flag.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    /// The unique string key of the feature flag.
    pub key: String,
    /// Version is an integer that is incremented each time the flag is changed.
    #[serde(default)]
    pub version: u64,

    pub(crate) on: bool,

    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    pub(crate) fallthrough: VariationOrRollout,
    pub(crate) off_variation: Option<VariationIndex>,
    pub(crate) variations: Vec<AttributeValue>,

    #[serde(flatten)]
    client_visibility: ClientVisibility,

    #[serde(default)]
    pub(crate) salt: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
}

// This struct exists only so we can add some custom deserialization logic to account for the
// potential presence of a client_side field in lieu of the client_side_availability field.
#[derive(Clone, Debug, Default, PartialEq)]
struct ClientVisibility {
    client_side_availability: ClientSideAvailability,
}

impl<'de> Deserialize<'de> for ClientVisibility {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            ClientSide,
            ClientSideAvailability,
        }

        struct ClientVisibilityVisitor;

        impl<'de> Visitor<'de> for ClientVisibilityVisitor {
            type Value = ClientVisibility;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct ClientVisibility")
            }

            fn visit_map<V>(self, mut map: V) -> Result<ClientVisibility, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut client_side: Option<Option<bool>> = None;
                let mut client_side_availability: Option<ClientSideAvailability> = None;

                while let Some(k) = map.next_key()? {
                    match k {
                        Field::ClientSide => client_side = Some(map.next_value()?),
                        Field::ClientSideAvailability => {
                            client_side_availability = Some(map.next_value()?)
                        }
                    }
                }

                let client_side_availability = match client_side_availability {
                    Some(mut csa) => {
                        csa.explicit = true;
                        csa
                    }
                    _ => ClientSideAvailability {
                        using_environment_id: client_side.flatten().unwrap_or_default(),
                        using_mobile_key: true,
                        explicit: false,
                    },
                };

                Ok(ClientVisibility {
                    client_side_availability,
                })
            }
        }

        const FIELDS: &[&str] = &["clientSide", "clientSideAvailability"];
        deserializer.deserialize_struct("ClientVisibility", FIELDS, ClientVisibilityVisitor)
    }
}

impl Serialize for ClientVisibility {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let csa = &self.client_side_availability;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("clientSide", &csa.using_environment_id)?;
        if csa.explicit {
            map.serialize_entry("clientSideAvailability", csa)?;
        }
        map.end()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Prereq {
    pub(crate) key: String,
    pub(crate) variation: VariationIndex,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub(crate) struct Target {
    pub(crate) values: Vec<String>,
    pub(crate) variation: VariationIndex,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    pub using_mobile_key: bool,
    pub using_environment_id: bool,

    // This field determines if ClientSideAvailability was explicitly included in the JSON payload.
    //
    // If it was, we will use the properities of this new schema over the dated
    // [ClientVisibility::client_side] field.
    #[serde(skip)]
    explicit: bool,
}

impl Default for ClientSideAvailability {
    fn default() -> Self {
        ClientSideAvailability {
            using_mobile_key: true,
            using_environment_id: false,
            explicit: false,
        }
    }
}

impl Flag {
    /// Builds an "on" flag with the given variations that serves `fallthrough` to everyone.
    pub fn new(
        key: impl Into<String>,
        variations: Vec<AttributeValue>,
        fallthrough: VariationIndex,
    ) -> Self {
        Flag {
            key: key.into(),
            version: 0,
            on: true,
            targets: vec![],
            rules: vec![],
            prerequisites: vec![],
            fallthrough: VariationOrRollout::Variation {
                variation: fallthrough,
            },
            off_variation: None,
            variations,
            client_visibility: ClientVisibility::default(),
            salt: String::new(),
            track_events: false,
            track_events_fallthrough: false,
            debug_events_until_date: None,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn variations(&self) -> &[AttributeValue] {
        &self.variations
    }

    pub fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<&AttributeValue> {
        Detail {
            value: self.variations.get(index),
            variation_index: Some(index),
            reason,
        }
        .should_have_value(eval::Error::MalformedFlag)
    }

    pub fn off_value(&self, reason: Reason) -> Detail<&AttributeValue> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Detail::empty(reason),
        }
    }

    /// Whether the flag is visible to client-side SDKs using an environment id. Honours the
    /// newer `clientSideAvailability` object when present and the legacy `clientSide` boolean
    /// otherwise.
    pub fn client_side(&self) -> bool {
        self.using_environment_id()
    }

    pub fn using_environment_id(&self) -> bool {
        self.client_visibility
            .client_side_availability
            .using_environment_id
    }

    pub fn using_mobile_key(&self) -> bool {
        self.client_visibility
            .client_side_availability
            .using_mobile_key
    }

    /// Keys of the flags this flag names as prerequisites, in declared order.
    pub fn prerequisite_keys(&self) -> impl Iterator<Item = &str> {
        self.prerequisites.iter().map(|p| p.key.as_str())
    }

    /// Keys of the segments referenced by `segmentMatch` clauses in this flag's rules.
    pub fn segment_keys(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|rule| rule.clauses.iter())
            .flat_map(|clause| clause.segment_keys())
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRollout,
        context: &Context,
    ) -> Result<BucketResult, eval::Error> {
        vr.variation(&self.key, context, &self.salt)
            .ok_or(eval::Error::MalformedFlag)
    }

    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            _ if reason.is_in_experiment() => true,
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn new_boolean_flag_with_segment_match(segment_keys: Vec<&str>) -> Self {
        Self {
            version: 1,
            rules: vec![FlagRule::new_segment_match(segment_keys)],
            off_variation: Some(0),
            salt: "xyz".to_string(),
            ..Flag::new(
                "feature",
                vec![AttributeValue::Bool(false), AttributeValue::Bool(true)],
                0,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;
    use crate::test_common::TestStore;
    use assert_json_diff::assert_json_eq;
    use spectral::prelude::*;

    use super::Flag;
    use crate::eval::Reason::*;
    use test_case::test_case;

    #[test_case(true)]
    #[test_case(false)]
    fn handles_old_flag_schema(client_side: bool) {
        let json = &format!(
            r#"{{
            "key": "flag",
            "version": 42,
            "on": false,
            "targets": [],
            "rules": [],
            "prerequisites": [],
            "fallthrough": {{"variation": 1}},
            "offVariation": 0,
            "variations": [false, true],
            "clientSide": {},
            "salt": "salty"
        }}"#,
            client_side
        );

        let flag: Flag = serde_json::from_str(json).unwrap();
        let client_side_availability = &flag.client_visibility.client_side_availability;
        assert_eq!(client_side_availability.using_environment_id, client_side);
        assert!(client_side_availability.using_mobile_key);
        assert!(!client_side_availability.explicit);

        assert_eq!(flag.client_side(), client_side);
    }

    #[test_case(true)]
    #[test_case(false)]
    fn handles_new_flag_schema(using_environment_id: bool) {
        let json = &format!(
            r#"{{
            "key": "flag",
            "version": 42,
            "on": false,
            "targets": [],
            "rules": [],
            "prerequisites": [],
            "fallthrough": {{"variation": 1}},
            "offVariation": 0,
            "variations": [false, true],
            "clientSideAvailability": {{
                "usingEnvironmentId": {},
                "usingMobileKey": false
            }},
            "salt": "salty"
        }}"#,
            using_environment_id
        );

        let flag: Flag = serde_json::from_str(json).unwrap();
        let client_side_availability = &flag.client_visibility.client_side_availability;
        assert_eq!(
            client_side_availability.using_environment_id,
            using_environment_id
        );
        assert!(!client_side_availability.using_mobile_key);
        assert!(client_side_availability.explicit);

        assert_eq!(flag.client_side(), using_environment_id);
    }

    #[test]
    fn minimal_flag_uses_defaults() {
        let flag: Flag = serde_json::from_str(
            r#"{"key": "f", "on": true, "fallthrough": {"variation": 0}, "variations": [1]}"#,
        )
        .unwrap();
        assert_that!(flag.version).is_equal_to(0);
        assert_that!(flag.client_side()).is_false();
        assert_that!(flag.using_mobile_key()).is_true();
        assert_that!(flag.off_variation).is_none();
    }

    #[test]
    fn serialize_then_deserialize_is_equal() {
        let store = TestStore::new();
        for key in [
            "flag",
            "flagWithExperiment",
            "flagWithRolloutBucketBy",
            "flagWithSegmentMatchRule",
            "flagWithMalformedRule",
            "flagWithNestedPrereq",
        ] {
            let flag = store.flag(key).unwrap();
            let json = serde_json::to_string(flag).unwrap();
            let parsed: Flag = serde_json::from_str(&json).unwrap();
            assert_that!(&parsed).is_equal_to(flag);
        }
    }

    #[test]
    fn legacy_client_side_serializes_without_availability() {
        let flag: Flag = serde_json::from_str(
            r#"{"key": "f", "version": 3, "on": false, "fallthrough": {"variation": 0},
                "variations": [true], "clientSide": true, "salt": "s"}"#,
        )
        .unwrap();
        assert_json_eq!(
            serde_json::to_value(&flag).unwrap(),
            serde_json::json!({
                "key": "f",
                "version": 3,
                "on": false,
                "targets": [],
                "rules": [],
                "prerequisites": [],
                "fallthrough": {"variation": 0},
                "variations": [true],
                "clientSide": true,
                "salt": "s"
            })
        );
    }

    #[test]
    fn dependency_keys() {
        let store = TestStore::new();
        let flag = store
            .flag("flagWithPrereqWhichDuplicatesSegmentRuleCheck")
            .unwrap();
        assert_that!(flag.prerequisite_keys().collect::<Vec<_>>())
            .is_equal_to(vec!["flagWithSegmentMatchRule"]);
        assert_that!(flag.segment_keys().collect::<Vec<_>>()).is_equal_to(vec!["segment"]);
    }

    #[test]
    fn is_experimentation_enabled() {
        let store = TestStore::new();

        let flag = store.flag("flag").unwrap();
        asserting!("defaults to false")
            .that(&flag.is_experimentation_enabled(&Off))
            .is_false();
        asserting!("false for fallthrough if trackEventsFallthrough is false")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: false,
            }))
            .is_false();

        let flag = store.flag("flagWithRuleExclusion").unwrap();
        asserting!("true for fallthrough if trackEventsFallthrough is true")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: false,
            }))
            .is_true();
        asserting!("true for rule if rule.trackEvents is true")
            .that(&flag.is_experimentation_enabled(&RuleMatch {
                rule_index: 0,
                rule_id: flag.rules[0].id.clone(),
                in_experiment: false,
            }))
            .is_true();

        let flag = store.flag("flagWithExperiment").unwrap();
        asserting!("true for fallthrough if reason says it is")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: true,
            }))
            .is_true();
        asserting!("false for fallthrough if reason says it is")
            .that(&flag.is_experimentation_enabled(&Fallthrough {
                in_experiment: false,
            }))
            .is_false();
        // note this flag doesn't even have a rule - doesn't matter, we go by the reason
        asserting!("true for rule if reason says it is")
            .that(&flag.is_experimentation_enabled(&RuleMatch {
                rule_index: 42,
                rule_id: "lol".into(),
                in_experiment: true,
            }))
            .is_true();
        asserting!("false for rule if reason says it is")
            .that(&flag.is_experimentation_enabled(&RuleMatch {
                rule_index: 42,
                rule_id: "lol".into(),
                in_experiment: false,
            }))
            .is_false();
    }
}
