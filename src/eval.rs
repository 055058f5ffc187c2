use std::collections::HashSet;

use log::warn;
use serde::Serialize;

use crate::context::Context;
use crate::flag::{Flag, Target};
use crate::store::Store;
use crate::value::AttributeValue;
use crate::variation::{BucketResult, VariationIndex};

/// A struct representing the results of an evaluation on a prerequisite flag.
#[derive(Clone, Debug)]
pub struct PrerequisiteEvent {
    /// String representing the [crate::Flag::key] of the original flag being evaluated.
    pub target_flag_key: String,
    /// The [crate::Context] provided during the evaluation process.
    pub context: Context,
    /// The prerequisite [crate::Flag] that was evaluated.
    pub prerequisite_flag: Flag,
    /// The result of calling [evaluate] on the [PrerequisiteEvent::prerequisite_flag].
    pub prerequisite_result: Detail<AttributeValue>,
}

/// Trait used by [evaluate] to record the result of prerequisite flag evaluations.
pub trait PrerequisiteEventRecorder {
    /// Record the results of a prerequisite flag evaluation.
    fn record(&self, event: PrerequisiteEvent);
}

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;

pub(crate) struct EvaluationStack {
    pub(crate) prerequisite_flag_chain: HashSet<String>,
    /// Set once a prerequisite cycle is found. A cycle fails the whole evaluation.
    pub(crate) cycle_detected: bool,
}

impl EvaluationStack {
    fn new() -> Self {
        Self {
            prerequisite_flag_chain: HashSet::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
            cycle_detected: false,
        }
    }
}

impl Default for EvaluationStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a feature flag for the specified [Context].
///
/// The evaluator does not know anything about analytics events; generating any appropriate
/// analytics events is the responsibility of the caller. The caller can provide an optional
/// [PrerequisiteEventRecorder] which will be notified of every prerequisite flag evaluated along
/// the way, whatever its outcome.
///
/// Every flag reachable from `flag` is read from `store`, so the caller should pass a store that
/// does not change underneath a single evaluation.
pub fn evaluate<'a>(
    store: &'a dyn Store,
    flag: &'a Flag,
    context: &'a Context,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
) -> Detail<&'a AttributeValue> {
    if !context.is_valid() {
        warn!("context with empty key cannot be evaluated for flag {}", flag.key);
        return Detail::err(Error::UserNotSpecified);
    }

    let mut evaluation_stack = EvaluationStack::default();
    evaluate_internal(
        store,
        flag,
        context,
        prerequisite_event_recorder,
        &mut evaluation_stack,
    )
}

fn evaluate_internal<'a>(
    store: &'a dyn Store,
    flag: &'a Flag,
    context: &'a Context,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
    evaluation_stack: &mut EvaluationStack,
) -> Detail<&'a AttributeValue> {
    if !flag.on {
        return flag.off_value(Reason::Off);
    }

    if evaluation_stack.prerequisite_flag_chain.contains(&flag.key) {
        warn!("prerequisite relationship to {} caused a circular reference; this is probably a temporary condition due to an incomplete update", flag.key);
        evaluation_stack.cycle_detected = true;
        return Detail::err(Error::MalformedFlag);
    }

    evaluation_stack
        .prerequisite_flag_chain
        .insert(flag.key.clone());

    for prereq in &flag.prerequisites {
        let prereq_flag = match store.flag(&prereq.key) {
            Some(prereq_flag) => prereq_flag,
            None => {
                evaluation_stack.prerequisite_flag_chain.remove(&flag.key);
                return flag.off_value(Reason::PrerequisiteFailed {
                    prerequisite_key: prereq.key.to_string(),
                });
            }
        };

        if evaluation_stack
            .prerequisite_flag_chain
            .contains(&prereq_flag.key)
        {
            warn!(
                "flag {} has a circular prerequisite through {}",
                flag.key, prereq_flag.key
            );
            evaluation_stack.cycle_detected = true;
            return Detail::err(Error::MalformedFlag);
        }

        let prerequisite_result = evaluate_internal(
            store,
            prereq_flag,
            context,
            prerequisite_event_recorder,
            evaluation_stack,
        );

        if let Some(recorder) = prerequisite_event_recorder {
            recorder.record(PrerequisiteEvent {
                target_flag_key: flag.key.clone(),
                context: context.clone(),
                prerequisite_flag: prereq_flag.clone(),
                prerequisite_result: prerequisite_result.clone().map(|v| v.clone()),
            });
        }

        if evaluation_stack.cycle_detected {
            return Detail::err(Error::MalformedFlag);
        }

        if !prereq_flag.on || prerequisite_result.variation_index != Some(prereq.variation) {
            evaluation_stack.prerequisite_flag_chain.remove(&flag.key);
            return flag.off_value(Reason::PrerequisiteFailed {
                prerequisite_key: prereq.key.to_string(),
            });
        }
    }

    evaluation_stack.prerequisite_flag_chain.remove(&flag.key);

    if let Some(variation_index) = any_target_match_variation(context, flag) {
        return flag.variation(variation_index, Reason::TargetMatch);
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        if rule.matches(context, store) {
            let result = flag.resolve_variation_or_rollout(&rule.variation_or_rollout, context);
            return match result {
                Ok(BucketResult {
                    variation_index,
                    in_experiment,
                }) => {
                    let reason = Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    };
                    flag.variation(variation_index, reason)
                }
                Err(e) => {
                    warn!("rule {} of flag {} is malformed", rule_index, flag.key);
                    Detail::err(e)
                }
            };
        }
    }

    let result = flag.resolve_variation_or_rollout(&flag.fallthrough, context);
    match result {
        Ok(BucketResult {
            variation_index,
            in_experiment,
        }) => {
            let reason = Reason::Fallthrough { in_experiment };
            flag.variation(variation_index, reason)
        }
        Err(e) => {
            warn!("fallthrough of flag {} is malformed", flag.key);
            Detail::err(e)
        }
    }
}

fn any_target_match_variation(context: &Context, flag: &Flag) -> Option<VariationIndex> {
    flag.targets
        .iter()
        .find_map(|target| target_match_variation(context, target))
}

fn target_match_variation(context: &Context, target: &Target) -> Option<VariationIndex> {
    let key = context.key();
    if target.values.iter().any(|value| value == key) {
        Some(target.variation)
    } else {
        None
    }
}

/// A Detail instance is returned from [evaluate], combining the result of a flag evaluation with
/// an explanation of how it was calculated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The result of the flag evaluation. This will be either one of the flag's variations or None
    /// if no appropriate fallback value was configured.
    pub value: Option<T>,

    /// The index of the returned value within the flag's list of variations, e.g. 0 for the first
    /// variation. This is an Option because it is possible for the value to be undefined (there is
    /// no variation index if the application default value was returned due to an error in
    /// evaluation) which is different from a value of 0.
    pub variation_index: Option<VariationIndex>,

    /// A reason struct describing the main factor that influenced the flag evaluation value.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// Returns a detail with value and variation_index of None.
    ///
    /// If a flag does not have an appropriate fallback value, the [Detail::value] and
    /// [Detail::variation_index] must be None. In each case, the [Detail::reason] will be set to
    /// the reason provided to this method.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
        }
    }

    /// Returns a detail response using the provided default as the value and a variation_index
    /// of None.
    ///
    /// If the variation methods detect some error condition, they fall back to the caller's
    /// default value. The provided error will be included as part of the [Detail::reason], and
    /// the [Detail::variation_index] will be set to None.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            variation_index: None,
            reason: Reason::Error { error },
        }
    }

    /// Returns a detail response using the provided error as the [Detail::reason].
    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// Returns a new instance of this detail with the provided function `f` applied to
    /// [Detail::value].
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Sets the [Detail::reason] to the provided error if the current detail instance does not
    /// have a value set.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }

    /// Returns a new instance of detail with the provided function `f` applied to
    /// [Detail::value] if it exists.
    ///
    /// [Detail::value] may or may not be set. If it is not set, the result carries `default`
    /// with the original reason.
    ///
    /// If it is set, this method will apply the provided function `f` to the value. If the method
    /// `f` returns None, this method will return an error [Detail] holding `default`. See
    /// [Detail::err_default]. Otherwise, a [Detail] instance will be returned with the result of
    /// the `f` application.
    pub fn try_map<U, F>(self, f: F, default: U, e: Error) -> Detail<U>
    where
        F: FnOnce(T) -> Option<U>,
    {
        let value = match self.value {
            Some(value) => value,
            None => {
                return Detail {
                    value: Some(default),
                    variation_index: self.variation_index,
                    reason: self.reason,
                }
            }
        };
        match f(value) {
            Some(v) => Detail {
                value: Some(v),
                variation_index: self.variation_index,
                reason: self.reason,
            },
            None => Detail::err_default(e, default),
        }
    }

    /// Set the [Detail::value] to `default` if it does not exist.
    ///
    /// Callers always want an evaluation result. This method helps ensure that if a
    /// [Detail::value] is None, we can update it with the provided default.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
            // N.B. reason remains untouched: an off flag without an off variation still reports OFF
        }
        self
    }

    /// Set the [Detail::value] to `default` if it does not exist.
    ///
    /// This method accomplishes the same thing as [Detail::or] but allows the default value to be
    /// provided through the result of a callback. This helps reduce computation where an
    /// evaluation default value might be costly to calculate and is likely infrequently used.
    pub fn or_else<F>(mut self, default: F) -> Detail<T>
    where
        F: Fn() -> T,
    {
        if self.value.is_none() {
            self.value = Some(default());
            self.variation_index = None;
        }
        self
    }
}

/// Reason describes the reason that a flag evaluation produced a particular value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// Off indicates that the flag was off and therefore returned its configured off value.
    Off,
    /// TargetMatch indicates that context key was specifically targeted for this flag.
    TargetMatch,
    /// RuleMatch indicates that the context matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the [crate::FlagRule] that was matched.
        rule_index: usize,
        #[serde(skip_serializing_if = "String::is_empty")]
        /// The id property of the [crate::FlagRule::id] that was matched.
        rule_id: String,
        /// True if the variation was determined by a [crate::Rollout] whose kind was
        /// [crate::RolloutKind::Experiment] and the selected [crate::WeightedVariation] was not
        /// untracked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// PrerequisiteFailed indicates that the flag was considered off because it had at
    /// least one prerequisite flag that either was off or did not return the desired variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// The key of the prerequisite flag that failed.
        prerequisite_key: String,
    },
    /// Fallthrough indicates that the flag was on but the context did not match any targets
    /// or rules.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        /// Same meaning as for [Reason::RuleMatch].
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// Error indicates that the flag could not be evaluated, e.g. because it does not
    /// exist or due to an unexpected error. In this case the result value will be the default value
    /// that the caller passed in.
    Error {
        /// An error representing the [Reason::Error].
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    /// This method determines whether or not the provided [Reason] is considered to be part of an
    /// ongoing experiment.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            Reason::Fallthrough { in_experiment } => *in_experiment,
            _ => false,
        }
    }
}

/// Error is returned via a [Reason::Error] when a flag could not be evaluated, and provides
/// information about why.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// ClientNotReady indicates that the caller tried to evaluate a flag before the store had
    /// received its first full data set.
    ClientNotReady,
    /// FlagNotFound indicates that the caller provided a flag key that did not match any
    /// known flag.
    FlagNotFound,
    /// UserNotSpecified indicates that no context was given, or that it had an empty key.
    UserNotSpecified,
    /// MalformedFlag indicates that there was an internal inconsistency in the flag data,
    /// e.g. a rule specified a nonexistent variation.
    MalformedFlag,
    /// WrongType indicates that the result value was not of the requested type, e.g. you
    /// called bool_variation but the value was an integer.
    WrongType,
    /// Exception indicates that an unexpected error stopped flag evaluation; check the
    /// log for details.
    Exception,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use crate::test_common::{InMemoryPrerequisiteEventRecorder, TestStore};
    use crate::variation::VariationOrRollout;
    use crate::value::AttributeValue::{Bool, String as Str};
    use proptest::prelude::*;
    use spectral::prelude::*;
    use std::cell::RefCell;

    #[test]
    fn test_eval_flag_basic() {
        let store = TestStore::new();
        let alice = Context::with_key("alice").build(); // not targeted
        let bob = Context::with_key("bob").build(); // targeted
        let mut flag = store.flag("flagWithTarget").unwrap().clone();

        assert!(!flag.on);
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.variation_index).contains_value(0);
        assert_that!(detail.reason).is_equal_to(&Reason::Off);

        assert_that!(evaluate(&store, &flag, &bob, None)).is_equal_to(&detail);

        // flip off variation
        flag.off_variation = Some(1);
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert_that!(detail.variation_index).contains_value(1);

        // off variation unspecified
        flag.off_variation = None;
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).is_none();
        assert_that!(detail.variation_index).is_none();
        assert_that!(detail.reason).is_equal_to(&Reason::Off);

        // flip targeting on
        flag.on = true;
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert_that!(detail.variation_index).contains_value(1);
        assert_that!(detail.reason).is_equal_to(&Reason::Fallthrough {
            in_experiment: false,
        });

        let detail = evaluate(&store, &flag, &bob, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.variation_index).contains_value(0);
        assert_that!(detail.reason).is_equal_to(&Reason::TargetMatch);

        // flip default variation
        flag.fallthrough = VariationOrRollout::Variation { variation: 0 };
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.variation_index).contains_value(0);

        // bob's reason should still be TargetMatch even though his value is now the default
        let detail = evaluate(&store, &flag, &bob, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.variation_index).contains_value(0);
        assert_that!(detail.reason).is_equal_to(&Reason::TargetMatch);
    }

    #[test]
    fn test_eval_with_matches_op_groups() {
        let store = TestStore::new();
        let alice = Context::with_key("alice").build(); // not targeted
        let bob = Context::with_key("bob")
            .set_value("groups", AttributeValue::Array(vec!["my-group".into()]))
            .build(); // targeted
        let flag = store.flag("flagWithMatchesOpOnGroups").unwrap();

        let detail = evaluate(&store, flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert_that!(detail.reason).is_equal_to(&Reason::Fallthrough {
            in_experiment: false,
        });

        let detail = evaluate(&store, flag, &bob, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.variation_index).contains_value(0);
        assert_that!(detail.reason).is_equal_to(&Reason::RuleMatch {
            rule_index: 0,
            rule_id: "6a7755ac-e47a-40ea-9579-a09dd5f061bd".into(),
            in_experiment: false,
        });
    }

    #[test]
    fn test_prerequisite_events_are_captured() {
        let recorder = InMemoryPrerequisiteEventRecorder {
            events: RefCell::new(Vec::new()),
        };
        let store = TestStore::new();
        let alice = Context::with_key("alice").build();
        let flag = store.flag("flagWithNestedPrereq").unwrap();

        let _ = evaluate(&store, flag, &alice, Some(&recorder));
        assert_that!(*recorder.events.borrow()).has_length(2);

        let event = &recorder.events.borrow()[0];
        assert_eq!("flagWithSatisfiedPrereq", event.target_flag_key);
        assert_eq!("prereq", event.prerequisite_flag.key);

        let event = &recorder.events.borrow()[1];
        assert_eq!("flagWithNestedPrereq", event.target_flag_key);
        assert_eq!("flagWithSatisfiedPrereq", event.prerequisite_flag.key);
    }

    #[test]
    fn test_failed_prerequisite_still_emits_event() {
        let recorder = InMemoryPrerequisiteEventRecorder {
            events: RefCell::new(Vec::new()),
        };
        let store = TestStore::new();
        let flag = store.flag("flagWithOffPrereq").unwrap();
        let alice = Context::with_key("alice").build();

        let detail = evaluate(&store, flag, &alice, Some(&recorder));
        assert_that!(detail.reason).is_equal_to(Reason::PrerequisiteFailed {
            prerequisite_key: "offPrereq".to_string(),
        });

        let events = recorder.events.borrow();
        assert_that!(*events).has_length(1);
        assert_eq!("offPrereq", events[0].prerequisite_flag.key);
        assert_that!(events[0].prerequisite_result.reason).is_equal_to(Reason::Off);
    }

    #[test]
    fn test_eval_flag_rules() {
        let store = TestStore::new();
        let alice = Context::with_key("alice").build();
        let bob = Context::with_key("bob")
            .set_value("team", "Avengers".into())
            .build();

        let mut flag = store.flag("flagWithInRule").unwrap().clone();

        assert!(!flag.on);
        for context in &[&alice, &bob] {
            let detail = evaluate(&store, &flag, context, None);
            assert_that!(detail.value).contains_value(&Bool(false));
            assert_that!(detail.variation_index).contains_value(0);
            assert_that!(detail.reason).is_equal_to(&Reason::Off);
        }

        // flip targeting on
        flag.on = true;
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert_that!(detail.variation_index).contains_value(1);
        assert_that!(detail.reason).is_equal_to(&Reason::Fallthrough {
            in_experiment: false,
        });

        let detail = evaluate(&store, &flag, &bob, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.variation_index).contains_value(0);
        assert_that!(detail.reason).is_equal_to(&Reason::RuleMatch {
            rule_id: "in-rule".to_string(),
            rule_index: 0,
            in_experiment: false,
        });
    }

    #[test]
    fn test_eval_flag_unsatisfied_prereq() {
        let store = TestStore::new();
        let flag = store.flag("flagWithMissingPrereq").unwrap();
        assert!(flag.on);

        let alice = Context::with_key("alice").build();
        let bob = Context::with_key("bob").build();

        for context in &[&alice, &bob] {
            let detail = evaluate(&store, flag, context, None);
            assert_that!(detail.value).contains_value(&Bool(false));
            assert_that!(detail.reason).is_equal_to(&Reason::PrerequisiteFailed {
                prerequisite_key: "badPrereq".to_string(),
            });
        }
    }

    #[test]
    fn test_eval_flag_off_prereq() {
        let store = TestStore::new();
        let flag = store.flag("flagWithOffPrereq").unwrap();
        assert!(flag.on);

        let alice = Context::with_key("alice").build();

        let detail = evaluate(&store, flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(&Reason::PrerequisiteFailed {
            prerequisite_key: "offPrereq".to_string(),
        });
    }

    #[test]
    fn test_eval_flag_satisfied_prereq() {
        let mut store = TestStore::new();
        let flag = store.flag("flagWithSatisfiedPrereq").unwrap().clone();

        let alice = Context::with_key("alice").build();
        let bob = Context::with_key("bob").build();

        let detail = evaluate(&store, &flag, &alice, None);
        asserting!("alice should pass prereq and see fallthrough")
            .that(&detail.value)
            .contains_value(&Bool(true));
        let detail = evaluate(&store, &flag, &bob, None);
        asserting!("bob should see prereq failed due to target")
            .that(&detail.value)
            .contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::PrerequisiteFailed {
            prerequisite_key: "prereq".to_string(),
        });

        // prerequisite off
        store.update_flag("prereq", |flag| flag.on = false);
        for context in &[&alice, &bob] {
            let detail = evaluate(&store, &flag, context, None);
            assert_that!(detail.value).contains_value(&Bool(false));
            assert_that!(detail.reason).is_equal_to(&Reason::PrerequisiteFailed {
                prerequisite_key: "prereq".to_string(),
            });
        }
    }

    #[test]
    fn test_eval_flag_segments() {
        let store = TestStore::new();
        let flag = store.flag("flagWithSegmentMatchRule").unwrap();

        let alice = Context::with_key("alice").build();
        let bob = Context::with_key("bob").build();

        let detail = evaluate(&store, flag, &alice, None);
        asserting!("alice is in segment, should see false with RuleMatch")
            .that(&detail.value)
            .contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::RuleMatch {
            rule_id: "match-rule".to_string(),
            rule_index: 0,
            in_experiment: false,
        });
        let detail = evaluate(&store, flag, &bob, None);
        asserting!("bob is not in segment and should see fallthrough")
            .that(&detail.value)
            .contains_value(&Bool(true));
        assert_that!(detail.reason).is_equal_to(Reason::Fallthrough {
            in_experiment: false,
        });
    }

    #[test]
    fn test_flag_has_prereq_which_duplicates_segment_rule() {
        let store = TestStore::new();
        let flag = store
            .flag("flagWithPrereqWhichDuplicatesSegmentRuleCheck")
            .unwrap();

        let alice = Context::with_key("alice").build();

        let mut evaluation_stack = EvaluationStack::default();
        let detail = evaluate_internal(&store, flag, &alice, None, &mut evaluation_stack);
        asserting!("alice is in segment, should see false with RuleMatch")
            .that(&detail.value)
            .contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::RuleMatch {
            rule_id: "match-rule".to_string(),
            rule_index: 0,
            in_experiment: false,
        });
        assert!(evaluation_stack.prerequisite_flag_chain.is_empty());
    }

    // Flag A
    //   Flag B
    //     Flag A
    #[test]
    fn test_simple_prereq_cycle() {
        let flag_json = r#"{
            "flagA": {
                "key": "flagA",
                "salt": "salty",
                "prerequisites": [{
                    "key": "flagB",
                    "variation": 0
                }],
                "on": true,
                "fallthrough": {"variation": 0},
                "offVariation": 1,
                "variations": [true, false]
            },
            "flagB": {
                "key": "flagB",
                "salt": "salty",
                "prerequisites": [{
                    "key": "flagA",
                    "variation": 0
                }],
                "on": true,
                "fallthrough": {"variation": 0},
                "offVariation": 1,
                "variations": [true, false]
            }
        }"#;
        let store = TestStore::new_from_json_str(flag_json, "{}");
        let flag = store.flag("flagA").unwrap();

        let alice = Context::with_key("alice").build();

        let detail = evaluate(&store, flag, &alice, None);
        assert_that!(detail.value).is_none();
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    // Flag A
    //   Flag B
    //   Flag C
    //     Flag B
    #[test]
    fn test_eval_flag_with_first_prereq_as_prereq_of_second_prereq() {
        let store = TestStore::new();
        let flag = store
            .flag("flagWithFirstPrereqAsPrereqToSecondPrereq")
            .unwrap();

        let alice = Context::with_key("alice").build();
        let bob = Context::with_key("bob").build();

        let mut evaluation_stack = EvaluationStack::default();
        let detail = evaluate_internal(&store, flag, &alice, None, &mut evaluation_stack);
        asserting!("alice should pass prereq and see fallthrough")
            .that(&detail.value)
            .contains_value(&Bool(true));
        assert!(evaluation_stack.prerequisite_flag_chain.is_empty());

        let detail = evaluate(&store, flag, &bob, None);
        asserting!("bob should see prereq failed due to target")
            .that(&detail.value)
            .contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::PrerequisiteFailed {
            prerequisite_key: "prereq".to_string(),
        });
    }

    // Flag A
    //   Flag B
    //     Flag C
    // Flag C
    //   Flag A
    #[test]
    fn test_prereq_cycle_across_three_flags() {
        let flag_json = r#"{
            "flagA": {
                "key": "flagA",
                "salt": "salty",
                "prerequisites": [{"key": "flagB", "variation": 0}],
                "on": true,
                "fallthrough": {"variation": 0},
                "offVariation": 1,
                "variations": [true, false]
            },
            "flagB": {
                "key": "flagB",
                "salt": "salty",
                "prerequisites": [{"key": "flagC", "variation": 0}],
                "on": true,
                "fallthrough": {"variation": 0},
                "offVariation": 1,
                "variations": [true, false]
            },
            "flagC": {
                "key": "flagC",
                "salt": "salty",
                "prerequisites": [{"key": "flagA", "variation": 0}],
                "on": true,
                "fallthrough": {"variation": 0},
                "offVariation": 1,
                "variations": [true, false]
            }
        }"#;
        let store = TestStore::new_from_json_str(flag_json, "{}");
        let flag = store.flag("flagA").unwrap();

        let alice = Context::with_key("alice").build();

        let detail = evaluate(&store, flag, &alice, None);
        assert_that!(detail.value).is_none();
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    // Flag A Segment A
    // Flag B Segment A
    #[test]
    fn test_flag_and_prereq_share_segment_check() {
        let flag_json = r#"{
            "flagA": {
                "key": "flagA",
                "rules": [{
                    "variation": 0,
                    "id": "rule-a",
                    "clauses": [{
                        "attribute": "key",
                        "negate": false,
                        "op": "segmentMatch",
                        "values": ["segmentA"]
                    }]
                }],
                "salt": "salty",
                "prerequisites": [{"key": "flagB", "variation": 0}],
                "on": true,
                "fallthrough": {"variation": 1},
                "offVariation": 1,
                "variations": [true, false]
            },
            "flagB": {
                "key": "flagB",
                "rules": [{
                    "variation": 0,
                    "id": "rule-b",
                    "clauses": [{
                        "attribute": "key",
                        "negate": false,
                        "op": "segmentMatch",
                        "values": ["segmentA"]
                    }]
                }],
                "salt": "salty",
                "on": true,
                "fallthrough": {"variation": 1},
                "offVariation": 1,
                "variations": [true, false]
            }
        }"#;
        let segment_json = r#"{
            "segmentA": {
                "key": "segmentA",
                "included": ["alice"],
                "salt": "salty",
                "version": 1
            }
        }"#;
        let store = TestStore::new_from_json_str(flag_json, segment_json);
        let flag = store.flag("flagA").unwrap();

        let alice = Context::with_key("alice").build();
        let detail = evaluate(&store, flag, &alice, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert_that!(detail.reason).is_equal_to(Reason::RuleMatch {
            rule_id: "rule-a".to_string(),
            rule_index: 0,
            in_experiment: false,
        });

        let bob = Context::with_key("bob").build();
        let detail = evaluate(&store, flag, &bob, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::PrerequisiteFailed {
            prerequisite_key: "flagB".to_string(),
        });
    }

    #[test]
    fn test_rollout_flag() {
        let store = TestStore::new();
        let flag = store.flag("flagWithRolloutBucketBy").unwrap();

        let context = Context::with_key("anonymous")
            .set_value("platform", "aem".into())
            .set_value("ld_quid", "d4ad12cb-392b-4fce-b214-843ad625d6f8".into())
            .build();

        let detail = evaluate(&store, flag, &context, None);
        assert_that!(detail.value).contains_value(&Str("rollout1".to_string()));
    }

    #[test]
    fn test_experiment_flag() {
        let store = TestStore::new();
        let flag = store.flag("flagWithExperiment").unwrap();

        let user_a = Context::with_key("userKeyA").build();
        let detail = evaluate(&store, flag, &user_a, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert!(detail.reason.is_in_experiment());

        let user_b = Context::with_key("userKeyB").build();
        let detail = evaluate(&store, flag, &user_b, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert!(detail.reason.is_in_experiment());

        let user_c = Context::with_key("userKeyC").build();
        let detail = evaluate(&store, flag, &user_c, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert!(!detail.reason.is_in_experiment());
    }

    #[test]
    fn test_malformed_rule() {
        let store = TestStore::new();
        let mut flag = store.flag("flagWithMalformedRule").unwrap().clone();

        let user_a = Context::with_key("no").build();
        let user_b = Context::with_key("yes").build();

        let detail = evaluate(&store, &flag, &user_a, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::Off);

        let detail = evaluate(&store, &flag, &user_b, None);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(Reason::Off);

        flag.on = true;

        let detail = evaluate(&store, &flag, &user_a, None);
        assert_that!(detail.value).contains_value(&Bool(true));
        assert_that!(detail.reason).is_equal_to(Reason::Fallthrough {
            in_experiment: false,
        });

        let detail = evaluate(&store, &flag, &user_b, None);
        assert_that!(detail.value).is_none();
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    #[test]
    fn out_of_range_variation_is_malformed() {
        let store = TestStore::new();
        let mut flag = store.flag("flagWithTarget").unwrap().clone();
        flag.on = true;
        flag.fallthrough = VariationOrRollout::Variation { variation: 5 };

        let alice = Context::with_key("alice").build();
        let detail = evaluate(&store, &flag, &alice, None);
        assert_that!(detail.value).is_none();
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    #[test]
    fn empty_context_key_is_user_not_specified() {
        let store = TestStore::new();
        let flag = store.flag("flagWithTarget").unwrap();

        let keyless = Context::with_key("").build();
        let detail = evaluate(&store, flag, &keyless, None);
        assert_that!(detail.value).is_none();
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::UserNotSpecified,
        });
    }

    #[test]
    fn off_flag_serves_off_variation() {
        let mut flag = Flag::new("off", vec!["a".into(), "b".into()], 1);
        flag.on = false;
        flag.off_variation = Some(0);
        let store = TestStore::new_from_json_str("{}", "{}");

        let context = Context::with_key("u").build();
        let detail = evaluate(&store, &flag, &context, None);
        assert_that!(detail).is_equal_to(Detail {
            value: Some(&Str("a".into())),
            variation_index: Some(0),
            reason: Reason::Off,
        });
    }

    #[test]
    fn target_hit() {
        let flag: Flag = serde_json::from_str(
            r#"{
                "key": "targeted",
                "on": true,
                "variations": [false, true],
                "targets": [{"variation": 1, "values": ["u"]}],
                "fallthrough": {"variation": 0}
            }"#,
        )
        .unwrap();
        let store = TestStore::new_from_json_str("{}", "{}");

        let context = Context::with_key("u").build();
        let detail = evaluate(&store, &flag, &context, None);
        assert_that!(detail).is_equal_to(Detail {
            value: Some(&Bool(true)),
            variation_index: Some(1),
            reason: Reason::TargetMatch,
        });
    }

    #[test]
    fn rule_with_segment_match() {
        let mut store = TestStore::new_from_json_str("{}", "{}");
        store.add_segment(Segment::new("S", vec!["u".to_string()]));
        let flag: Flag = serde_json::from_str(
            r#"{
                "key": "withSegment",
                "on": true,
                "variations": [false, true],
                "rules": [{
                    "id": "r",
                    "clauses": [{"attribute": "key", "op": "segmentMatch", "values": ["S"]}],
                    "variation": 1
                }],
                "fallthrough": {"variation": 0}
            }"#,
        )
        .unwrap();

        let context = Context::with_key("u").build();
        let detail = evaluate(&store, &flag, &context, None);
        assert_that!(detail.reason).is_equal_to(Reason::RuleMatch {
            rule_index: 0,
            rule_id: "r".into(),
            in_experiment: false,
        });
        assert_that!(detail.value).contains_value(&Bool(true));
    }

    #[test]
    fn rollout_selection_follows_bucket() {
        let flag: Flag = serde_json::from_str(
            r#"{
                "key": "rollout",
                "salt": "s",
                "on": true,
                "variations": ["first", "second"],
                "fallthrough": {"rollout": {"variations": [
                    {"variation": 0, "weight": 40000},
                    {"variation": 1, "weight": 60000}
                ]}}
            }"#,
        )
        .unwrap();
        let store = TestStore::new_from_json_str("{}", "{}");

        let context = Context::with_key("userKeyA").build();
        let bucket = context.bucket(None, crate::context::BucketPrefix::KeyAndSalt("rollout", "s"));
        let detail = evaluate(&store, &flag, &context, None);
        let expected = if bucket < 0.4 { 0 } else { 1 };
        assert_that!(detail.variation_index).contains_value(expected);
    }

    #[test]
    fn prerequisite_failure_reports_prerequisite_key() {
        let flag_json = r#"{
            "F1": {
                "key": "F1",
                "on": true,
                "prerequisites": [{"key": "F2", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": ["off", "on"]
            },
            "F2": {
                "key": "F2",
                "on": true,
                "fallthrough": {"variation": 0},
                "variations": [false, true]
            }
        }"#;
        let store = TestStore::new_from_json_str(flag_json, "{}");
        let recorder = InMemoryPrerequisiteEventRecorder {
            events: RefCell::new(Vec::new()),
        };

        let context = Context::with_key("u").build();
        let detail = evaluate(&store, store.flag("F1").unwrap(), &context, Some(&recorder));
        assert_that!(detail.value).contains_value(&Str("off".into()));
        assert_that!(detail.reason).is_equal_to(Reason::PrerequisiteFailed {
            prerequisite_key: "F2".into(),
        });
        let events = recorder.events.borrow();
        assert_that!(*events).has_length(1);
        assert_eq!("F2", events[0].prerequisite_flag.key);
    }

    #[test]
    fn malformed_prerequisite_fails_the_prerequisite() {
        let flag_json = r#"{
            "F1": {
                "key": "F1",
                "on": true,
                "prerequisites": [{"key": "F2", "variation": 1}],
                "fallthrough": {"variation": 1},
                "offVariation": 0,
                "variations": ["off", "on"]
            },
            "F2": {
                "key": "F2",
                "on": true,
                "fallthrough": {"variation": 5},
                "variations": [false, true]
            }
        }"#;
        let store = TestStore::new_from_json_str(flag_json, "{}");
        let context = Context::with_key("u").build();

        let detail = evaluate(&store, store.flag("F1").unwrap(), &context, None);
        assert_that!(detail).is_equal_to(Detail {
            value: Some(&Str("off".into())),
            variation_index: Some(0),
            reason: Reason::PrerequisiteFailed {
                prerequisite_key: "F2".into(),
            },
        });
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic(key in "[a-zA-Z0-9]{1,16}") {
            let store = TestStore::new();
            let context = Context::with_key(key).build();
            for flag_key in ["flagWithExperiment", "flagWithSegmentMatchRule", "flagWithNestedPrereq"] {
                let flag = store.flag(flag_key).unwrap();
                let first = evaluate(&store, flag, &context, None);
                let second = evaluate(&store, flag, &context, None);
                prop_assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn reason_serialization() {
        struct Case<'a> {
            reason: Reason,
            json: &'a str,
        }

        let cases = vec![
            Case {
                reason: Reason::Off,
                json: r#"{"kind":"OFF"}"#,
            },
            Case {
                reason: Reason::Fallthrough {
                    in_experiment: false,
                },
                json: r#"{"kind":"FALLTHROUGH"}"#,
            },
            Case {
                reason: Reason::Fallthrough {
                    in_experiment: true,
                },
                json: r#"{"kind":"FALLTHROUGH","inExperiment":true}"#,
            },
            Case {
                reason: Reason::TargetMatch {},
                json: r#"{"kind":"TARGET_MATCH"}"#,
            },
            Case {
                reason: Reason::RuleMatch {
                    rule_index: 1,
                    rule_id: "x".into(),
                    in_experiment: false,
                },
                json: r#"{"kind":"RULE_MATCH","ruleIndex":1,"ruleId":"x"}"#,
            },
            Case {
                reason: Reason::RuleMatch {
                    rule_index: 1,
                    rule_id: "x".into(),
                    in_experiment: true,
                },
                json: r#"{"kind":"RULE_MATCH","ruleIndex":1,"ruleId":"x","inExperiment":true}"#,
            },
            Case {
                reason: Reason::PrerequisiteFailed {
                    prerequisite_key: "x".into(),
                },
                json: r#"{"kind":"PREREQUISITE_FAILED","prerequisiteKey":"x"}"#,
            },
            Case {
                reason: Reason::Error {
                    error: Error::WrongType,
                },
                json: r#"{"kind":"ERROR","errorKind":"WRONG_TYPE"}"#,
            },
            Case {
                reason: Reason::Error {
                    error: Error::UserNotSpecified,
                },
                json: r#"{"kind":"ERROR","errorKind":"USER_NOT_SPECIFIED"}"#,
            },
        ];

        for Case {
            reason,
            json: expected_json,
        } in cases
        {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(
                expected_json, json,
                "unexpected serialization: {:?}",
                reason
            );
        }
    }

    #[test]
    fn can_create_error_detail() {
        let detail = Detail::err_default(Error::MalformedFlag, AttributeValue::from(true));

        assert_eq!(Some(AttributeValue::Bool(true)), detail.value);
        assert!(detail.variation_index.is_none());
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    #[test]
    fn can_force_error_if_value_is_none() {
        let detail: Detail<AttributeValue> = Detail {
            value: None,
            variation_index: None,
            reason: Reason::Off,
        };

        let detail = detail.should_have_value(Error::MalformedFlag);

        assert!(detail.value.is_none());
        assert!(detail.variation_index.is_none());
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    #[test]
    fn can_map_detail_with_default_and_error() {
        let detail: Detail<AttributeValue> = Detail {
            value: None,
            variation_index: None,
            reason: Reason::Off,
        };

        let mapped = detail.try_map(Some, false.into(), Error::MalformedFlag);
        assert_eq!(Some(AttributeValue::Bool(false)), mapped.value);
        assert!(mapped.variation_index.is_none());
        assert_that!(mapped.reason).is_equal_to(Reason::Off);

        let detail: Detail<AttributeValue> = Detail {
            value: Some(true.into()),
            variation_index: Some(1),
            reason: Reason::Off,
        };

        let mapped = detail.try_map(|_| Some(false.into()), false.into(), Error::MalformedFlag);
        assert_eq!(Some(AttributeValue::Bool(false)), mapped.value);
        assert_eq!(Some(1), mapped.variation_index);
        assert_that!(mapped.reason).is_equal_to(Reason::Off);

        let detail: Detail<AttributeValue> = Detail {
            value: Some(true.into()),
            variation_index: Some(1),
            reason: Reason::Off,
        };

        let mapped = detail.try_map(|_| None, false.into(), Error::MalformedFlag);
        assert_eq!(Some(AttributeValue::Bool(false)), mapped.value);
        assert!(mapped.variation_index.is_none());
        assert_that!(mapped.reason).is_equal_to(Reason::Error {
            error: Error::MalformedFlag,
        });
    }

    #[test]
    fn can_set_value_to_default_if_does_not_exist() {
        let detail: Detail<AttributeValue> = Detail {
            value: Some(true.into()),
            variation_index: Some(1),
            reason: Reason::Off,
        };

        let or_detail = detail.or(false.into());
        assert_eq!(Some(AttributeValue::Bool(true)), or_detail.value);
        assert_eq!(Some(1), or_detail.variation_index);
        assert_that!(or_detail.reason).is_equal_to(Reason::Off);

        let detail: Detail<AttributeValue> = Detail {
            value: None,
            variation_index: Some(1),
            reason: Reason::Off,
        };

        let or_detail = detail.or(false.into());
        assert_eq!(Some(AttributeValue::Bool(false)), or_detail.value);
        assert!(or_detail.variation_index.is_none());
        assert_that!(or_detail.reason).is_equal_to(Reason::Off);
    }

    #[test]
    fn can_set_value_to_default_if_does_not_exist_through_callback() {
        let detail: Detail<AttributeValue> = Detail {
            value: Some(true.into()),
            variation_index: Some(1),
            reason: Reason::Off,
        };

        let or_detail = detail.or_else(|| false.into());
        assert_eq!(Some(AttributeValue::Bool(true)), or_detail.value);
        assert_eq!(Some(1), or_detail.variation_index);
        assert_that!(or_detail.reason).is_equal_to(Reason::Off);

        let detail: Detail<AttributeValue> = Detail {
            value: None,
            variation_index: Some(1),
            reason: Reason::Off,
        };

        let or_detail = detail.or_else(|| false.into());
        assert_eq!(Some(AttributeValue::Bool(false)), or_detail.value);
        assert!(or_detail.variation_index.is_none());
        assert_that!(or_detail.reason).is_equal_to(Reason::Off);
    }
}
