#![cfg(test)]

use std::cell::RefCell;
use std::collections::HashMap;

use maplit::hashmap;

use crate::eval::{PrerequisiteEvent, PrerequisiteEventRecorder};
use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::Store;

pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

fn flag(json: &str) -> Flag {
    serde_json::from_str(json).unwrap()
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            flags: hashmap! {
                "flag".to_string() => flag(r#"{
                        "key": "flag",
                        "version": 42,
                        "on": false,
                        "targets": [],
                        "rules": [],
                        "prerequisites": [],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "clientSide": true,
                        "clientSideAvailability": {
                            "usingEnvironmentId": true,
                            "usingMobileKey": true
                        },
                        "salt": "salty"
                    }"#),
                "flagWithRuleExclusion".to_string() => flag(r#"{
                        "key": "flag",
                        "version": 42,
                        "on": false,
                        "targets": [],
                        "rules": [
                            {
                                "variation": 0,
                                "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                                "clauses": [
                                    {
                                        "attribute": "platform",
                                        "op": "in",
                                        "values": ["web", "aem", "ios"],
                                        "negate": false
                                    }
                                ],
                                "trackEvents": true
                            }
                        ],
                        "prerequisites": [],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "clientSide": true,
                        "salt": "salty",
                        "trackEvents": false,
                        "trackEventsFallthrough": true,
                        "debugEventsUntilDate": 1500000000
                    }"#),
                "flagWithMatchesOpOnGroups".to_string() => flag(r#"{
                        "key": "flagWithMatchesOpOnGroups",
                        "version": 42,
                        "on": true,
                        "targets": [],
                        "rules": [
                            {
                                "variation": 0,
                                "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                                "clauses": [
                                    {
                                        "attribute": "groups",
                                        "op": "matches",
                                        "values": ["^\\w+"],
                                        "negate": false
                                    }
                                ],
                                "trackEvents": true
                            }
                        ],
                        "prerequisites": [],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty",
                        "trackEventsFallthrough": true
                    }"#),
                "flagWithExperiment".to_string() => flag(r#"{
                        "key": "flagWithExperiment",
                        "version": 42,
                        "on": true,
                        "targets": [],
                        "rules": [],
                        "prerequisites": [],
                        "fallthrough": {
                          "rollout": {
                            "kind": "experiment",
                            "seed": 61,
                            "variations": [
                              {"variation": 0, "weight": 10000, "untracked": false},
                              {"variation": 1, "weight": 20000, "untracked": false},
                              {"variation": 0, "weight": 70000, "untracked": true}
                            ]
                          }
                        },
                        "offVariation": 0,
                        "variations": [false, true],
                        "clientSide": true,
                        "salt": "salty",
                        "trackEvents": false,
                        "trackEventsFallthrough": false,
                        "debugEventsUntilDate": 1500000000
                    }"#),
                "flagWithRolloutBucketBy".to_string() => flag(r#"{
                        "key": "rollout",
                        "on": true,
                        "prerequisites": [],
                        "targets": [],
                        "rules": [
                            {
                                "rollout": {
                                    "variations": [
                                        {"variation": 0, "weight": 50000},
                                        {"variation": 1, "weight": 50000},
                                        {"variation": 2, "weight": 0}
                                    ],
                                    "bucketBy": "ld_quid"
                                },
                                "id": "6a7755ac-e47a-40ea-9579-a09dd5f061bd",
                                "clauses": [
                                    {
                                        "attribute": "platform",
                                        "op": "in",
                                        "values": ["web", "aem", "ios"],
                                        "negate": false
                                    }
                                ],
                                "trackEvents": false
                            }
                        ],
                        "fallthrough": {"variation": 2},
                        "offVariation": 1,
                        "variations": ["rollout1", "rollout2", "rollout3"],
                        "clientSideAvailability": {
                            "usingMobileKey": true,
                            "usingEnvironmentId": true
                        },
                        "salt": "ce2634f116d741a7ad1b7ef363f6f9bc",
                        "debugEventsUntilDate": null,
                        "version": 7
                    }"#),
                "flagWithTarget".to_string() => flag(r#"{
                        "key": "flagWithTarget",
                        "version": 42,
                        "on": false,
                        "targets": [{
                            "values": ["bob"],
                            "variation": 0
                        }],
                        "rules": [],
                        "prerequisites": [],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithMissingPrereq".to_string() => flag(r#"{
                        "key": "flagWithMissingPrereq",
                        "version": 42,
                        "on": true,
                        "prerequisites": [{
                            "key": "badPrereq",
                            "variation": 1
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithOffPrereq".to_string() => flag(r#"{
                        "key": "flagWithOffPrereq",
                        "version": 42,
                        "on": true,
                        "prerequisites": [{
                            "key": "offPrereq",
                            "variation": 1
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithFirstPrereqAsPrereqToSecondPrereq".to_string() => flag(r#"{
                        "key": "flagWithFirstPrereqAsPrereqToSecondPrereq",
                        "version": 42,
                        "on": true,
                        "prerequisites": [
                            {"key": "prereq", "variation": 1},
                            {"key": "flagWithSatisfiedPrereq", "variation": 1}
                        ],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithNestedPrereq".to_string() => flag(r#"{
                        "key": "flagWithNestedPrereq",
                        "version": 42,
                        "on": true,
                        "prerequisites": [{
                            "key": "flagWithSatisfiedPrereq",
                            "variation": 1
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithSatisfiedPrereq".to_string() => flag(r#"{
                        "key": "flagWithSatisfiedPrereq",
                        "version": 42,
                        "on": true,
                        "prerequisites": [{
                            "key": "prereq",
                            "variation": 1
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "prereq".to_string() => flag(r#"{
                        "key": "prereq",
                        "version": 42,
                        "on": true,
                        "targets": [{
                            "values": ["bob"],
                            "variation": 0
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "offPrereq".to_string() => flag(r#"{
                        "key": "offPrereq",
                        "version": 42,
                        "on": false,
                        "fallthrough": {"variation": 1},
                        "offVariation": 1,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithInRule".to_string() => flag(r#"{
                        "key": "flagWithInRule",
                        "version": 42,
                        "on": false,
                        "rules": [{
                            "id": "in-rule",
                            "clauses": [{
                                "attribute": "team",
                                "negate": false,
                                "op": "in",
                                "values": ["Avengers"]
                            }],
                            "variation": 0,
                            "trackEvents": false
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithSegmentMatchRule".to_string() => flag(r#"{
                        "key": "flagWithSegmentMatchRule",
                        "version": 42,
                        "on": true,
                        "rules": [{
                            "id": "match-rule",
                            "clauses": [{
                                "attribute": "key",
                                "negate": false,
                                "op": "segmentMatch",
                                "values": ["segment"]
                            }],
                            "variation": 0,
                            "trackEvents": false
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithPrereqWhichDuplicatesSegmentRuleCheck".to_string() => flag(r#"{
                        "key": "flagWithPrereqWhichDuplicatesSegmentRuleCheck",
                        "version": 42,
                        "on": true,
                        "rules": [{
                            "id": "match-rule",
                            "clauses": [{
                                "attribute": "key",
                                "negate": false,
                                "op": "segmentMatch",
                                "values": ["segment"]
                            }],
                            "variation": 0,
                            "trackEvents": false
                        }],
                        "prerequisites": [{
                            "key": "flagWithSegmentMatchRule",
                            "variation": 0
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
                "flagWithMalformedRule".to_string() => flag(r#"{
                        "key": "flagWithMalformedRule",
                        "version": 42,
                        "on": false,
                        "rules": [{
                            "id": "in-rule",
                            "clauses": [{
                                "attribute": "key",
                                "negate": false,
                                "op": "in",
                                "values": ["yes"]
                            }],
                            "trackEvents": false
                        }],
                        "fallthrough": {"variation": 1},
                        "offVariation": 0,
                        "variations": [false, true],
                        "salt": "salty"
                    }"#),
            },
            segments: hashmap! {
                "segment".to_string() => serde_json::from_str(r#"{
                        "key": "segment",
                        "included": ["alice"],
                        "excluded": [],
                        "rules": [],
                        "salt": "salty",
                        "version": 1
                    }"#).unwrap()
            },
        }
    }

    pub fn new_from_json_str(flag_json: &str, segment_json: &str) -> Self {
        let flags = serde_json::from_str(flag_json).unwrap();
        let segments = serde_json::from_str(segment_json).unwrap();

        Self { flags, segments }
    }

    pub fn update_flag(&mut self, flag_key: &str, fun: fn(&mut Flag)) {
        let flag = self.flags.get_mut(flag_key).unwrap();
        fun(flag);
    }

    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.insert(segment.key.clone(), segment);
    }

    /// All fixture flags, for feeding a data store.
    pub fn flags(&self) -> impl Iterator<Item = &Flag> {
        self.flags.values()
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<&Flag> {
        self.flags.get(flag_key)
    }

    fn segment(&self, segment_key: &str) -> Option<&Segment> {
        self.segments.get(segment_key)
    }
}

pub struct InMemoryPrerequisiteEventRecorder {
    pub events: RefCell<Vec<PrerequisiteEvent>>,
}

impl PrerequisiteEventRecorder for InMemoryPrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.borrow_mut().push(event);
    }
}
