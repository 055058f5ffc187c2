use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, warn};

use crate::context::Context;
use crate::data_store::DataStore;
use crate::eval::{self, Detail, Error, PrerequisiteEvent, PrerequisiteEventRecorder};
use crate::hooks::{self, EvaluationSeriesContext, Hook};
use crate::store::Store;
use crate::value::{AttributeValue, ValueType};

/// The outcome of [Evaluator::evaluate].
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// The value, never empty: the caller's default stands in when the flag produced nothing.
    pub detail: Detail<AttributeValue>,
    /// One event for every prerequisite flag evaluated along the way, in evaluation order.
    pub prerequisite_events: Vec<PrerequisiteEvent>,
}

#[derive(Default)]
struct CollectingRecorder {
    events: RefCell<Vec<PrerequisiteEvent>>,
}

impl PrerequisiteEventRecorder for CollectingRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.borrow_mut().push(event);
    }
}

/// Evaluates flags against the current contents of a [DataStore].
///
/// Each evaluation reads from a single snapshot of the store, so a concurrent update is either
/// fully visible to it or not at all. Evaluation never fails: problems are reported through
/// [crate::Reason::Error] along with the caller's default.
pub struct Evaluator {
    store: Arc<DataStore>,
    hooks: Vec<Arc<dyn Hook>>,
}

impl Evaluator {
    pub fn new(store: Arc<DataStore>) -> Self {
        Evaluator {
            store,
            hooks: Vec::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn Hook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn add_hook(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Evaluates `flag_key` for `context`, falling back to `default`.
    ///
    /// Errors are checked in order: a store that has never received data gives
    /// `CLIENT_NOT_READY`, an unknown key `FLAG_NOT_FOUND`, and a missing or invalid context
    /// `USER_NOT_SPECIFIED`.
    pub fn evaluate(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: AttributeValue,
    ) -> Evaluation {
        self.evaluate_with_hooks("evaluate", flag_key, context, default, None)
    }

    pub fn bool_variation(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: bool,
    ) -> Detail<bool> {
        self.evaluate_with_hooks(
            "bool_variation",
            flag_key,
            context,
            default.into(),
            Some(ValueType::Bool),
        )
        .detail
        .try_map(|v| v.as_bool(), default, Error::WrongType)
    }

    pub fn str_variation(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: String,
    ) -> Detail<String> {
        self.evaluate_with_hooks(
            "str_variation",
            flag_key,
            context,
            default.clone().into(),
            Some(ValueType::String),
        )
        .detail
        .try_map(|v| v.as_str().map(str::to_string), default, Error::WrongType)
    }

    pub fn float_variation(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: f64,
    ) -> Detail<f64> {
        self.evaluate_with_hooks(
            "float_variation",
            flag_key,
            context,
            default.into(),
            Some(ValueType::Number),
        )
        .detail
        .try_map(|v| v.to_f64(), default, Error::WrongType)
    }

    /// Like [Evaluator::float_variation], truncating the result towards zero.
    pub fn int_variation(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: i64,
    ) -> Detail<i64> {
        self.evaluate_with_hooks(
            "int_variation",
            flag_key,
            context,
            default.into(),
            Some(ValueType::Number),
        )
        .detail
        .try_map(|v| v.to_f64().map(|_| v.int_value()), default, Error::WrongType)
    }

    /// Accepts a value of any type.
    pub fn json_variation(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: AttributeValue,
    ) -> Detail<AttributeValue> {
        self.evaluate_with_hooks("json_variation", flag_key, context, default, None)
            .detail
    }

    fn evaluate_with_hooks(
        &self,
        method: &'static str,
        flag_key: &str,
        context: Option<&Context>,
        default: AttributeValue,
        expected: Option<ValueType>,
    ) -> Evaluation {
        if self.hooks.is_empty() {
            return self.evaluate_checked(flag_key, context, default, expected);
        }

        let series = EvaluationSeriesContext {
            flag_key,
            context,
            default_value: &default,
            method,
        };
        let data = hooks::before_evaluation(&self.hooks, &series);
        let evaluation = self.evaluate_checked(flag_key, context, default.clone(), expected);
        hooks::after_evaluation(&self.hooks, &series, data, &evaluation.detail);
        evaluation
    }

    fn evaluate_checked(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: AttributeValue,
        expected: Option<ValueType>,
    ) -> Evaluation {
        let mut evaluation = self.evaluate_detail(flag_key, context, default.clone());
        if let (Some(expected), Some(value)) = (expected, &evaluation.detail.value) {
            if value.value_type() != expected {
                warn!(
                    "flag '{}' evaluated to a {:?}, expected {:?}",
                    flag_key,
                    value.value_type(),
                    expected
                );
                evaluation.detail = Detail::err_default(Error::WrongType, default);
            }
        }
        evaluation
    }

    fn evaluate_detail(
        &self,
        flag_key: &str,
        context: Option<&Context>,
        default: AttributeValue,
    ) -> Evaluation {
        let failed = |error, default| Evaluation {
            detail: Detail::err_default(error, default),
            prerequisite_events: Vec::new(),
        };

        let snapshot = self.store.snapshot();
        if !snapshot.is_initialized() {
            warn!("flag '{}' evaluated before the store was initialized", flag_key);
            return failed(Error::ClientNotReady, default);
        }

        let flag = match snapshot.flag(flag_key) {
            Some(flag) => flag,
            None => {
                warn!("unknown flag '{}'", flag_key);
                return failed(Error::FlagNotFound, default);
            }
        };

        let context = match context {
            Some(context) if context.is_valid() => context,
            _ => {
                warn!("flag '{}' evaluated without a valid context", flag_key);
                return failed(Error::UserNotSpecified, default);
            }
        };

        let recorder = CollectingRecorder::default();
        let result = catch_unwind(AssertUnwindSafe(|| {
            eval::evaluate(snapshot.as_ref(), flag, context, Some(&recorder))
                .map(|value| value.clone())
        }));

        match result {
            Ok(detail) => Evaluation {
                detail: detail.or(default),
                prerequisite_events: recorder.events.into_inner(),
            },
            Err(_) => {
                error!("evaluation of flag '{}' panicked", flag_key);
                failed(Error::Exception, default)
            }
        }
    }
}
