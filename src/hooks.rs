//! Callbacks that run around each flag evaluation.
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;

use crate::context::Context;
use crate::eval::Detail;
use crate::value::AttributeValue;

/// Data a hook passes from its `before_evaluation` to its `after_evaluation` for the same
/// evaluation.
pub type EvaluationSeriesData = HashMap<String, AttributeValue>;

/// What is being evaluated. Hooks see the inputs but cannot change them.
#[derive(Clone, Copy, Debug)]
pub struct EvaluationSeriesContext<'a> {
    pub flag_key: &'a str,
    /// None if the caller did not supply a context.
    pub context: Option<&'a Context>,
    pub default_value: &'a AttributeValue,
    /// The evaluator method that was called, e.g. `bool_variation`.
    pub method: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookMetadata {
    pub name: String,
}

impl HookMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        HookMetadata { name: name.into() }
    }
}

/// An evaluation hook.
///
/// Hooks run synchronously on the evaluating thread, so they should be quick. A hook that panics
/// is logged and skipped; it never changes the evaluation result.
pub trait Hook: Send + Sync {
    fn metadata(&self) -> HookMetadata;

    /// Runs before the flag is evaluated. The returned data is handed to `after_evaluation`.
    fn before_evaluation(
        &self,
        _series: &EvaluationSeriesContext<'_>,
        data: EvaluationSeriesData,
    ) -> EvaluationSeriesData {
        data
    }

    /// Runs after the flag is evaluated, with the final result.
    fn after_evaluation(
        &self,
        _series: &EvaluationSeriesContext<'_>,
        data: EvaluationSeriesData,
        _detail: &Detail<AttributeValue>,
    ) -> EvaluationSeriesData {
        data
    }
}

/// Runs every hook's `before_evaluation` in registration order, returning each hook's data.
pub(crate) fn before_evaluation(
    hooks: &[Arc<dyn Hook>],
    series: &EvaluationSeriesContext<'_>,
) -> Vec<EvaluationSeriesData> {
    hooks
        .iter()
        .map(|hook| {
            guarded(hook.as_ref(), "before_evaluation", || {
                hook.before_evaluation(series, EvaluationSeriesData::new())
            })
        })
        .collect()
}

/// Runs every hook's `after_evaluation` in reverse registration order.
pub(crate) fn after_evaluation(
    hooks: &[Arc<dyn Hook>],
    series: &EvaluationSeriesContext<'_>,
    data: Vec<EvaluationSeriesData>,
    detail: &Detail<AttributeValue>,
) {
    for (hook, data) in hooks.iter().zip(data).rev() {
        guarded(hook.as_ref(), "after_evaluation", || {
            hook.after_evaluation(series, data, detail)
        });
    }
}

fn guarded<F>(hook: &dyn Hook, stage: &str, f: F) -> EvaluationSeriesData
where
    F: FnOnce() -> EvaluationSeriesData,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        let name = catch_unwind(AssertUnwindSafe(|| hook.metadata().name))
            .unwrap_or_else(|_| "unknown".to_string());
        error!("hook '{}' panicked during {}", name, stage);
        EvaluationSeriesData::new()
    })
}
