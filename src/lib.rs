mod changeset;
mod context;
mod data_store;
mod dependency;
mod error;
mod eval;
mod evaluator;
mod flag;
mod hooks;
mod item;
mod legacy;
mod rule;
mod segment;
mod store;
mod test_common;
mod util;
mod value;
mod variation;

pub mod data_source;
pub mod protocol;

pub use changeset::*;
pub use context::*;
pub use data_source::{DataSource, DataSourceState, DataSourceStatus, DataSync, TestData};
pub use data_store::*;
pub use dependency::*;
pub use error::{Error, Result};
pub use eval::{
    evaluate, Detail, Error as EvalError, PrerequisiteEvent, PrerequisiteEventRecorder, Reason,
};
pub use evaluator::*;
pub use flag::*;
pub use hooks::*;
pub use item::*;
pub use legacy::*;
pub use rule::*;
pub use segment::*;
pub use store::*;
pub use value::*;
pub use variation::*;
