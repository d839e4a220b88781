//! Validation, execution and cataloguing of compiled pipemark pipelines.
//!
//! A compiled [`PipelineDocument`](pipemark_syntax::PipelineDocument) is
//! checked by the lint rules in [`validation`], wrapped into an immutable
//! [`Pipeline`] and run step by step by the [`PipelineExecutor`] against the
//! caller's [`ExecutionTools`]. [`PipelineLibrary`] keeps named pipelines
//! around and hands out executors for them.

pub mod engine;
pub mod events;
pub mod expectations;
pub mod fallback;
pub mod library;
pub mod pipeline;
pub mod postprocessing;
pub mod templates;
pub mod tools;
pub mod validation;

pub use engine::{PipelineExecutor, PipelineResult, StepRecord};
pub use events::{EventEmitter, ProgressEvent};
pub use expectations::{check_expectations, count_units};
pub use fallback::{try_in_order, Exhausted};
pub use library::PipelineLibrary;
pub use pipeline::Pipeline;
pub use postprocessing::{PostprocessingRegistry, PostprocessFn};
pub use templates::replace_parameters;
pub use tools::ExecutionTools;
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
