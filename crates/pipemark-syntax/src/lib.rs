//! Markdown dialect for pipemark pipelines.
//!
//! A pipeline source is one `#` heading (the pipeline) followed by `##`
//! headings (the steps). List items carry commands, each step holds exactly
//! one fenced code block and ends with `-> {result}`.
//!
//! Produces a typed document: [`PipelineDocument`], [`Step`], [`StepKind`],
//! [`ParameterDeclaration`].
//!
//! # Example
//! ```
//! let source = "# Receipt\n\n- INPUT PARAMETER {thing}\n\n## Write\n\n- EXECUTE SIMPLE TEMPLATE\n\n```text\nI bought {thing}.\n```\n\n-> {receipt}\n";
//! let document = pipemark_syntax::compile(source).unwrap();
//! assert_eq!(document.title, "Receipt");
//! assert_eq!(document.steps[0].resulting_parameter_name, "receipt");
//! ```

pub mod command;
mod compiler;
pub mod document;

pub use command::{parse_command, Command};
pub use compiler::{compile, parameter_references, to_kebab_case};
pub use document::*;
