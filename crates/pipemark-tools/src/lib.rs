//! Script and user-interface execution tools for pipemark.
//!
//! - `ScriptTool` runs the body of a script step; `LocalScriptTool` does so
//!   with a local `node` or `python3` interpreter.
//! - `UserInterfaceTools` answers dialog steps; console, default-value and
//!   recording implementations are provided.

mod dialog;
mod script;

pub use dialog::*;
pub use script::*;
