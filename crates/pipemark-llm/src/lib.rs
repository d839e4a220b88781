//! Natural-language execution tools for pipemark.
//!
//! Provides the `NaturalLanguageTools` trait the interpreter calls for
//! prompt-template steps, the `Prompt`/`PromptResult` records exchanged
//! with it, a deterministic `EchoTools` backend and an OpenAI-compatible
//! HTTP backend.

mod echo;
mod openai;
mod provider;
mod types;

pub use echo::EchoTools;
pub use openai::OpenAiTools;
pub use provider::*;
pub use types::*;
