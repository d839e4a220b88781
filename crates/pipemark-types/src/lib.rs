//! Shared types and errors for the pipemark pipeline engine.
//!
//! This crate provides the foundational types used across all other pipemark crates:
//! - `PipemarkError`: unified error taxonomy (syntax, semantic, execution)
//! - `Parameters`: the name → value environment threaded through a run
//! - `ModelRequirements`: what a natural-language step asks of its model
//! - `ScriptLanguage`: the closed set of languages a script step may use

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unified error type for all pipemark subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PipemarkError {
    // === Syntax Errors ===
    #[error("Syntax error: {message}")]
    Syntax {
        message: String,
        source_snippet: Option<String>,
    },

    // === Semantic Errors ===
    #[error("Pipeline validation failed: {message}")]
    Validation { rule: String, message: String },

    // === Execution Errors ===
    #[error("Step '{step}' failed: {message}")]
    Execution { step: String, message: String },

    #[error("Missing required input parameter {{{parameter}}}")]
    MissingInput { parameter: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("All {} script tools failed on step '{step}':\n{}", .failures.len(), .failures.join("\n"))]
    ScriptToolsExhausted { step: String, failures: Vec<String> },

    #[error("Result of step '{step}' does not meet expectations: {message}")]
    ExpectationsNotMet { step: String, message: String },

    #[error("Internal invariant violated: {0}")]
    Unexpected(String),

    // === Natural-language Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Authentication failed for provider {provider}")]
    Auth { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Tool Errors ===
    #[error("Tool '{tool}' error: {message}")]
    ToolError { tool: String, message: String },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    // === Library Errors ===
    #[error("Pipeline '{name}' not found in library")]
    PipelineNotFound { name: String },

    #[error("Pipeline '{name}' is already registered in library")]
    DuplicatePipeline { name: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PipemarkError {
    /// Shorthand for a [`PipemarkError::Syntax`] that quotes the offending source.
    pub fn syntax(message: impl Into<String>, snippet: impl Into<String>) -> Self {
        let snippet = snippet.into();
        PipemarkError::Syntax {
            message: message.into(),
            source_snippet: if snippet.trim().is_empty() {
                None
            } else {
                Some(snippet)
            },
        }
    }

    /// Shorthand for a [`PipemarkError::Execution`] on the given step.
    pub fn execution(step: impl Into<String>, message: impl Into<String>) -> Self {
        PipemarkError::Execution {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors raised while compiling or validating a
    /// document, before any step has executed.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            PipemarkError::Syntax { .. } | PipemarkError::Validation { .. }
        )
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipemarkError::CommandTimeout { .. }
                | PipemarkError::RequestTimeout { .. }
                | PipemarkError::Provider {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipemarkError::Auth { .. }
                | PipemarkError::Configuration(_)
                | PipemarkError::MissingInput { .. }
        ) || self.is_compile_time()
    }
}

/// A convenience alias for `Result<T, PipemarkError>`.
pub type Result<T> = std::result::Result<T, PipemarkError>;

/// Parameter environment: parameter name → value.
///
/// Ordered so that printed and serialized environments are stable.
pub type Parameters = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Model requirements
// ---------------------------------------------------------------------------

/// How a natural-language step talks to its model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelVariant {
    #[default]
    Chat,
    Completion,
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::Chat => f.write_str("CHAT"),
            ModelVariant::Completion => f.write_str("COMPLETION"),
        }
    }
}

/// Model selection and sampling parameters for a natural-language step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequirements {
    pub model_variant: ModelVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelRequirements {
    /// Layer `overrides` on top of `self`; fields set in `overrides` win.
    pub fn merged_with(&self, overrides: &ModelRequirementsPatch) -> ModelRequirements {
        ModelRequirements {
            model_variant: overrides.model_variant.unwrap_or(self.model_variant),
            model_name: overrides
                .model_name
                .clone()
                .or_else(|| self.model_name.clone()),
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
        }
    }
}

/// Partially specified model requirements, as collected from `MODEL` commands
/// before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequirementsPatch {
    pub model_variant: Option<ModelVariant>,
    pub model_name: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelRequirementsPatch {
    pub fn is_empty(&self) -> bool {
        self.model_variant.is_none()
            && self.model_name.is_none()
            && self.temperature.is_none()
            && self.max_tokens.is_none()
    }
}

// ---------------------------------------------------------------------------
// Script languages
// ---------------------------------------------------------------------------

/// Languages a script step may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Javascript,
    Typescript,
    Python,
}

impl ScriptLanguage {
    pub const ALL: [ScriptLanguage; 3] = [
        ScriptLanguage::Javascript,
        ScriptLanguage::Typescript,
        ScriptLanguage::Python,
    ];

    /// Resolve a fenced code block language tag, accepting common aliases.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" => Some(ScriptLanguage::Javascript),
            "typescript" | "ts" => Some(ScriptLanguage::Typescript),
            "python" | "py" => Some(ScriptLanguage::Python),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptLanguage::Javascript => "javascript",
            ScriptLanguage::Typescript => "typescript",
            ScriptLanguage::Python => "python",
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
