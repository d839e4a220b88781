use chrono::{DateTime, Utc};
use pipemark_types::{ModelRequirements, Parameters};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// A fully interpolated prompt handed to a natural-language tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub title: String,
    pub content: String,
    pub model_requirements: ModelRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_url: Option<String>,
    pub step_name: String,
    /// Parameter environment at the time the prompt was built.
    pub parameters: Parameters,
}

impl Prompt {
    /// Stable identifier of the prompt: `<pipeline url>#<step name>`, or
    /// just the step name for pipelines without a URL.
    pub fn id(&self) -> String {
        match &self.pipeline_url {
            Some(url) => format!("{url}#{}", self.step_name),
            None => self.step_name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// PromptResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub content: String,
    pub model_name: String,
    pub usage: Usage,
    pub timing: Timing,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl Timing {
    /// Timing for a call that started at `started_at` and has just finished.
    pub fn since(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
