use async_trait::async_trait;
use chrono::Utc;
use pipemark_types::Result;

use crate::{NaturalLanguageTools, Prompt, PromptResult, Timing, Usage};

/// Deterministic tools that answer by echoing the prompt back.
///
/// Usage is counted in whitespace-separated words, which keeps transcripts
/// assertable in tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct EchoTools;

impl EchoTools {
    pub fn new() -> Self {
        Self
    }

    fn respond(&self, prompt: &Prompt, content: String) -> PromptResult {
        let started_at = Utc::now();
        tracing::debug!(prompt = %prompt.id(), "echo tools answering prompt");
        let usage = Usage {
            input_tokens: word_count(&prompt.content),
            output_tokens: word_count(&content),
        };
        PromptResult {
            content,
            model_name: prompt
                .model_requirements
                .model_name
                .clone()
                .unwrap_or_else(|| "echo".to_string()),
            usage,
            timing: Timing::since(started_at),
        }
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl NaturalLanguageTools for EchoTools {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, prompt: &Prompt) -> Result<PromptResult> {
        Ok(self.respond(prompt, format!("You said:\n{}", prompt.content)))
    }

    async fn complete(&self, prompt: &Prompt) -> Result<PromptResult> {
        Ok(self.respond(prompt, format!("{}\nAnd so on...", prompt.content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemark_types::{ModelRequirements, Parameters};

    fn prompt(content: &str) -> Prompt {
        Prompt {
            title: "Echo".into(),
            content: content.into(),
            model_requirements: ModelRequirements::default(),
            pipeline_url: None,
            step_name: "echo".into(),
            parameters: Parameters::new(),
        }
    }

    #[tokio::test]
    async fn chat_echoes_with_prefix() {
        let result = EchoTools::new().chat(&prompt("Hello there")).await.unwrap();
        assert_eq!(result.content, "You said:\nHello there");
        assert_eq!(result.model_name, "echo");
        assert_eq!(result.usage.input_tokens, 2);
        assert_eq!(result.usage.output_tokens, 4);
    }

    #[tokio::test]
    async fn complete_appends_continuation() {
        let result = EchoTools::new().complete(&prompt("Once upon a time")).await.unwrap();
        assert_eq!(result.content, "Once upon a time\nAnd so on...");
    }

    #[tokio::test]
    async fn reports_requested_model_name() {
        let mut p = prompt("hi");
        p.model_requirements.model_name = Some("gpt-4o-mini".into());
        let result = EchoTools::new().chat(&p).await.unwrap();
        assert_eq!(result.model_name, "gpt-4o-mini");
    }
}
