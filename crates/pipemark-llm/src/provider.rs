use async_trait::async_trait;
use pipemark_types::{ModelVariant, PipemarkError, Result};

use crate::{Prompt, PromptResult};

// ---------------------------------------------------------------------------
// NaturalLanguageTools
// ---------------------------------------------------------------------------

/// Backend that answers prompt-template steps.
///
/// Implementations override the variants they support; the defaults report
/// the variant as unsupported so the run fails with a configuration error.
#[async_trait]
pub trait NaturalLanguageTools: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, prompt: &Prompt) -> Result<PromptResult> {
        Err(unsupported(self.name(), ModelVariant::Chat, prompt))
    }

    async fn complete(&self, prompt: &Prompt) -> Result<PromptResult> {
        Err(unsupported(self.name(), ModelVariant::Completion, prompt))
    }
}

/// Route a prompt to `chat` or `complete` according to its model variant.
pub async fn call_model(tools: &dyn NaturalLanguageTools, prompt: &Prompt) -> Result<PromptResult> {
    match prompt.model_requirements.model_variant {
        ModelVariant::Chat => tools.chat(prompt).await,
        ModelVariant::Completion => tools.complete(prompt).await,
    }
}

fn unsupported(tools: &str, variant: ModelVariant, prompt: &Prompt) -> PipemarkError {
    PipemarkError::Configuration(format!(
        "Natural-language tools '{tools}' do not support the {variant} variant needed by prompt {}",
        prompt.id()
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Timing, Usage};
    use pipemark_types::{ModelRequirements, Parameters};

    struct ChatOnly;

    #[async_trait]
    impl NaturalLanguageTools for ChatOnly {
        fn name(&self) -> &str {
            "chat-only"
        }

        async fn chat(&self, prompt: &Prompt) -> Result<PromptResult> {
            Ok(PromptResult {
                content: prompt.content.to_uppercase(),
                model_name: "mock-model".into(),
                usage: Usage::default(),
                timing: Timing::since(chrono::Utc::now()),
            })
        }
    }

    fn prompt(variant: ModelVariant) -> Prompt {
        Prompt {
            title: "Shout".into(),
            content: "hello".into(),
            model_requirements: ModelRequirements {
                model_variant: variant,
                ..Default::default()
            },
            pipeline_url: None,
            step_name: "shout".into(),
            parameters: Parameters::new(),
        }
    }

    #[tokio::test]
    async fn call_model_routes_chat() {
        let result = call_model(&ChatOnly, &prompt(ModelVariant::Chat)).await.unwrap();
        assert_eq!(result.content, "HELLO");
        assert_eq!(result.model_name, "mock-model");
    }

    #[tokio::test]
    async fn unsupported_variant_is_configuration_error() {
        let err = call_model(&ChatOnly, &prompt(ModelVariant::Completion))
            .await
            .unwrap_err();
        match err {
            PipemarkError::Configuration(message) => {
                assert!(message.contains("chat-only"));
                assert!(message.contains("COMPLETION"));
                assert!(message.contains("shout"));
            }
            other => panic!("Expected Configuration, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tools_work_behind_arc_dyn() {
        let tools: std::sync::Arc<dyn NaturalLanguageTools> = std::sync::Arc::new(ChatOnly);
        let result = call_model(tools.as_ref(), &prompt(ModelVariant::Chat)).await.unwrap();
        assert_eq!(result.content, "HELLO");
    }
}
