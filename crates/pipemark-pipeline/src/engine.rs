//! Pipeline interpreter: walks the step chain from the entry step to the
//! end, dispatching each step to its execution strategy.

use std::sync::Arc;
use std::time::Instant;

use pipemark_llm::{call_model, Prompt, Usage};
use pipemark_syntax::{Step, StepKind};
use pipemark_tools::{DialogOptions, ScriptExecutionOptions};
use pipemark_types::{Parameters, PipemarkError, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::events::{EventEmitter, ProgressEvent};
use crate::expectations::check_expectations;
use crate::fallback::try_in_order;
use crate::pipeline::Pipeline;
use crate::templates::replace_parameters;
use crate::tools::ExecutionTools;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Runs one pipeline against a set of execution tools.
///
/// The executor holds no per-run state; each call to [`execute`] gets its
/// own parameter environment, so one executor may serve concurrent runs.
///
/// [`execute`]: PipelineExecutor::execute
pub struct PipelineExecutor {
    pipeline: Arc<Pipeline>,
    tools: ExecutionTools,
}

/// The result of a completed run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub run_id: Uuid,
    /// Inputs plus the resulting parameter of every step.
    pub parameters: Parameters,
    pub steps: Vec<StepRecord>,
    pub usage: Usage,
}

/// What one step produced and how.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: String,
    pub resulting_parameter: String,
    pub value: String,
    /// Model or tool that answered, for steps calling out to a backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Joker whose value was taken instead of executing the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joker: Option<String>,
    pub usage: Usage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    AwaitingStep(usize),
    Done,
}

/// Raw output of dispatching a step to its strategy.
struct Dispatched {
    text: String,
    backend: Option<String>,
    usage: Usage,
}

impl Dispatched {
    fn local(text: String) -> Self {
        Self {
            text,
            backend: None,
            usage: Usage::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    pub fn new(pipeline: Arc<Pipeline>, tools: ExecutionTools) -> Self {
        Self { pipeline, tools }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run the pipeline with the given input parameters.
    pub async fn execute(&self, inputs: Parameters) -> Result<PipelineResult> {
        self.run(inputs, None).await
    }

    /// Run the pipeline, reporting progress through `events`.
    pub async fn execute_with_progress(
        &self,
        inputs: Parameters,
        events: &EventEmitter,
    ) -> Result<PipelineResult> {
        self.run(inputs, Some(events)).await
    }

    async fn run(&self, inputs: Parameters, events: Option<&EventEmitter>) -> Result<PipelineResult> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let title = self.pipeline.title().to_string();
        tracing::info!(run_id = %run_id, pipeline = %title, "Pipeline started");
        emit(events, || ProgressEvent::PipelineStarted {
            run_id,
            pipeline: title.clone(),
            step_count: self.pipeline.steps().len(),
        });

        let result = self.run_steps(run_id, inputs, events).await;

        match &result {
            Ok(_) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(run_id = %run_id, pipeline = %title, duration_ms, "Pipeline completed");
                emit(events, || ProgressEvent::PipelineCompleted {
                    run_id,
                    pipeline: title.clone(),
                    duration_ms,
                });
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, pipeline = %title, error = %e, "Pipeline failed");
                emit(events, || ProgressEvent::PipelineFailed {
                    run_id,
                    pipeline: title.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_steps(
        &self,
        run_id: Uuid,
        inputs: Parameters,
        events: Option<&EventEmitter>,
    ) -> Result<PipelineResult> {
        let mut parameters = self.bind_inputs(inputs)?;
        let mut records = Vec::new();
        let mut usage = Usage::default();
        let mut state = RunState::AwaitingStep(0);

        loop {
            let index = match state {
                RunState::AwaitingStep(index) => index,
                RunState::Done => break,
            };
            let step = self.pipeline.step_at(index).ok_or_else(|| {
                PipemarkError::Unexpected(format!("Step index {index} is out of range"))
            })?;

            let record = self.execute_step(run_id, step, &parameters, events).await?;

            if parameters.contains_key(&step.resulting_parameter_name) {
                return Err(PipemarkError::Unexpected(format!(
                    "Parameter {{{}}} was already defined before step '{}'",
                    step.resulting_parameter_name, step.name
                )));
            }
            parameters.insert(step.resulting_parameter_name.clone(), record.value.clone());
            usage += record.usage;
            records.push(record);

            state = match self.pipeline.next_index(index) {
                Some(next) => RunState::AwaitingStep(next),
                None => RunState::Done,
            };
        }

        Ok(PipelineResult {
            run_id,
            parameters,
            steps: records,
            usage,
        })
    }

    /// Keep the declared inputs; every one of them is required.
    fn bind_inputs(&self, mut inputs: Parameters) -> Result<Parameters> {
        let mut bound = Parameters::new();
        for declaration in self.pipeline.input_parameters() {
            let value = inputs.remove(&declaration.name).ok_or_else(|| {
                PipemarkError::MissingInput {
                    parameter: declaration.name.clone(),
                }
            })?;
            bound.insert(declaration.name.clone(), value);
        }
        for name in inputs.keys() {
            tracing::warn!(parameter = %name, pipeline = %self.pipeline.title(), "Ignoring undeclared input parameter");
        }
        Ok(bound)
    }

    async fn execute_step(
        &self,
        run_id: Uuid,
        step: &Step,
        parameters: &Parameters,
        events: Option<&EventEmitter>,
    ) -> Result<StepRecord> {
        let started = Instant::now();
        tracing::info!(run_id = %run_id, step = %step.name, execution_type = %step.execution_type(), "Step started");

        if let Some((joker, value)) = self.first_satisfying_joker(step, parameters) {
            tracing::info!(run_id = %run_id, step = %step.name, joker = %joker, "Step resolved by joker");
            return Ok(StepRecord {
                step: step.name.clone(),
                resulting_parameter: step.resulting_parameter_name.clone(),
                value,
                backend: None,
                joker: Some(joker),
                usage: Usage::default(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let progress_visible = matches!(step.kind, StepKind::NaturalLanguage { .. });
        if progress_visible {
            emit(events, || ProgressEvent::StepStarted {
                run_id,
                step: step.name.clone(),
                title: step.title.clone(),
            });
        }

        let dispatched = self.dispatch(step, parameters).await?;
        let value = self.postprocess(step, dispatched.text)?;
        check_expectations(&value, step).map_err(|message| PipemarkError::ExpectationsNotMet {
            step: step.name.clone(),
            message,
        })?;

        let duration_ms = started.elapsed().as_millis() as u64;
        if progress_visible {
            emit(events, || ProgressEvent::StepCompleted {
                run_id,
                step: step.name.clone(),
                resulting_parameter: step.resulting_parameter_name.clone(),
                duration_ms,
            });
        }
        tracing::info!(run_id = %run_id, step = %step.name, duration_ms, "Step completed");

        Ok(StepRecord {
            step: step.name.clone(),
            resulting_parameter: step.resulting_parameter_name.clone(),
            value,
            backend: dispatched.backend,
            joker: None,
            usage: dispatched.usage,
            duration_ms,
        })
    }

    /// The first joker whose current value already meets the step's
    /// expectations.
    fn first_satisfying_joker(&self, step: &Step, parameters: &Parameters) -> Option<(String, String)> {
        step.jokers.iter().find_map(|joker| {
            let value = parameters.get(joker)?;
            check_expectations(value, step)
                .ok()
                .map(|()| (joker.clone(), value.clone()))
        })
    }

    async fn dispatch(&self, step: &Step, parameters: &Parameters) -> Result<Dispatched> {
        match &step.kind {
            StepKind::Template => Ok(Dispatched::local(replace_parameters(&step.content, parameters)?)),

            StepKind::NaturalLanguage { model_requirements } => {
                let tools = self.tools.natural_language.as_ref().ok_or_else(|| {
                    missing_tools(step, "natural-language tools")
                })?;
                let prompt = Prompt {
                    title: step.title.clone(),
                    content: replace_parameters(&step.content, parameters)?,
                    model_requirements: model_requirements.clone(),
                    pipeline_url: self.pipeline.source_url().map(String::from),
                    step_name: step.name.clone(),
                    parameters: parameters.clone(),
                };
                tracing::debug!(
                    prompt = %prompt.id(),
                    tools = %tools.name(),
                    variant = %model_requirements.model_variant,
                    "Calling natural-language tools"
                );
                let result = call_model(tools.as_ref(), &prompt).await?;
                Ok(Dispatched {
                    text: result.content,
                    backend: Some(result.model_name),
                    usage: result.usage,
                })
            }

            StepKind::Script { script_language } => {
                if self.tools.script.is_empty() {
                    return Err(missing_tools(step, "script tools"));
                }
                let options = ScriptExecutionOptions {
                    script_language: *script_language,
                    script: step.content.clone(),
                    parameters: parameters.clone(),
                };
                let (tool, text) = try_in_order(
                    &self.tools.script,
                    |tool| tool.name().to_string(),
                    |tool| {
                        let tool = Arc::clone(tool);
                        let options = &options;
                        async move {
                            let text = tool.execute(options).await?;
                            Ok::<_, PipemarkError>((tool.name().to_string(), text))
                        }
                    },
                )
                .await
                .map_err(|exhausted| PipemarkError::ScriptToolsExhausted {
                    step: step.name.clone(),
                    failures: exhausted
                        .failures
                        .into_iter()
                        .map(|(name, e)| format!("{name}: {e}"))
                        .collect(),
                })?;
                Ok(Dispatched {
                    text,
                    backend: Some(tool),
                    usage: Usage::default(),
                })
            }

            StepKind::Dialog => {
                let tools = self.tools.user_interface.as_ref().ok_or_else(|| {
                    missing_tools(step, "user-interface tools")
                })?;
                let message = match &step.description {
                    Some(description) => replace_parameters(description, parameters)?,
                    None => step.title.clone(),
                };
                let default_value = replace_parameters(&step.content, parameters)?;
                let options = DialogOptions {
                    title: step.title.clone(),
                    message,
                    default_value: Some(default_value.clone()),
                    placeholder: Some(default_value),
                };
                Ok(Dispatched::local(tools.prompt_dialog(&options).await?))
            }
        }
    }

    fn postprocess(&self, step: &Step, mut text: String) -> Result<String> {
        for name in &step.postprocessing {
            text = self.tools.postprocessing.apply(name, &text).ok_or_else(|| {
                PipemarkError::execution(
                    step.name.clone(),
                    format!("Unknown postprocessing function '{name}'"),
                )
            })?;
        }
        Ok(text)
    }
}

fn missing_tools(step: &Step, what: &str) -> PipemarkError {
    PipemarkError::Configuration(format!(
        "Step '{}' is a {} step but no {what} are configured",
        step.name,
        step.execution_type()
    ))
}

fn emit(events: Option<&EventEmitter>, event: impl FnOnce() -> ProgressEvent) {
    if let Some(events) = events {
        events.emit(event());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
# Greeting

- INPUT PARAMETER {name}

## Greet

- EXECUTE SIMPLE TEMPLATE
- POSTPROCESS toUpperCase

```
Hello {name}
```

-> {greeting}
";

    fn executor(source: &str, tools: ExecutionTools) -> PipelineExecutor {
        PipelineExecutor::new(Arc::new(Pipeline::from_source(source).unwrap()), tools)
    }

    fn inputs(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn template_step_with_postprocessing() {
        let result = executor(SOURCE, ExecutionTools::new())
            .execute(inputs(&[("name", "Ada")]))
            .await
            .unwrap();
        assert_eq!(result.parameters["greeting"], "HELLO ADA");
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].step, "greet");
        assert!(result.steps[0].backend.is_none());
    }

    #[tokio::test]
    async fn missing_input_is_rejected() {
        let err = executor(SOURCE, ExecutionTools::new())
            .execute(Parameters::new())
            .await
            .unwrap_err();
        match err {
            PipemarkError::MissingInput { parameter } => assert_eq!(parameter, "name"),
            other => panic!("Expected MissingInput, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undeclared_inputs_are_dropped() {
        let result = executor(SOURCE, ExecutionTools::new())
            .execute(inputs(&[("name", "Ada"), ("extra", "ignored")]))
            .await
            .unwrap();
        assert!(!result.parameters.contains_key("extra"));
        assert_eq!(result.parameters.len(), 2);
    }

    #[tokio::test]
    async fn unknown_postprocessing_function_fails_step() {
        let source = SOURCE.replace("toUpperCase", "shout");
        let err = executor(&source, ExecutionTools::new())
            .execute(inputs(&[("name", "Ada")]))
            .await
            .unwrap_err();
        match err {
            PipemarkError::Execution { step, message } => {
                assert_eq!(step, "greet");
                assert!(message.contains("'shout'"));
            }
            other => panic!("Expected Execution, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn prompt_step_without_tools_is_configuration_error() {
        let source = SOURCE.replace("- EXECUTE SIMPLE TEMPLATE\n", "");
        let err = executor(&source, ExecutionTools::new())
            .execute(inputs(&[("name", "Ada")]))
            .await
            .unwrap_err();
        match err {
            PipemarkError::Configuration(message) => {
                assert!(message.contains("PROMPT_TEMPLATE"));
                assert!(message.contains("natural-language tools"));
            }
            other => panic!("Expected Configuration, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn each_run_gets_a_fresh_environment() {
        let exec = executor(SOURCE, ExecutionTools::new());
        let first = exec.execute(inputs(&[("name", "Ada")])).await.unwrap();
        let second = exec.execute(inputs(&[("name", "Bob")])).await.unwrap();
        assert_eq!(first.parameters["greeting"], "HELLO ADA");
        assert_eq!(second.parameters["greeting"], "HELLO BOB");
        assert_ne!(first.run_id, second.run_id);
    }
}
