//! Immutable, validated pipeline with index-based step navigation.

use std::collections::HashMap;

use pipemark_syntax::{compile, document_from_json, ParameterDeclaration, PipelineDocument, Step};
use pipemark_types::Result;

use crate::validation::{validate_or_raise, Diagnostic};

/// A validated pipeline document, ready to be executed any number of times.
///
/// The only way to obtain one is through validation, so every `Pipeline`
/// upholds the document invariants and has at least one step.
#[derive(Debug, Clone)]
pub struct Pipeline {
    document: PipelineDocument,
    index: HashMap<String, usize>,
    warnings: Vec<Diagnostic>,
}

impl Pipeline {
    pub fn new(document: PipelineDocument) -> Result<Self> {
        let warnings = validate_or_raise(&document)?;
        let index = document
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.name.clone(), i))
            .collect();
        Ok(Self {
            document,
            index,
            warnings,
        })
    }

    /// Compile pipeline source and validate the result.
    pub fn from_source(source: &str) -> Result<Self> {
        Self::new(compile(source)?)
    }

    /// Parse a canonical JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::new(document_from_json(json)?)
    }

    pub fn document(&self) -> &PipelineDocument {
        &self.document
    }

    pub fn title(&self) -> &str {
        &self.document.title
    }

    pub fn source_url(&self) -> Option<&str> {
        self.document.source_url.as_deref()
    }

    /// Non-fatal diagnostics reported while validating.
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn steps(&self) -> &[Step] {
        &self.document.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.step_index(name).map(|i| &self.document.steps[i])
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn step_at(&self, index: usize) -> Option<&Step> {
        self.document.steps.get(index)
    }

    pub fn entry_step(&self) -> &Step {
        // validation rejects documents without steps
        &self.document.steps[0]
    }

    /// Step following `name` in the chain, `None` after the last one.
    pub fn next_step(&self, name: &str) -> Option<&Step> {
        self.step_index(name)
            .and_then(|i| self.next_index(i))
            .map(|i| &self.document.steps[i])
    }

    pub fn next_index(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.document.steps.len()).then_some(next)
    }

    /// Declaration of the parameter produced by the step called `step_name`.
    pub fn resulting_parameter(&self, step_name: &str) -> Option<&ParameterDeclaration> {
        self.step(step_name)
            .and_then(|step| self.document.parameter(&step.resulting_parameter_name))
    }

    pub fn input_parameters(&self) -> impl Iterator<Item = &ParameterDeclaration> {
        self.document.input_parameters()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pipemark_types::PipemarkError;

    const SOURCE: &str = "\
# Story pipeline

- PIPELINE URL https://example.com/story.md
- INPUT PARAMETER {topic} What the story is about

## Write title

- EXECUTE SIMPLE TEMPLATE

```
A story about {topic}
```

-> {title} The story title

## Write body

- EXECUTE SIMPLE TEMPLATE

```
{title}: once upon a time
```

-> {body}
";

    #[test]
    fn navigation() {
        let pipeline = Pipeline::from_source(SOURCE).unwrap();
        assert_eq!(pipeline.title(), "Story pipeline");
        assert_eq!(pipeline.source_url(), Some("https://example.com/story.md"));
        assert_eq!(pipeline.entry_step().name, "write-title");
        assert_eq!(pipeline.step_index("write-body"), Some(1));
        assert_eq!(pipeline.next_step("write-title").unwrap().name, "write-body");
        assert!(pipeline.next_step("write-body").is_none());
        assert!(pipeline.next_step("missing").is_none());
        assert_eq!(pipeline.next_index(0), Some(1));
        assert_eq!(pipeline.next_index(1), None);
        assert_eq!(pipeline.step_at(1).unwrap().title, "Write body");
        assert!(pipeline.step_at(2).is_none());
    }

    #[test]
    fn resulting_parameter_and_inputs() {
        let pipeline = Pipeline::from_source(SOURCE).unwrap();
        let title = pipeline.resulting_parameter("write-title").unwrap();
        assert_eq!(title.name, "title");
        assert_eq!(title.description.as_deref(), Some("The story title"));
        let inputs: Vec<_> = pipeline.input_parameters().map(|p| p.name.as_str()).collect();
        assert_eq!(inputs, vec!["topic"]);
        assert!(pipeline.warnings().is_empty());
    }

    #[test]
    fn invalid_document_cannot_become_pipeline() {
        let source = SOURCE.replace("A story about {topic}", "A story about {body}");
        let err = Pipeline::from_source(&source).unwrap_err();
        assert!(matches!(err, PipemarkError::Validation { .. }));
        assert!(err.is_compile_time());
    }

    #[test]
    fn from_json_round_trip() {
        let pipeline = Pipeline::from_source(SOURCE).unwrap();
        let json = pipeline.document().to_json().unwrap();
        let again = Pipeline::from_json(&json).unwrap();
        assert_eq!(again.document(), pipeline.document());
    }

    #[test]
    fn from_json_rescans_content_behind_stale_dependencies() {
        let mut document = compile(SOURCE).unwrap();
        document.steps[1].content = "{title}: once upon a time, said {ghost}".into();
        let json = document.to_json().unwrap();

        let err = Pipeline::from_json(&json).unwrap_err();
        match err {
            PipemarkError::Validation { rule, message } => {
                assert_eq!(rule, "unresolved_dependency");
                assert!(message.contains("cannot resolve {ghost}"), "{message}");
                assert!(message.contains("undefined parameter"), "{message}");
            }
            other => panic!("Expected Validation, got: {other:?}"),
        }
    }
}
