//! Semantic validation of compiled pipeline documents: lint rules and
//! diagnostics.
//!
//! The rules replay the steps in declared order against a growing set of
//! defined parameter names. Call [`validate`] for every diagnostic or
//! [`validate_or_raise`] to fail on the first `Error`-severity issue.

use std::collections::{BTreeSet, HashMap, HashSet};

use pipemark_syntax::{parameter_references, PipelineDocument, Step};
use pipemark_types::{PipemarkError, Result};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    /// Name of the offending step, when the issue belongs to one.
    pub step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic>;
}

impl Diagnostic {
    fn error(rule: &dyn LintRule, step: Option<&Step>, message: String) -> Self {
        Self {
            rule: rule.name().into(),
            severity: Severity::Error,
            message,
            step: step.map(|s| s.name.clone()),
        }
    }

    fn warning(rule: &dyn LintRule, message: String) -> Self {
        Self {
            rule: rule.name().into(),
            severity: Severity::Warning,
            message,
            step: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn input_names(document: &PipelineDocument) -> HashSet<&str> {
    document
        .input_parameters()
        .map(|p| p.name.as_str())
        .collect()
}

/// Every parameter a step reads: the stored dependencies plus a fresh scan
/// of its title, description and content, so documents loaded from JSON
/// cannot hide a reference behind a stale dependency set.
fn references(step: &Step) -> BTreeSet<&str> {
    let mut names: BTreeSet<&str> = step
        .dependent_parameter_names
        .iter()
        .map(String::as_str)
        .collect();
    for text in [
        Some(step.title.as_str()),
        step.description.as_deref(),
        Some(step.content.as_str()),
    ]
    .into_iter()
    .flatten()
    {
        names.extend(parameter_references(text));
    }
    names
}

/// Index of the first step producing each parameter.
fn producers(document: &PipelineDocument) -> HashMap<&str, usize> {
    let mut producers = HashMap::new();
    for (index, step) in document.steps.iter().enumerate() {
        producers
            .entry(step.resulting_parameter_name.as_str())
            .or_insert(index);
    }
    producers
}

/// Whether `from` depends, directly or through other steps, on the result
/// of step `target`.
fn depends_on(
    document: &PipelineDocument,
    producers: &HashMap<&str, usize>,
    from: usize,
    target: usize,
) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(index) = stack.pop() {
        if !seen.insert(index) {
            continue;
        }
        for dependency in references(&document.steps[index]) {
            match producers.get(dependency) {
                Some(&producer) if producer == target => return true,
                Some(&producer) => stack.push(producer),
                None => {}
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct StepsPresentRule;
impl LintRule for StepsPresentRule {
    fn name(&self) -> &str { "steps_present" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        if document.steps.is_empty() {
            vec![Diagnostic::error(
                self,
                None,
                format!("Pipeline '{}' has no steps", document.title),
            )]
        } else {
            vec![]
        }
    }
}

struct UniqueStepNamesRule;
impl LintRule for UniqueStepNamesRule {
    fn name(&self) -> &str { "unique_step_names" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        document
            .steps
            .iter()
            .filter(|step| !seen.insert(step.name.as_str()))
            .map(|step| {
                Diagnostic::error(
                    self,
                    Some(step),
                    format!("Step name '{}' is used by more than one step", step.name),
                )
            })
            .collect()
    }
}

struct UniqueParametersRule;
impl LintRule for UniqueParametersRule {
    fn name(&self) -> &str { "unique_parameters" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        document
            .parameters
            .iter()
            .filter(|p| !seen.insert(p.name.as_str()))
            .map(|p| {
                Diagnostic::error(
                    self,
                    None,
                    format!("Parameter {{{}}} is declared more than once", p.name),
                )
            })
            .collect()
    }
}

struct UnresolvedDependencyRule;
impl LintRule for UnresolvedDependencyRule {
    fn name(&self) -> &str { "unresolved_dependency" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let producers = producers(document);
        let mut defined = input_names(document);
        let mut diagnostics = Vec::new();

        for (index, step) in document.steps.iter().enumerate() {
            for name in references(step) {
                if defined.contains(name) {
                    continue;
                }
                let reason = match producers.get(name) {
                    Some(&producer) if producer == index => {
                        "circular dependency on its own result".to_string()
                    }
                    Some(&producer) => {
                        let other = &document.steps[producer].title;
                        if depends_on(document, &producers, producer, index) {
                            format!("circular dependency with step '{other}'")
                        } else {
                            format!("forward dependency on later step '{other}'")
                        }
                    }
                    None => "undefined parameter".to_string(),
                };
                diagnostics.push(Diagnostic::error(
                    self,
                    Some(step),
                    format!(
                        "Step '{}' cannot resolve {{{name}}}: {reason}",
                        step.title
                    ),
                ));
            }
            defined.insert(step.resulting_parameter_name.as_str());
        }
        diagnostics
    }
}

struct DuplicateResultRule;
impl LintRule for DuplicateResultRule {
    fn name(&self) -> &str { "duplicate_result" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let mut defined = input_names(document);
        let mut diagnostics = Vec::new();
        for step in &document.steps {
            let name = step.resulting_parameter_name.as_str();
            if !defined.insert(name) {
                diagnostics.push(Diagnostic::error(
                    self,
                    Some(step),
                    format!(
                        "Parameter {{{name}}} is defined multiple times; step '{}' redefines it",
                        step.title
                    ),
                ));
            }
        }
        diagnostics
    }
}

struct JokerRule;
impl LintRule for JokerRule {
    fn name(&self) -> &str { "joker" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let mut defined = input_names(document);
        let mut diagnostics = Vec::new();
        for step in &document.steps {
            if !step.jokers.is_empty() && !step.has_expectations() {
                diagnostics.push(Diagnostic::error(
                    self,
                    Some(step),
                    format!(
                        "Step '{}' declares jokers but no expectations; jokers are only checked against EXPECT commands",
                        step.title
                    ),
                ));
            }
            for joker in &step.jokers {
                if !defined.contains(joker.as_str()) {
                    diagnostics.push(Diagnostic::error(
                        self,
                        Some(step),
                        format!(
                            "Joker {{{joker}}} of step '{}' is not defined before the step",
                            step.title
                        ),
                    ));
                }
            }
            defined.insert(step.resulting_parameter_name.as_str());
        }
        diagnostics
    }
}

struct ExpectationBoundsRule;
impl LintRule for ExpectationBoundsRule {
    fn name(&self) -> &str { "expectation_bounds" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for step in &document.steps {
            for (unit, amount) in &step.expect_amount {
                if let (Some(min), Some(max)) = (amount.min, amount.max) {
                    if min > max {
                        diagnostics.push(Diagnostic::error(
                            self,
                            Some(step),
                            format!(
                                "Min expectation ({min}) of {unit} is greater than max expectation ({max}) in step '{}'",
                                step.title
                            ),
                        ));
                    }
                }
                if amount.max == Some(0) {
                    diagnostics.push(Diagnostic::error(
                        self,
                        Some(step),
                        format!(
                            "Max expectation of {unit} must be positive in step '{}'",
                            step.title
                        ),
                    ));
                }
            }
        }
        diagnostics
    }
}

struct UnusedParameterRule;
impl LintRule for UnusedParameterRule {
    fn name(&self) -> &str { "unused_parameter" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let used: BTreeSet<&str> = document
            .steps
            .iter()
            .flat_map(|s| s.dependent_parameter_names.iter().chain(&s.jokers))
            .map(String::as_str)
            .collect();
        document
            .input_parameters()
            .filter(|p| !used.contains(p.name.as_str()))
            .map(|p| {
                Diagnostic::warning(
                    self,
                    format!("Input parameter {{{}}} is never used by any step", p.name),
                )
            })
            .collect()
    }
}

struct UnproducedParameterRule;
impl LintRule for UnproducedParameterRule {
    fn name(&self) -> &str { "unproduced_parameter" }
    fn apply(&self, document: &PipelineDocument) -> Vec<Diagnostic> {
        let produced: HashSet<&str> = document
            .steps
            .iter()
            .map(|s| s.resulting_parameter_name.as_str())
            .collect();
        document
            .parameters
            .iter()
            .filter(|p| !p.is_input && !produced.contains(p.name.as_str()))
            .map(|p| {
                Diagnostic::warning(
                    self,
                    format!("Parameter {{{}}} is neither an input nor produced by any step", p.name),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all lint rules in order and collect every diagnostic.
pub fn validate(document: &PipelineDocument) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(StepsPresentRule),
        Box::new(UniqueStepNamesRule),
        Box::new(UniqueParametersRule),
        Box::new(UnresolvedDependencyRule),
        Box::new(DuplicateResultRule),
        Box::new(JokerRule),
        Box::new(ExpectationBoundsRule),
        Box::new(UnusedParameterRule),
        Box::new(UnproducedParameterRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(document));
    }
    diagnostics
}

/// Run all lint rules; return the first `Error`-severity diagnostic as a
/// validation error, or the remaining warnings.
pub fn validate_or_raise(document: &PipelineDocument) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(document);
    if let Some(error) = diagnostics.iter().find(|d| d.severity == Severity::Error) {
        tracing::debug!(rule = %error.rule, pipeline = %document.title, "validation failed");
        return Err(PipemarkError::Validation {
            rule: error.rule.clone(),
            message: error.message.clone(),
        });
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pipemark_syntax::{compile, ExpectationAmount, ExpectationUnit};

    fn template_step(title: &str, content: &str, result: &str) -> String {
        format!("## {title}\n\n- EXECUTE SIMPLE TEMPLATE\n\n```\n{content}\n```\n\n-> {{{result}}}\n\n")
    }

    fn document(inputs: &[&str], steps: &[String]) -> PipelineDocument {
        let mut source = String::from("# Test pipeline\n\n");
        for input in inputs {
            source.push_str(&format!("- INPUT PARAMETER {{{input}}}\n"));
        }
        source.push('\n');
        for step in steps {
            source.push_str(step);
        }
        compile(&source).unwrap()
    }

    fn errors(document: &PipelineDocument) -> Vec<Diagnostic> {
        validate(document)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .collect()
    }

    #[test]
    fn valid_pipeline_passes() {
        let doc = document(
            &["thing"],
            &[
                template_step("Receipt", "I bought {thing}.", "receipt"),
                template_step("Shout", "{receipt}!", "shout"),
            ],
        );
        let diagnostics = validate_or_raise(&doc).unwrap();
        assert!(diagnostics.is_empty(), "Expected no diagnostics, got: {diagnostics:?}");
    }

    #[test]
    fn forward_dependency_is_rejected() {
        let doc = document(
            &[],
            &[
                template_step("Use word", "The word is {word}", "sentence"),
                template_step("Make word", "hello", "word"),
            ],
        );
        let errs = errors(&doc);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].rule, "unresolved_dependency");
        assert_eq!(errs[0].step.as_deref(), Some("use-word"));
        assert!(errs[0].message.contains("cannot resolve {word}"));
        assert!(errs[0].message.contains("forward dependency"));
    }

    #[test]
    fn circular_dependency_is_rejected() {
        let doc = document(
            &[],
            &[
                template_step("First", "{b}", "a"),
                template_step("Second", "{a}", "b"),
            ],
        );
        let errs = errors(&doc);
        assert_eq!(errs[0].rule, "unresolved_dependency");
        assert!(errs[0].message.contains("circular dependency with step 'Second'"));
    }

    #[test]
    fn self_reference_is_circular() {
        let doc = document(&[], &[template_step("Loop", "{x} again", "x")]);
        let errs = errors(&doc);
        assert!(errs[0].message.contains("circular dependency"));
    }

    #[test]
    fn undefined_parameter_is_rejected() {
        let doc = document(&[], &[template_step("Greet", "Hi {name}", "greeting")]);
        let err = validate_or_raise(&doc).unwrap_err();
        match err {
            PipemarkError::Validation { rule, message } => {
                assert_eq!(rule, "unresolved_dependency");
                assert!(message.contains("undefined parameter"));
            }
            other => panic!("Expected Validation, got: {other:?}"),
        }
    }

    #[test]
    fn duplicate_result_is_rejected() {
        let doc = document(
            &["topic"],
            &[
                template_step("One", "{topic}", "out"),
                template_step("Two", "{topic}", "out"),
            ],
        );
        let errs = errors(&doc);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].rule, "duplicate_result");
        assert!(errs[0].message.contains("defined multiple times"));
    }

    #[test]
    fn result_redefining_input_is_rejected() {
        let doc = document(&["topic"], &[template_step("One", "{topic}", "topic")]);
        assert_eq!(errors(&doc)[0].rule, "duplicate_result");
    }

    #[test]
    fn joker_without_expectations_is_rejected() {
        let mut doc = document(&["fallback"], &[template_step("One", "{fallback}", "out")]);
        doc.steps[0].jokers = vec!["fallback".into()];
        let errs = errors(&doc);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].rule, "joker");
        assert!(errs[0].message.contains("no expectations"));

        doc.steps[0].expect_amount.insert(
            ExpectationUnit::Words,
            ExpectationAmount { min: Some(1), max: None },
        );
        assert!(errors(&doc).is_empty());
    }

    #[test]
    fn joker_must_be_defined_before_step() {
        let mut doc = document(&["topic"], &[template_step("One", "{topic}", "out")]);
        doc.steps[0].jokers = vec!["missing".into()];
        doc.steps[0].expect_format = Some(pipemark_syntax::ExpectFormat::Json);
        let errs = errors(&doc);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("Joker {missing}"));
    }

    #[test]
    fn min_greater_than_max_is_rejected() {
        let mut doc = document(&["topic"], &[template_step("One", "{topic}", "out")]);
        doc.steps[0].expect_amount.insert(
            ExpectationUnit::Words,
            ExpectationAmount { min: Some(5), max: Some(2) },
        );
        let errs = errors(&doc);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].rule, "expectation_bounds");
        assert!(errs[0].message.contains("greater than max"));
    }

    #[test]
    fn max_zero_is_rejected_for_every_unit() {
        for unit in ExpectationUnit::ALL {
            let mut doc = document(&["topic"], &[template_step("One", "{topic}", "out")]);
            doc.steps[0]
                .expect_amount
                .insert(unit, ExpectationAmount { min: None, max: Some(0) });
            let errs = errors(&doc);
            assert_eq!(errs.len(), 1, "unit {unit}");
            assert!(errs[0].message.contains("must be positive"));
        }
    }

    #[test]
    fn missing_steps_is_rejected() {
        let mut doc = document(&["topic"], &[template_step("One", "{topic}", "out")]);
        doc.steps.clear();
        let err = validate_or_raise(&doc).unwrap_err();
        assert!(matches!(err, PipemarkError::Validation { ref rule, .. } if rule == "steps_present"));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let mut doc = document(
            &["topic"],
            &[
                template_step("One", "{topic}", "a"),
                template_step("Two", "{topic}", "b"),
            ],
        );
        doc.steps[1].name = "one".into();
        assert_eq!(errors(&doc)[0].rule, "unique_step_names");
    }

    #[test]
    fn unused_input_and_unproduced_parameter_are_warnings() {
        let source = "# P\n\n- INPUT PARAMETER {unused}\n- INPUT PARAMETER {topic}\n- OUTPUT PARAMETER {never}\n\n".to_string()
            + &template_step("One", "{topic}", "out");
        let doc = compile(&source).unwrap();
        let diagnostics = validate_or_raise(&doc).unwrap();
        let rules: Vec<_> = diagnostics.iter().map(|d| d.rule.as_str()).collect();
        assert_eq!(rules, vec!["unused_parameter", "unproduced_parameter"]);
        assert!(diagnostics.iter().all(|d| d.severity == Severity::Warning));
    }
}
