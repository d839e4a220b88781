use pipemark_types::{ModelRequirements, PipemarkError, Result, ScriptLanguage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Format version stamped on documents that do not declare `PIPELINE_VERSION`.
pub const DEFAULT_FORMAT_VERSION: &str = "1.0.0";

/// Structured result of compiling pipeline source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDocument {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub format_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub parameters: Vec<ParameterDeclaration>,
    pub steps: Vec<Step>,
}

impl PipelineDocument {
    /// Canonical JSON rendering. Stable across compile → serialize → parse cycles.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDeclaration> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn input_parameters(&self) -> impl Iterator<Item = &ParameterDeclaration> {
        self.parameters.iter().filter(|p| p.is_input)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDeclaration {
    pub name: String,
    pub is_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One unit of pipeline execution.
///
/// The fields every step shares live here; what differs between execution
/// kinds lives in [`StepKind`], flattened into the same JSON object under
/// the `executionType` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    pub content: String,
    pub dependent_parameter_names: BTreeSet<String>,
    pub resulting_parameter_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postprocessing: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expect_amount: BTreeMap<ExpectationUnit, ExpectationAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_format: Option<ExpectFormat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jokers: Vec<String>,
}

impl Step {
    pub fn execution_type(&self) -> ExecutionType {
        match self.kind {
            StepKind::NaturalLanguage { .. } => ExecutionType::PromptTemplate,
            StepKind::Template => ExecutionType::SimpleTemplate,
            StepKind::Script { .. } => ExecutionType::Script,
            StepKind::Dialog => ExecutionType::PromptDialog,
        }
    }

    /// Whether the step declares any `EXPECT` constraint on its result.
    pub fn has_expectations(&self) -> bool {
        !self.expect_amount.is_empty() || self.expect_format.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executionType")]
pub enum StepKind {
    #[serde(rename = "PROMPT_TEMPLATE", rename_all = "camelCase")]
    NaturalLanguage {
        model_requirements: ModelRequirements,
    },
    #[serde(rename = "SIMPLE_TEMPLATE")]
    Template,
    #[serde(rename = "SCRIPT", rename_all = "camelCase")]
    Script { script_language: ScriptLanguage },
    #[serde(rename = "PROMPT_DIALOG")]
    Dialog,
}

/// The four execution kinds as named by the `EXECUTE` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionType {
    PromptTemplate,
    SimpleTemplate,
    Script,
    PromptDialog,
}

impl ExecutionType {
    pub const ALL: [ExecutionType; 4] = [
        ExecutionType::PromptTemplate,
        ExecutionType::SimpleTemplate,
        ExecutionType::Script,
        ExecutionType::PromptDialog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::PromptTemplate => "PROMPT_TEMPLATE",
            ExecutionType::SimpleTemplate => "SIMPLE_TEMPLATE",
            ExecutionType::Script => "SCRIPT",
            ExecutionType::PromptDialog => "PROMPT_DIALOG",
        }
    }

    /// Normalized comparison form: uppercase with separators removed.
    pub(crate) fn normalized(&self) -> &'static str {
        match self {
            ExecutionType::PromptTemplate => "PROMPTTEMPLATE",
            ExecutionType::SimpleTemplate => "SIMPLETEMPLATE",
            ExecutionType::Script => "SCRIPT",
            ExecutionType::PromptDialog => "PROMPTDIALOG",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Expectations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectationUnit {
    Characters,
    Words,
    Sentences,
    Paragraphs,
    Lines,
    Pages,
}

impl ExpectationUnit {
    pub const ALL: [ExpectationUnit; 6] = [
        ExpectationUnit::Characters,
        ExpectationUnit::Words,
        ExpectationUnit::Sentences,
        ExpectationUnit::Paragraphs,
        ExpectationUnit::Lines,
        ExpectationUnit::Pages,
    ];

    /// Singular stem used for prefix matching of unit spellings.
    pub(crate) fn stem(&self) -> &'static str {
        match self {
            ExpectationUnit::Characters => "CHAR",
            ExpectationUnit::Words => "WORD",
            ExpectationUnit::Sentences => "SENTENCE",
            ExpectationUnit::Paragraphs => "PARAGRAPH",
            ExpectationUnit::Lines => "LINE",
            ExpectationUnit::Pages => "PAGE",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpectationUnit::Characters => "characters",
            ExpectationUnit::Words => "words",
            ExpectationUnit::Sentences => "sentences",
            ExpectationUnit::Paragraphs => "paragraphs",
            ExpectationUnit::Lines => "lines",
            ExpectationUnit::Pages => "pages",
        }
    }
}

impl fmt::Display for ExpectationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive bounds on the amount of one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationAmount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectFormat {
    Json,
}

impl fmt::Display for ExpectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectFormat::Json => f.write_str("JSON"),
        }
    }
}

/// Convert `PipemarkError::Json` from a malformed document into a syntax
/// error so callers see one taxonomy for bad documents.
pub fn document_from_json(json: &str) -> Result<PipelineDocument> {
    PipelineDocument::from_json(json).map_err(|e| match e {
        PipemarkError::Json(inner) => PipemarkError::syntax(
            format!("Invalid pipeline document JSON: {inner}"),
            json.lines().nth(inner.line().saturating_sub(1)).unwrap_or(""),
        ),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemark_types::ModelVariant;

    fn sample_step() -> Step {
        Step {
            name: "write-greeting".into(),
            title: "Write greeting".into(),
            description: None,
            kind: StepKind::NaturalLanguage {
                model_requirements: ModelRequirements {
                    model_variant: ModelVariant::Chat,
                    model_name: Some("gpt-4o-mini".into()),
                    temperature: Some(0.7),
                    max_tokens: None,
                },
            },
            content: "Say hello to {name}".into(),
            dependent_parameter_names: ["name".to_string()].into_iter().collect(),
            resulting_parameter_name: "greeting".into(),
            postprocessing: vec!["trim".into()],
            expect_amount: [(
                ExpectationUnit::Words,
                ExpectationAmount {
                    min: Some(1),
                    max: Some(20),
                },
            )]
            .into_iter()
            .collect(),
            expect_format: None,
            jokers: vec![],
        }
    }

    #[test]
    fn step_kind_is_flattened_under_execution_type() {
        let json = serde_json::to_value(sample_step()).unwrap();
        assert_eq!(json["executionType"], "PROMPT_TEMPLATE");
        assert_eq!(json["modelRequirements"]["modelVariant"], "CHAT");
        assert_eq!(json["expectAmount"]["WORDS"]["max"], 20);
        assert!(json.get("jokers").is_none());
        assert!(json.get("expectFormat").is_none());
    }

    #[test]
    fn step_round_trips_through_json() {
        let step = sample_step();
        let json = serde_json::to_string(&step).unwrap();
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn script_kind_serializes_language() {
        let mut step = sample_step();
        step.kind = StepKind::Script {
            script_language: ScriptLanguage::Python,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["executionType"], "SCRIPT");
        assert_eq!(json["scriptLanguage"], "python");
        assert_eq!(step.execution_type(), ExecutionType::Script);
    }

    #[test]
    fn has_expectations() {
        let mut step = sample_step();
        assert!(step.has_expectations());
        step.expect_amount.clear();
        assert!(!step.has_expectations());
        step.expect_format = Some(ExpectFormat::Json);
        assert!(step.has_expectations());
    }

    #[test]
    fn malformed_document_json_is_a_syntax_error() {
        let err = document_from_json("{\"title\": 3}").unwrap_err();
        assert!(err.is_compile_time());
    }
}
