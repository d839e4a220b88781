use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::LazyLock;

use pipemark_types::{ModelRequirements, ModelRequirementsPatch, PipemarkError, Result, ScriptLanguage};
use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use regex::Regex;
use winnow::Parser as _;

use crate::command::{
    parse_command, result_trailer, Command, ExpectAmountCommand, ExpectSign,
    ModelCommand, ParameterCommand,
};
use crate::document::*;

static PARAMETER_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid regex"));

static LEGACY_INLINE_PARAMETER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`\{([A-Za-z0-9_]+)\}`").expect("valid regex"));

static SCRIPT_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

/// Remove `<!-- ... -->` comments, keeping the newlines they spanned.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        let inside = &rest[start + 4..];
        let (comment, after) = match inside.find("-->") {
            Some(end) => (&inside[..end], &inside[end + 3..]),
            // unterminated comment runs to end of input
            None => (inside, ""),
        };
        out.extend(comment.chars().filter(|&c| c == '\n'));
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Rewrite the legacy `` `{name}` `` spelling to plain `{name}`.
pub(crate) fn normalize_inline_parameters(input: &str) -> String {
    LEGACY_INLINE_PARAMETER
        .replace_all(input, "{$1}")
        .into_owned()
}

/// All `{name}` references in `text`.
pub fn parameter_references(text: &str) -> impl Iterator<Item = &str> {
    PARAMETER_REFERENCE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

/// Kebab-case identifier derived from a heading: `Write a 🖋 Poem!` → `write-a-poem`.
pub fn to_kebab_case(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Outline: heading structure of the source
// ---------------------------------------------------------------------------

struct Heading {
    level: usize,
    title: String,
    range: Range<usize>,
}

struct Section<'s> {
    title: String,
    heading_line: &'s str,
    body: &'s str,
}

struct Outline<'s> {
    title: String,
    head: &'s str,
    sections: Vec<Section<'s>>,
}

fn heading_depth(level: HeadingLevel) -> usize {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn headings(source: &str) -> Vec<Heading> {
    let mut out = Vec::new();
    let mut current: Option<Heading> = None;

    for (event, range) in Parser::new_ext(source, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                current = Some(Heading {
                    level: heading_depth(level),
                    title: String::new(),
                    range,
                });
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(heading) = current.as_mut() {
                    heading.title.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(mut heading) = current.take() {
                    heading.title = heading.title.trim().to_string();
                    out.push(heading);
                }
            }
            _ => {}
        }
    }
    out
}

fn outline(source: &str) -> Result<Outline<'_>> {
    let headings = headings(source);

    let Some(first) = headings.first() else {
        return Err(PipemarkError::syntax(
            "Pipeline must start with a top-level heading (`# Title`)",
            source.lines().find(|l| !l.trim().is_empty()).unwrap_or(""),
        ));
    };

    let preamble = source[..first.range.start].trim();
    if !preamble.is_empty() || first.level != 1 {
        return Err(PipemarkError::syntax(
            "Pipeline must start with a top-level heading (`# Title`)",
            preamble.lines().next().unwrap_or(source[first.range.clone()].trim()),
        ));
    }

    for heading in &headings[1..] {
        let line = source[heading.range.clone()].trim();
        match heading.level {
            1 => {
                return Err(PipemarkError::syntax(
                    "Pipeline can contain only one top-level heading",
                    line,
                ))
            }
            2 => {}
            depth => {
                return Err(PipemarkError::syntax(
                    format!(
                        "Heading level {depth} is not supported, use `#` for the pipeline and `##` for its steps"
                    ),
                    line,
                ))
            }
        }
    }

    let body_end = |i: usize| {
        headings
            .get(i + 1)
            .map(|h| h.range.start)
            .unwrap_or(source.len())
    };

    let sections: Vec<Section<'_>> = headings
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, h)| Section {
            title: h.title.clone(),
            heading_line: source[h.range.clone()].trim(),
            body: &source[h.range.end..body_end(i)],
        })
        .collect();

    if sections.is_empty() {
        return Err(PipemarkError::syntax(
            "Pipeline must contain at least one step (`## Step title`)",
            source[first.range.clone()].trim(),
        ));
    }

    Ok(Outline {
        title: first.title.clone(),
        head: &source[first.range.end..body_end(0)],
        sections,
    })
}

// ---------------------------------------------------------------------------
// Section bodies
// ---------------------------------------------------------------------------

struct CodeBlock {
    language: Option<String>,
    content: String,
}

struct BodyParts {
    items: Vec<String>,
    code_blocks: Vec<CodeBlock>,
    description: Option<String>,
}

/// Text of a list item without its marker (`- `, `* `, `+ `, `1. `, `1) `).
fn list_item_text(raw: &str) -> String {
    let text = raw.trim();
    let without_marker = if let Some(rest) = text.strip_prefix(['-', '*', '+']) {
        rest
    } else {
        let digits = text.len() - text.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        text[digits..]
            .strip_prefix(['.', ')'])
            .unwrap_or(text)
    };
    without_marker.trim().to_string()
}

fn scan_body(body: &str) -> BodyParts {
    let mut items = Vec::new();
    let mut code_blocks = Vec::new();
    let mut removed: Vec<Range<usize>> = Vec::new();
    let mut list_depth = 0usize;
    let mut code: Option<CodeBlock> = None;

    for (event, range) in Parser::new_ext(body, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::List(_)) => {
                if list_depth == 0 {
                    removed.push(range);
                }
                list_depth += 1;
            }
            Event::End(TagEnd::List(_)) => list_depth = list_depth.saturating_sub(1),
            Event::Start(Tag::Item) if list_depth == 1 => {
                items.push(list_item_text(&body[range]));
            }
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) if list_depth == 0 => {
                removed.push(range);
                let language = info
                    .split_whitespace()
                    .next()
                    .map(str::to_string);
                code = Some(CodeBlock {
                    language,
                    content: String::new(),
                });
            }
            Event::Text(text) => {
                if let Some(block) = code.as_mut() {
                    block.content.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(mut block) = code.take() {
                    if block.content.ends_with('\n') {
                        block.content.pop();
                    }
                    code_blocks.push(block);
                }
            }
            _ => {}
        }
    }

    removed.sort_by_key(|r| r.start);
    let mut kept = String::with_capacity(body.len());
    let mut cursor = 0;
    for range in removed {
        if range.start > cursor {
            kept.push_str(&body[cursor..range.start]);
        }
        cursor = cursor.max(range.end);
    }
    if cursor < body.len() {
        kept.push_str(&body[cursor..]);
    }

    BodyParts {
        items,
        code_blocks,
        description: tidy_description(&kept),
    }
}

/// Trim trailing whitespace per line, collapse blank-line runs, and map an
/// empty result to `None`.
fn tidy_description(text: &str) -> Option<String> {
    let mut out = String::new();
    let mut blank_run = false;
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            blank_run = !out.is_empty();
            continue;
        }
        if blank_run {
            out.push_str("\n\n");
        } else if !out.is_empty() {
            out.push('\n');
        }
        blank_run = false;
        out.push_str(line);
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// Parameter table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ParameterTable {
    parameters: Vec<ParameterDeclaration>,
}

impl ParameterTable {
    fn declare(
        &mut self,
        name: &str,
        description: Option<&str>,
        is_input: bool,
        line: &str,
    ) -> Result<()> {
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                match (existing.description.as_deref(), description) {
                    (Some(old), Some(new)) if old != new => {
                        return Err(PipemarkError::syntax(
                            format!(
                                "Parameter {{{name}}} is defined multiple times with different descriptions"
                            ),
                            line,
                        ))
                    }
                    (None, Some(new)) => existing.description = Some(new.to_string()),
                    _ => {}
                }
                existing.is_input |= is_input;
            }
            None => self.parameters.push(ParameterDeclaration {
                name: name.to_string(),
                is_input,
                description: description.map(str::to_string),
            }),
        }
        Ok(())
    }

    fn declare_command(&mut self, command: &ParameterCommand, line: &str) -> Result<()> {
        self.declare(
            &command.name,
            command.description.as_deref(),
            command.is_input,
            line,
        )
    }
}

fn apply_model_command(patch: &mut ModelRequirementsPatch, command: ModelCommand) {
    match command {
        ModelCommand::Variant(v) => patch.model_variant = Some(v),
        ModelCommand::Name(n) => patch.model_name = Some(n),
        ModelCommand::Temperature(t) => patch.temperature = Some(t),
        ModelCommand::MaxTokens(n) => patch.max_tokens = Some(n),
    }
}

fn apply_expectation(
    expect_amount: &mut BTreeMap<ExpectationUnit, ExpectationAmount>,
    command: ExpectAmountCommand,
    line: &str,
) -> Result<()> {
    let bounds = expect_amount.entry(command.unit).or_default();
    let already = |bound: &str| {
        PipemarkError::syntax(
            format!(
                "{bound} expectation of {} is already defined",
                command.unit
            ),
            line,
        )
    };
    if matches!(command.sign, ExpectSign::Exactly | ExpectSign::Minimum) {
        if bounds.min.is_some() {
            return Err(already("Minimum"));
        }
        bounds.min = Some(command.amount);
    }
    if matches!(command.sign, ExpectSign::Exactly | ExpectSign::Maximum) {
        if bounds.max.is_some() {
            return Err(already("Maximum"));
        }
        bounds.max = Some(command.amount);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Head and steps
// ---------------------------------------------------------------------------

struct Head {
    description: Option<String>,
    source_url: Option<String>,
    format_version: Option<String>,
    model_defaults: ModelRequirementsPatch,
}

fn compile_head(head: &str, table: &mut ParameterTable) -> Result<Head> {
    let parts = scan_body(head);
    let mut compiled = Head {
        description: parts.description,
        source_url: None,
        format_version: None,
        model_defaults: ModelRequirementsPatch::default(),
    };

    for item in &parts.items {
        match parse_command(item)? {
            Command::PipelineUrl(url) => {
                if compiled.source_url.replace(url).is_some() {
                    return Err(PipemarkError::syntax(
                        "PIPELINE_URL is declared more than once",
                        item.as_str(),
                    ));
                }
            }
            Command::PipelineVersion(version) => {
                if compiled.format_version.replace(version).is_some() {
                    return Err(PipemarkError::syntax(
                        "PIPELINE_VERSION is declared more than once",
                        item.as_str(),
                    ));
                }
            }
            Command::Model(m) => apply_model_command(&mut compiled.model_defaults, m),
            Command::Parameter(p) => table.declare_command(&p, item)?,
            step_only => {
                return Err(PipemarkError::syntax(
                    format!(
                        "Command {} must be placed inside a step, not in the pipeline head",
                        step_only.keyword()
                    ),
                    item.as_str(),
                ))
            }
        }
    }

    Ok(compiled)
}

fn compile_step(
    section: &Section<'_>,
    index: usize,
    table: &mut ParameterTable,
    model_defaults: &ModelRequirements,
) -> Result<Step> {
    let title = section.title.clone();
    let body = section.body.trim_end();
    let trailer_start = body.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let last_line = body[trailer_start..].trim();

    let mut trailer = last_line;
    let resulting_parameter_name = result_trailer
        .parse_next(&mut trailer)
        .map_err(|_| {
            PipemarkError::syntax(
                format!("Step '{title}' must end with a `-> {{parameterName}}` line"),
                if last_line.is_empty() {
                    section.heading_line
                } else {
                    last_line
                },
            )
        })?
        .to_string();
    let trailer_description = trailer.trim().trim_end_matches('`').trim();
    if trailer_description.contains('{') {
        return Err(PipemarkError::syntax(
            format!("Parameter {{{resulting_parameter_name}}} can not contain another parameter in description"),
            last_line,
        ));
    }

    let parts = scan_body(&body[..trailer_start]);

    let mut execution: Option<ExecutionType> = None;
    let mut model = ModelRequirementsPatch::default();
    let mut jokers: Vec<String> = Vec::new();
    let mut postprocessing = Vec::new();
    let mut expect_amount = BTreeMap::new();
    let mut expect_format = None;

    for item in &parts.items {
        match parse_command(item)? {
            Command::Execute(t) => {
                if execution.replace(t).is_some() {
                    return Err(PipemarkError::syntax(
                        format!("Step '{title}' has more than one EXECUTE command"),
                        item.as_str(),
                    ));
                }
            }
            Command::Model(m) => apply_model_command(&mut model, m),
            Command::Parameter(p) => table.declare_command(&p, item)?,
            Command::Joker(name) => {
                if !jokers.contains(&name) {
                    jokers.push(name);
                }
            }
            Command::Postprocess(function) => postprocessing.push(function),
            Command::ExpectFormat(format) => expect_format = Some(format),
            Command::ExpectAmount(c) => apply_expectation(&mut expect_amount, c, item)?,
            head_only @ (Command::PipelineUrl(_) | Command::PipelineVersion(_)) => {
                return Err(PipemarkError::syntax(
                    format!(
                        "Command {} is only allowed in the pipeline head, not in step '{title}'",
                        head_only.keyword()
                    ),
                    item.as_str(),
                ))
            }
        }
    }

    let code = match parts.code_blocks.as_slice() {
        [block] => block,
        blocks => {
            return Err(PipemarkError::syntax(
                format!(
                    "Step '{title}' must contain exactly one fenced code block, found {}",
                    blocks.len()
                ),
                section.heading_line,
            ))
        }
    };

    let execution = execution.unwrap_or(ExecutionType::PromptTemplate);
    if !model.is_empty() && execution != ExecutionType::PromptTemplate {
        return Err(PipemarkError::syntax(
            format!("MODEL commands are only applicable to PROMPT TEMPLATE steps, but step '{title}' is {execution}"),
            section.heading_line,
        ));
    }

    let kind = match execution {
        ExecutionType::PromptTemplate => StepKind::NaturalLanguage {
            model_requirements: model_defaults.merged_with(&model),
        },
        ExecutionType::SimpleTemplate => StepKind::Template,
        ExecutionType::Script => {
            let tag = code.language.as_deref().unwrap_or("");
            let script_language = ScriptLanguage::from_tag(tag).ok_or_else(|| {
                let supported: Vec<&str> =
                    ScriptLanguage::ALL.iter().map(|l| l.as_str()).collect();
                PipemarkError::syntax(
                    if tag.is_empty() {
                        format!(
                            "Script step '{title}' must declare the language of its code block, one of {}",
                            supported.join(", ")
                        )
                    } else {
                        format!(
                            "Script language `{tag}` of step '{title}' is not supported, use one of {}",
                            supported.join(", ")
                        )
                    },
                    section.heading_line,
                )
            })?;
            StepKind::Script { script_language }
        }
        ExecutionType::PromptDialog => StepKind::Dialog,
    };

    table.declare(
        &resulting_parameter_name,
        if trailer_description.is_empty() {
            None
        } else {
            Some(trailer_description)
        },
        false,
        last_line,
    )?;

    let description = parts.description;
    let mut dependent_parameter_names: BTreeSet<String> = BTreeSet::new();
    for text in [Some(title.as_str()), description.as_deref(), Some(code.content.as_str())]
        .into_iter()
        .flatten()
    {
        dependent_parameter_names.extend(parameter_references(text).map(str::to_string));
    }

    let name = match to_kebab_case(&title) {
        n if n.is_empty() => format!("step-{}", index + 1),
        n => n,
    };

    Ok(Step {
        name,
        title,
        description,
        kind,
        content: code.content.clone(),
        dependent_parameter_names,
        resulting_parameter_name,
        postprocessing,
        expect_amount,
        expect_format,
        jokers,
    })
}

/// Script bodies reference parameters as plain variables. Only the inputs
/// and the results of earlier steps are bound when a script runs, so only
/// identifiers naming one of those count; locals and words in comments that
/// happen to match a later result do not.
fn add_script_dependencies(steps: &mut [Step], table: &ParameterTable) {
    let mut defined: BTreeSet<String> = table
        .parameters
        .iter()
        .filter(|p| p.is_input)
        .map(|p| p.name.clone())
        .collect();
    for step in steps {
        if matches!(step.kind, StepKind::Script { .. }) {
            let referenced: Vec<String> = SCRIPT_IDENTIFIER
                .find_iter(&step.content)
                .map(|m| m.as_str())
                .filter(|id| defined.contains(*id))
                .map(str::to_string)
                .collect();
            step.dependent_parameter_names.extend(referenced);
        }
        defined.insert(step.resulting_parameter_name.clone());
    }
}

/// Compile pipeline source into a [`PipelineDocument`].
///
/// Only syntax is checked here; cross-step rules (ordering, redefinition,
/// expectation bounds) belong to validation.
pub fn compile(source: &str) -> Result<PipelineDocument> {
    let source = normalize_inline_parameters(&strip_comments(source));
    let outline = outline(&source)?;

    let mut table = ParameterTable::default();
    let head = compile_head(outline.head, &mut table)?;
    let model_defaults = ModelRequirements::default().merged_with(&head.model_defaults);

    let mut steps = Vec::with_capacity(outline.sections.len());
    for (index, section) in outline.sections.iter().enumerate() {
        steps.push(compile_step(section, index, &mut table, &model_defaults)?);
    }
    add_script_dependencies(&mut steps, &table);

    tracing::debug!(
        title = %outline.title,
        steps = steps.len(),
        parameters = table.parameters.len(),
        "Compiled pipeline source"
    );

    Ok(PipelineDocument {
        title: outline.title,
        description: head.description,
        format_version: head
            .format_version
            .unwrap_or_else(|| DEFAULT_FORMAT_VERSION.to_string()),
        source_url: head.source_url,
        parameters: table.parameters,
        steps,
    })
}
