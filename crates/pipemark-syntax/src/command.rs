//! Command Parser: one list item of pipeline source → one typed [`Command`].

use pipemark_types::{ModelVariant, PipemarkError, Result};
use winnow::ascii::{digit1, space0};
use winnow::combinator::{delimited, opt, preceded};
use winnow::token::{take_till, take_while};
use winnow::{ModalResult, Parser};

use crate::document::{ExecutionType, ExpectFormat, ExpectationUnit};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PipelineUrl(String),
    PipelineVersion(String),
    Execute(ExecutionType),
    Model(ModelCommand),
    Parameter(ParameterCommand),
    Joker(String),
    Postprocess(String),
    ExpectFormat(ExpectFormat),
    ExpectAmount(ExpectAmountCommand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelCommand {
    Variant(ModelVariant),
    Name(String),
    Temperature(f32),
    MaxTokens(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCommand {
    pub name: String,
    pub description: Option<String>,
    pub is_input: bool,
    pub is_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectSign {
    Exactly,
    Minimum,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectAmountCommand {
    pub sign: ExpectSign,
    pub amount: u32,
    pub unit: ExpectationUnit,
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::PipelineUrl(_) => "PIPELINE_URL",
            Command::PipelineVersion(_) => "PIPELINE_VERSION",
            Command::Execute(_) => "EXECUTE",
            Command::Model(_) => "MODEL",
            Command::Parameter(_) => "PARAMETER",
            Command::Joker(_) => "JOKER",
            Command::Postprocess(_) => "POSTPROCESS",
            Command::ExpectFormat(_) => "EXPECT_FORMAT",
            Command::ExpectAmount(_) => "EXPECT_AMOUNT",
        }
    }
}

const SUPPORTED_COMMANDS: &str =
    "PIPELINE_URL, PIPELINE_VERSION, EXECUTE, MODEL, PARAMETER, JOKER, POSTPROCESS, EXPECT";

fn command_error(detail: impl std::fmt::Display, raw: &str) -> PipemarkError {
    PipemarkError::syntax(format!("{detail} in `{raw}`"), raw)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Comparison form of a line: uppercase ASCII alphanumerics only, with
/// synonym folding.
pub(crate) fn normalize(raw: &str) -> String {
    let upper: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    upper.replace("DIALOGUE", "DIALOG").replace("EXPECTED", "EXPECT")
}

/// Whitespace-separated tokens with emphasis and inline-code markers trimmed
/// from their edges. A leading bare `PIPELINE` token is noise (`PIPELINE URL ...`).
fn tokenize(raw: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = raw
        .split_whitespace()
        .map(|t| t.trim_matches(|c| c == '*' || c == '`'))
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.first().is_some_and(|t| t.eq_ignore_ascii_case("pipeline")) {
        tokens.remove(0);
    }
    tokens
}

/// Strip the keyword tokens spelled by `keyword` (in normalized form) from
/// the front of `tokens` and return what remains. `MODEL NAME x`,
/// `MODEL_NAME x` and `**Model name** x` all yield `[x]` for `MODELNAME`.
fn arguments<'a, 't>(tokens: &'t [&'a str], keyword: &str) -> Option<&'t [&'a str]> {
    let mut spelled = String::new();
    for (i, token) in tokens.iter().enumerate() {
        spelled.push_str(&normalize(token));
        if spelled == keyword {
            return Some(&tokens[i + 1..]);
        }
        if !keyword.starts_with(spelled.as_str()) {
            return None;
        }
    }
    None
}

fn arguments_any<'a, 't>(tokens: &'t [&'a str], keywords: &[&str]) -> Option<&'t [&'a str]> {
    keywords.iter().find_map(|k| arguments(tokens, k))
}

// ---------------------------------------------------------------------------
// Grammar pieces
// ---------------------------------------------------------------------------

/// Parameter name: [A-Za-z0-9_]+
pub(crate) fn parameter_name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

/// `{name}`
pub(crate) fn braced_name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    delimited('{', parameter_name, '}').parse_next(input)
}

/// Anything up to the first `{`, then `{name}`.
fn parameter_declaration<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    preceded(take_till(0.., '{'), braced_name).parse_next(input)
}

/// Result trailer: `-> {name}`, optionally wrapped in backticks.
pub(crate) fn result_trailer<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let _ = opt('`').parse_next(input)?;
    let _ = "->".parse_next(input)?;
    let _ = space0.parse_next(input)?;
    let name = braced_name.parse_next(input)?;
    let _ = opt('`').parse_next(input)?;
    Ok(name)
}

/// Function identifier: [A-Za-z_][A-Za-z0-9_]*
fn function_name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// MAJOR.MINOR.PATCH with an optional `-pre` suffix.
fn semver<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        digit1,
        '.',
        digit1,
        '.',
        digit1,
        opt(preceded(
            '-',
            take_while(1.., |c: char| {
                c.is_ascii_alphanumeric() || c == '.' || c == '-'
            }),
        )),
    )
        .take()
        .parse_next(input)
}

/// Signed decimal number, kept as text so the caller can report sign and
/// fraction problems separately.
fn number<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (opt(alt_sign), digit1, opt(('.', digit1)))
        .take()
        .parse_next(input)
}

fn alt_sign(input: &mut &str) -> ModalResult<char> {
    winnow::combinator::alt(('-', '+')).parse_next(input)
}

/// Run `parser` over the whole of `text`; `None` unless it consumes everything.
fn parse_all<'i, O>(
    mut parser: impl FnMut(&mut &'i str) -> ModalResult<O>,
    text: &'i str,
) -> Option<O> {
    let mut input = text;
    match parser(&mut input) {
        Ok(value) if input.is_empty() => Some(value),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Parse one list item (without its list marker) into a command.
pub fn parse_command(raw: &str) -> Result<Command> {
    if raw.contains('\n') || raw.contains('\r') {
        return Err(PipemarkError::syntax(
            format!(
                "Command can not contain new line characters in `{}`",
                raw.lines().next().unwrap_or("").trim()
            ),
            raw,
        ));
    }

    let raw = raw.trim();
    let normalized = normalize(raw);
    let tokens = tokenize(raw);

    if raw.starts_with('{') || raw.starts_with('>') {
        return parse_parameter(raw, &normalized, true);
    }

    if normalized.starts_with("PIPELINEURL") || normalized.starts_with("URL") {
        parse_url(raw, &tokens)
    } else if normalized.starts_with("PIPELINEVERSION") {
        parse_version(raw, &tokens)
    } else if normalized.starts_with("EXEC")
        || ExecutionType::ALL
            .iter()
            .any(|t| normalized.starts_with(t.normalized()))
    {
        parse_execute(raw, &normalized)
    } else if normalized.starts_with("MODEL") {
        parse_model(raw, &normalized, &tokens)
    } else if normalized.starts_with("PARAM")
        || normalized.starts_with("INPUTPARAM")
        || normalized.starts_with("OUTPUTPARAM")
    {
        parse_parameter(raw, &normalized, false)
    } else if normalized.starts_with("JOKER") {
        parse_joker(raw, &tokens)
    } else if normalized.starts_with("POSTPROCESS") {
        parse_postprocess(raw, &tokens)
    } else if normalized.starts_with("EXPECTJSON") || normalized.starts_with("EXPECTFORMAT") {
        parse_expect_format(raw, &normalized)
    } else if normalized.starts_with("EXPECT") {
        parse_expect_amount(raw, &tokens)
    } else {
        Err(command_error(
            format!("Unknown command, supported commands are {SUPPORTED_COMMANDS}"),
            raw,
        ))
    }
}

fn single_argument<'a>(raw: &str, tokens: &[&'a str], keywords: &[&str]) -> Result<&'a str> {
    match arguments_any(tokens, keywords) {
        Some([value]) => Ok(*value),
        Some(args) => Err(command_error(
            format!(
                "Invalid {} command, expected exactly one argument but got {}",
                keywords[0],
                args.len()
            ),
            raw,
        )),
        None => Err(command_error(
            format!("Invalid {} command", keywords[0]),
            raw,
        )),
    }
}

fn parse_url(raw: &str, tokens: &[&str]) -> Result<Command> {
    let value = single_argument(raw, tokens, &["PIPELINEURL", "URL"])?;
    let url = url::Url::parse(value)
        .map_err(|e| command_error(format!("Invalid PIPELINE_URL command, {e}"), raw))?;
    if url.scheme() != "https" {
        return Err(command_error(
            "Invalid PIPELINE_URL command, protocol must be HTTPS",
            raw,
        ));
    }
    if url.fragment().is_some() {
        return Err(command_error(
            "Invalid PIPELINE_URL command, URL must not contain a hash",
            raw,
        ));
    }
    Ok(Command::PipelineUrl(value.to_string()))
}

fn parse_version(raw: &str, tokens: &[&str]) -> Result<Command> {
    let value = single_argument(raw, tokens, &["PIPELINEVERSION", "VERSION"])?;
    match parse_all(semver, value) {
        Some(version) => Ok(Command::PipelineVersion(version.to_string())),
        None => Err(command_error(
            format!("Invalid PIPELINE_VERSION command, `{value}` is not a MAJOR.MINOR.PATCH version"),
            raw,
        )),
    }
}

fn parse_execute(raw: &str, normalized: &str) -> Result<Command> {
    let rest = normalized
        .strip_prefix("EXECUTE")
        .or_else(|| normalized.strip_prefix("EXEC"))
        .unwrap_or(normalized);
    ExecutionType::ALL
        .iter()
        .find(|t| t.normalized() == rest)
        .map(|t| Command::Execute(*t))
        .ok_or_else(|| {
            let supported: Vec<String> = ExecutionType::ALL
                .iter()
                .map(|t| t.as_str().replace('_', " "))
                .collect();
            command_error(
                format!(
                    "Unknown execution type, supported execution types are {}",
                    supported.join(", ")
                ),
                raw,
            )
        })
}

fn parse_model(raw: &str, normalized: &str, tokens: &[&str]) -> Result<Command> {
    if let Some(variant) = normalized.strip_prefix("MODELVARIANT") {
        return match variant {
            "CHAT" => Ok(Command::Model(ModelCommand::Variant(ModelVariant::Chat))),
            "COMPLETION" => Ok(Command::Model(ModelCommand::Variant(
                ModelVariant::Completion,
            ))),
            _ => Err(command_error(
                "Unknown model variant, supported variants are CHAT, COMPLETION",
                raw,
            )),
        };
    }

    if normalized.starts_with("MODELNAME") {
        let name = single_argument(raw, tokens, &["MODELNAME"])?;
        return Ok(Command::Model(ModelCommand::Name(name.to_string())));
    }

    if normalized.starts_with("MODELTEMPERATURE") {
        let value = single_argument(raw, tokens, &["MODELTEMPERATURE"])?;
        return match value.parse::<f32>() {
            Ok(t) if t.is_finite() && t >= 0.0 => {
                Ok(Command::Model(ModelCommand::Temperature(t)))
            }
            _ => Err(command_error(
                format!("Invalid MODEL TEMPERATURE `{value}`, expected a non-negative number"),
                raw,
            )),
        };
    }

    if normalized.starts_with("MODELMAXTOKENS") {
        let value = single_argument(raw, tokens, &["MODELMAXTOKENS"])?;
        return match value.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Command::Model(ModelCommand::MaxTokens(n))),
            _ => Err(command_error(
                format!("Invalid MODEL MAX TOKENS `{value}`, expected a positive integer"),
                raw,
            )),
        };
    }

    Err(command_error(
        "Unknown model key, supported keys are VARIANT, NAME, TEMPERATURE, MAX TOKENS",
        raw,
    ))
}

fn parse_parameter(raw: &str, normalized: &str, shorthand: bool) -> Result<Command> {
    let mut rest = raw;
    let name = parameter_declaration
        .parse_next(&mut rest)
        .map_err(|_| command_error("Invalid parameter, expected `{name}`", raw))?;

    let description = rest.trim().trim_end_matches('`').trim();
    if description.contains('{') || description.contains('}') {
        return Err(command_error(
            format!("Parameter {{{name}}} can not contain another parameter in description"),
            raw,
        ));
    }

    let (is_input, is_output) = if shorthand {
        (false, false)
    } else {
        (
            normalized.starts_with("INPUT"),
            normalized.starts_with("OUTPUT"),
        )
    };

    Ok(Command::Parameter(ParameterCommand {
        name: name.to_string(),
        description: if description.is_empty() {
            None
        } else {
            Some(description.to_string())
        },
        is_input,
        is_output,
    }))
}

fn parse_joker(raw: &str, tokens: &[&str]) -> Result<Command> {
    let value = single_argument(raw, tokens, &["JOKER"])?;
    parse_all(braced_name, value)
        .map(|name| Command::Joker(name.to_string()))
        .ok_or_else(|| command_error("Invalid JOKER command, expected `{name}`", raw))
}

fn parse_postprocess(raw: &str, tokens: &[&str]) -> Result<Command> {
    let value = single_argument(raw, tokens, &["POSTPROCESSING", "POSTPROCESS"])?;
    parse_all(function_name, value)
        .map(|name| Command::Postprocess(name.to_string()))
        .ok_or_else(|| {
            command_error(
                format!("Invalid POSTPROCESS command, `{value}` is not a function name"),
                raw,
            )
        })
}

fn parse_expect_format(raw: &str, normalized: &str) -> Result<Command> {
    let format = normalized
        .strip_prefix("EXPECTFORMAT")
        .or_else(|| normalized.strip_prefix("EXPECT"))
        .unwrap_or(normalized);
    match format {
        "JSON" => Ok(Command::ExpectFormat(ExpectFormat::Json)),
        _ => Err(command_error(
            "Unknown expected format, supported formats are JSON",
            raw,
        )),
    }
}

fn parse_expect_amount(raw: &str, tokens: &[&str]) -> Result<Command> {
    let expect_error = |detail: String| command_error(format!("Invalid EXPECT command, {detail}"), raw);

    let args = match arguments(tokens, "EXPECT") {
        Some(args) if args.len() == 3 => args,
        Some(args) => {
            return Err(expect_error(format!(
                "expected `EXPECT <EXACTLY|MIN|MAX> <amount> <unit>` but got {} arguments",
                args.len()
            )))
        }
        None => return Err(expect_error("malformed keyword".to_string())),
    };

    let sign_raw = normalize(args[0]);
    let sign = if sign_raw.starts_with("EXACT") {
        ExpectSign::Exactly
    } else if sign_raw.starts_with("MIN") {
        ExpectSign::Minimum
    } else if sign_raw.starts_with("MAX") {
        ExpectSign::Maximum
    } else {
        return Err(expect_error(format!(
            "invalid sign `{}`, expected EXACTLY, MIN or MAX",
            args[0]
        )));
    };

    let amount_raw = args[1];
    let amount_text = parse_all(number, amount_raw)
        .ok_or_else(|| expect_error(format!("invalid amount `{amount_raw}`")))?;
    if amount_text.starts_with('-') {
        return Err(expect_error(
            "amount must be positive number or zero".to_string(),
        ));
    }
    if amount_text.contains('.') {
        return Err(expect_error("amount must be whole number".to_string()));
    }
    let amount: u32 = amount_text
        .trim_start_matches('+')
        .parse()
        .map_err(|_| expect_error(format!("amount `{amount_raw}` is too large")))?;

    let unit = match_unit(args[2]).map_err(expect_error)?;

    Ok(Command::ExpectAmount(ExpectAmountCommand { sign, amount, unit }))
}

/// Match a unit spelling against the known units by prefix in either
/// direction: `w`, `word`, `Words` and `wordsss` all mean WORDS.
fn match_unit(raw: &str) -> std::result::Result<ExpectationUnit, String> {
    let spelled = normalize(raw);
    if spelled.is_empty() {
        return Err(format!("invalid unit `{raw}`"));
    }
    let matches: Vec<ExpectationUnit> = ExpectationUnit::ALL
        .iter()
        .copied()
        .filter(|u| spelled.starts_with(u.stem()) || u.stem().starts_with(spelled.as_str()))
        .collect();
    match matches.as_slice() {
        [unit] => Ok(*unit),
        [] => Err(format!("invalid unit `{raw}`")),
        _ => Err(format!("ambiguous unit `{raw}`")),
    }
}
