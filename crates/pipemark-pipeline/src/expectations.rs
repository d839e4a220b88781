//! Checking step results against `EXPECT` constraints.

use std::sync::LazyLock;

use pipemark_syntax::{ExpectFormat, ExpectationUnit, Step};
use regex::Regex;

/// Lines that make up one page.
const LINES_PER_PAGE: usize = 44;

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n[ \t\r]*\n").expect("valid regex"));

/// How many of `unit` the text contains.
pub fn count_units(text: &str, unit: ExpectationUnit) -> usize {
    match unit {
        ExpectationUnit::Characters => text.chars().count(),
        ExpectationUnit::Words => text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .count(),
        ExpectationUnit::Sentences => text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count(),
        ExpectationUnit::Paragraphs => BLANK_LINE
            .split(text)
            .filter(|p| !p.trim().is_empty())
            .count(),
        ExpectationUnit::Lines => text.lines().count(),
        ExpectationUnit::Pages => text.lines().count().div_ceil(LINES_PER_PAGE),
    }
}

/// Check `text` against the step's format and amount expectations.
///
/// Returns a description of the first unmet expectation.
pub fn check_expectations(text: &str, step: &Step) -> Result<(), String> {
    if let Some(ExpectFormat::Json) = step.expect_format {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(text) {
            return Err(format!("Expected valid JSON: {e}"));
        }
    }

    for (unit, amount) in &step.expect_amount {
        let count = count_units(text, *unit);
        if let Some(min) = amount.min {
            if count < min as usize {
                return Err(format!("Expected at least {min} {unit} but got {count}"));
            }
        }
        if let Some(max) = amount.max {
            if count > max as usize {
                return Err(format!("Expected at most {max} {unit} but got {count}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemark_syntax::{ExpectationAmount, StepKind};

    fn step() -> Step {
        Step {
            name: "s".into(),
            title: "S".into(),
            description: None,
            kind: StepKind::Template,
            content: String::new(),
            dependent_parameter_names: Default::default(),
            resulting_parameter_name: "out".into(),
            postprocessing: vec![],
            expect_amount: Default::default(),
            expect_format: None,
            jokers: vec![],
        }
    }

    #[test]
    fn counts() {
        let text = "Hello, world! How are you?\n\nFine.\nThanks";
        assert_eq!(count_units(text, ExpectationUnit::Words), 7);
        assert_eq!(count_units(text, ExpectationUnit::Sentences), 4);
        assert_eq!(count_units(text, ExpectationUnit::Paragraphs), 2);
        assert_eq!(count_units(text, ExpectationUnit::Lines), 4);
        assert_eq!(count_units(text, ExpectationUnit::Pages), 1);
        assert_eq!(count_units("žluť", ExpectationUnit::Characters), 4);
    }

    #[test]
    fn empty_text_counts_zero() {
        for unit in ExpectationUnit::ALL {
            assert_eq!(count_units("", unit), 0, "unit {unit}");
        }
    }

    #[test]
    fn paragraphs_split_on_crlf_blank_lines() {
        assert_eq!(count_units("a\r\n\r\nb", ExpectationUnit::Paragraphs), 2);
        assert_eq!(count_units("a\r\n \r\nb\r\nc", ExpectationUnit::Paragraphs), 2);
        assert_eq!(count_units("a\r\nb", ExpectationUnit::Paragraphs), 1);
    }

    #[test]
    fn pages_round_up() {
        let text = "line\n".repeat(45);
        assert_eq!(count_units(&text, ExpectationUnit::Pages), 2);
    }

    #[test]
    fn amount_bounds() {
        let mut s = step();
        s.expect_amount.insert(
            ExpectationUnit::Words,
            ExpectationAmount { min: Some(2), max: Some(3) },
        );
        assert!(check_expectations("two words", &s).is_ok());
        assert_eq!(
            check_expectations("one", &s).unwrap_err(),
            "Expected at least 2 words but got 1"
        );
        assert_eq!(
            check_expectations("one two three four", &s).unwrap_err(),
            "Expected at most 3 words but got 4"
        );
    }

    #[test]
    fn json_format() {
        let mut s = step();
        s.expect_format = Some(ExpectFormat::Json);
        assert!(check_expectations(r#"{"a": [1, 2]}"#, &s).is_ok());
        let err = check_expectations("not json", &s).unwrap_err();
        assert!(err.starts_with("Expected valid JSON"));
    }
}
