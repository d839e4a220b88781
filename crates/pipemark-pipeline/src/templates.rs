//! `{parameter}` interpolation.

use std::sync::LazyLock;

use pipemark_types::{Parameters, PipemarkError, Result};
use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid regex"));

/// Replace every `{name}` placeholder in `template` with its value.
///
/// Validation guarantees that every placeholder of a step is defined before
/// the step runs, so a missing value is reported as an internal error.
/// Braces that do not form a placeholder, such as JSON objects, are kept.
pub fn replace_parameters(template: &str, parameters: &Parameters) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = parameters.get(name.as_str()).ok_or_else(|| {
            PipemarkError::Unexpected(format!(
                "Parameter {{{}}} is not defined when interpolating the template",
                name.as_str()
            ))
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_single_parameter() {
        let p = params(&[("thing", "coffee")]);
        assert_eq!(replace_parameters("I bought {thing}.", &p).unwrap(), "I bought coffee.");
    }

    #[test]
    fn replaces_repeated_and_multiple_parameters() {
        let p = params(&[("a", "1"), ("b", "2")]);
        assert_eq!(replace_parameters("{a}+{a}={b}", &p).unwrap(), "1+1=2");
    }

    #[test]
    fn values_are_not_interpolated_again() {
        let p = params(&[("a", "{b}"), ("b", "x")]);
        assert_eq!(replace_parameters("{a}", &p).unwrap(), "{b}");
    }

    #[test]
    fn non_placeholder_braces_are_kept() {
        let p = params(&[]);
        let template = r#"{"json": true} and { spaced } and {}"#;
        assert_eq!(replace_parameters(template, &p).unwrap(), template);
    }

    #[test]
    fn missing_parameter_is_unexpected() {
        let err = replace_parameters("Hi {name}", &params(&[])).unwrap_err();
        match err {
            PipemarkError::Unexpected(message) => assert!(message.contains("{name}")),
            other => panic!("Expected Unexpected, got: {other:?}"),
        }
    }
}
