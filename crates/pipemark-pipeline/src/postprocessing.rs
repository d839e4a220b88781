//! Named functions applied to a step's raw result before it is stored.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

pub type PostprocessFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Registry of postprocessing functions by the name used in `POSTPROCESS`.
#[derive(Clone)]
pub struct PostprocessingRegistry {
    functions: HashMap<String, PostprocessFn>,
}

impl PostprocessingRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// A registry holding the built-in text functions.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("trim", |s| s.trim().to_string());
        reg.register("trimCodeBlock", trim_code_block);
        reg.register("trimEndOfCodeBlock", trim_end_of_code_block);
        reg.register("removeQuotes", remove_quotes);
        reg.register("unwrapResult", unwrap_result);
        reg.register("removeMarkdownFormatting", remove_markdown_formatting);
        reg.register("normalizeWhitespaces", |s| {
            s.split_whitespace().collect::<Vec<_>>().join(" ")
        });
        reg.register("toUpperCase", |s| s.to_uppercase());
        reg.register("toLowerCase", |s| s.to_lowercase());
        reg
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&str) -> String + Send + Sync + 'static,
    ) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&PostprocessFn> {
        self.functions.get(name)
    }

    /// Apply the function called `name`, or `None` when no such function exists.
    pub fn apply(&self, name: &str, text: &str) -> Option<String> {
        self.get(name).map(|f| f(text))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PostprocessingRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for PostprocessingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostprocessingRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// Remove a fence that wraps the whole text, including its language tag.
fn trim_code_block(text: &str) -> String {
    let trimmed = text.trim();
    if !(trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() >= 6) {
        return trimmed.to_string();
    }
    let inner = &trimmed[3..trimmed.len() - 3];
    // drop the language tag line
    let inner = match inner.split_once('\n') {
        Some((_, rest)) => rest,
        None => inner,
    };
    inner.trim().to_string()
}

/// Cut everything from the first closing fence on.
fn trim_end_of_code_block(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.find("```") {
        Some(position) => trimmed[..position].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

const QUOTE_PAIRS: [(char, char); 6] = [
    ('"', '"'),
    ('\'', '\''),
    ('`', '`'),
    ('“', '”'),
    ('‘', '’'),
    ('«', '»'),
];

fn remove_quotes(text: &str) -> String {
    let trimmed = text.trim();
    for (open, close) in QUOTE_PAIRS {
        if let Some(inner) = trimmed
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
        {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

/// Strip an introductory line such as `Here is the result:` and the quotes
/// around what follows.
fn unwrap_result(text: &str) -> String {
    let trimmed = text.trim();
    let body = match trimmed.split_once('\n') {
        Some((first, rest)) if first.trim_end().ends_with(':') && !rest.trim().is_empty() => rest,
        _ => trimmed,
    };
    remove_quotes(body)
}

static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\*\*|__)(.+?)(\*\*|__)").expect("valid regex"));
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").expect("valid regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]+)`").expect("valid regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+").expect("valid regex"));

fn remove_markdown_formatting(text: &str) -> String {
    let text = BOLD.replace_all(text, "$2");
    let text = ITALIC.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    HEADING.replace_all(&text, "").into_owned()
}
