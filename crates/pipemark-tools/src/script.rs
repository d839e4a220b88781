use async_trait::async_trait;
use pipemark_types::{Parameters, PipemarkError, Result, ScriptLanguage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// What a script tool is asked to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecutionOptions {
    pub script_language: ScriptLanguage,
    pub script: String,
    pub parameters: Parameters,
}

/// Backend able to run the body of a script step.
///
/// Several tools may be configured for one run; the interpreter tries them
/// in order and only fails when every one of them failed.
#[async_trait]
pub trait ScriptTool: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, options: &ScriptExecutionOptions) -> Result<String>;
}

// ---------------------------------------------------------------------------
// LocalScriptTool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScriptToolOptions {
    pub timeout: Duration,
    pub node_path: PathBuf,
    pub python_path: PathBuf,
}

impl Default for ScriptToolOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            node_path: PathBuf::from("node"),
            python_path: PathBuf::from("python3"),
        }
    }
}

/// Runs scripts through a locally installed interpreter.
///
/// The script body is wrapped into a small program written to the
/// interpreter's stdin. Parameters are bound as variables and exported as
/// `PIPEMARK_PARAM_<NAME>` environment variables. The value the script
/// returns is the result; without a return value, whatever it printed is.
#[derive(Debug, Clone, Default)]
pub struct LocalScriptTool {
    options: ScriptToolOptions,
}

impl LocalScriptTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScriptToolOptions) -> Self {
        Self { options }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    fn interpreter(&self, language: ScriptLanguage) -> Result<&PathBuf> {
        match language {
            ScriptLanguage::Javascript => Ok(&self.options.node_path),
            ScriptLanguage::Python => Ok(&self.options.python_path),
            ScriptLanguage::Typescript => Err(PipemarkError::ToolError {
                tool: self.name().into(),
                message: "typescript scripts are not supported by the local runner".into(),
            }),
        }
    }

    fn tool_error(&self, message: String) -> PipemarkError {
        PipemarkError::ToolError {
            tool: self.name().into(),
            message,
        }
    }
}

#[async_trait]
impl ScriptTool for LocalScriptTool {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, options: &ScriptExecutionOptions) -> Result<String> {
        let interpreter = self.interpreter(options.script_language)?;
        let program = wrap_script(options);

        let mut cmd = tokio::process::Command::new(interpreter);
        cmd.arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &options.parameters {
            cmd.env(format!("PIPEMARK_PARAM_{}", name.to_ascii_uppercase()), value);
        }

        tracing::debug!(
            language = %options.script_language,
            interpreter = %interpreter.display(),
            "running script"
        );

        let mut child = cmd.spawn().map_err(|e| {
            self.tool_error(format!("failed to start {}: {e}", interpreter.display()))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(program.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = match tokio::time::timeout(self.options.timeout, child.wait_with_output()).await
        {
            Ok(output) => output?,
            Err(_) => {
                return Err(PipemarkError::CommandTimeout {
                    timeout_ms: self.options.timeout.as_millis() as u64,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.tool_error(format!(
                "{} exited with {}: {}",
                options.script_language,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Program generation
// ---------------------------------------------------------------------------

/// Build the program fed to the interpreter for `options`.
pub fn wrap_script(options: &ScriptExecutionOptions) -> String {
    let bindings = options
        .parameters
        .iter()
        .filter(|(name, _)| is_identifier(name))
        .map(|(name, value)| (name.as_str(), string_literal(value)));

    match options.script_language {
        ScriptLanguage::Javascript | ScriptLanguage::Typescript => {
            let mut program = String::new();
            for (name, literal) in bindings {
                program.push_str(&format!("const {name} = {literal};\n"));
            }
            program.push_str("const __result = (() => {\n");
            program.push_str(&options.script);
            program.push_str("\n})();\n");
            program.push_str(
                "if (__result !== undefined && __result !== null) process.stdout.write(String(__result));\n",
            );
            program
        }
        ScriptLanguage::Python => {
            let mut program = String::new();
            for (name, literal) in bindings {
                program.push_str(&format!("{name} = {literal}\n"));
            }
            program.push_str("def __main():\n");
            let mut has_body = false;
            for line in options.script.lines() {
                has_body |= !line.trim().is_empty();
                program.push_str("    ");
                program.push_str(line);
                program.push('\n');
            }
            if !has_body {
                program.push_str("    pass\n");
            }
            program.push_str("__result = __main()\n");
            program.push_str("if __result is not None:\n    print(__result, end=\"\")\n");
            program
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// JSON string literals are valid string literals in both JavaScript and
/// Python.
fn string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn options(language: ScriptLanguage, script: &str, params: &[(&str, &str)]) -> ScriptExecutionOptions {
        ScriptExecutionOptions {
            script_language: language,
            script: script.into(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn javascript_program_binds_parameters() {
        let program = wrap_script(&options(
            ScriptLanguage::Javascript,
            "return thing.toUpperCase();",
            &[("thing", "say \"hi\""), ("2bad", "skipped")],
        ));
        assert!(program.starts_with("const thing = \"say \\\"hi\\\"\";\n"));
        assert!(program.contains("return thing.toUpperCase();"));
        assert!(!program.contains("2bad"));
        assert!(program.contains("process.stdout.write"));
    }

    #[test]
    fn python_program_indents_body() {
        let program = wrap_script(&options(
            ScriptLanguage::Python,
            "x = text.upper()\nreturn x",
            &[("text", "abc")],
        ));
        assert!(program.starts_with("text = \"abc\"\n"));
        assert!(program.contains("def __main():\n    x = text.upper()\n    return x\n"));
        assert!(program.contains("__result = __main()"));
    }

    #[test]
    fn python_empty_body_gets_pass() {
        let program = wrap_script(&options(ScriptLanguage::Python, "", &[]));
        assert!(program.contains("def __main():\n    pass\n"));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("thing"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2things"));
        assert!(!is_identifier(""));
    }

    #[tokio::test]
    async fn typescript_is_unsupported() {
        let tool = LocalScriptTool::new();
        let err = tool
            .execute(&options(ScriptLanguage::Typescript, "return 1", &[]))
            .await
            .unwrap_err();
        match err {
            PipemarkError::ToolError { tool, message } => {
                assert_eq!(tool, "local");
                assert!(message.contains("typescript"));
            }
            other => panic!("Expected ToolError, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_interpreter_is_tool_error() {
        let tool = LocalScriptTool::with_options(ScriptToolOptions {
            python_path: PathBuf::from("/nonexistent/python-interpreter"),
            ..Default::default()
        });
        let err = tool
            .execute(&options(ScriptLanguage::Python, "return 1", &[]))
            .await
            .unwrap_err();
        match err {
            PipemarkError::ToolError { message, .. } => {
                assert!(message.contains("failed to start"));
            }
            other => panic!("Expected ToolError, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn python_script_returns_value() {
        if !python_available() {
            return;
        }
        let tool = LocalScriptTool::new();
        let result = tool
            .execute(&options(
                ScriptLanguage::Python,
                "return text.upper() + '!'",
                &[("text", "coffee")],
            ))
            .await
            .unwrap();
        assert_eq!(result, "COFFEE!");
    }

    #[tokio::test]
    async fn python_script_reads_environment() {
        if !python_available() {
            return;
        }
        let tool = LocalScriptTool::new();
        let result = tool
            .execute(&options(
                ScriptLanguage::Python,
                "import os\nreturn os.environ['PIPEMARK_PARAM_TEXT']",
                &[("text", "tea")],
            ))
            .await
            .unwrap();
        assert_eq!(result, "tea");
    }

    #[tokio::test]
    async fn python_failure_is_tool_error() {
        if !python_available() {
            return;
        }
        let tool = LocalScriptTool::new();
        let err = tool
            .execute(&options(ScriptLanguage::Python, "raise ValueError('boom')", &[]))
            .await
            .unwrap_err();
        match err {
            PipemarkError::ToolError { message, .. } => assert!(message.contains("boom")),
            other => panic!("Expected ToolError, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn python_timeout() {
        if !python_available() {
            return;
        }
        let tool = LocalScriptTool::new().with_timeout(Duration::from_millis(200));
        let err = tool
            .execute(&options(
                ScriptLanguage::Python,
                "import time\ntime.sleep(10)\nreturn 1",
                &[],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, PipemarkError::CommandTimeout { timeout_ms: 200 }));
    }
}
