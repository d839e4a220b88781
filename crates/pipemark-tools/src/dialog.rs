//! User-interface tools answering dialog steps.

use async_trait::async_trait;
use pipemark_types::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogOptions {
    pub title: String,
    /// Text shown to the user.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[async_trait]
pub trait UserInterfaceTools: Send + Sync {
    async fn prompt_dialog(&self, options: &DialogOptions) -> Result<String>;
}

// ---------------------------------------------------------------------------
// DefaultValueDialog
// ---------------------------------------------------------------------------

/// Answers every dialog with its default value, for unattended runs.
pub struct DefaultValueDialog;

#[async_trait]
impl UserInterfaceTools for DefaultValueDialog {
    async fn prompt_dialog(&self, options: &DialogOptions) -> Result<String> {
        Ok(options
            .default_value
            .clone()
            .or_else(|| options.placeholder.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// ConsoleDialog
// ---------------------------------------------------------------------------

pub struct ConsoleDialog;

#[async_trait]
impl UserInterfaceTools for ConsoleDialog {
    async fn prompt_dialog(&self, options: &DialogOptions) -> Result<String> {
        println!("\n{}", options.title);
        if options.message != options.title {
            println!("{}", options.message);
        }
        if let Some(default) = &options.default_value {
            println!("  [default: {default}]");
        }
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let trimmed = input.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(options.default_value.clone().unwrap_or_default());
        }
        Ok(trimmed.to_string())
    }
}

// ---------------------------------------------------------------------------
// RecordingDialog
// ---------------------------------------------------------------------------

/// Plays back canned answers in order and records every dialog it was shown.
/// Once the answers run out it falls back to the dialog's default value.
pub struct RecordingDialog {
    answers: Mutex<Vec<String>>,
    dialogs: Mutex<Vec<DialogOptions>>,
}

impl RecordingDialog {
    pub fn new(answers: Vec<String>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: Mutex::new(reversed),
            dialogs: Mutex::new(Vec::new()),
        }
    }

    pub fn dialogs(&self) -> Vec<DialogOptions> {
        self.dialogs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl UserInterfaceTools for RecordingDialog {
    async fn prompt_dialog(&self, options: &DialogOptions) -> Result<String> {
        self.dialogs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options.clone());
        let answer = self
            .answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| options.default_value.clone().unwrap_or_default());
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog(message: &str, default_value: Option<&str>) -> DialogOptions {
        DialogOptions {
            title: "Question".into(),
            message: message.into(),
            default_value: default_value.map(String::from),
            placeholder: None,
        }
    }

    #[tokio::test]
    async fn default_value_dialog_returns_default() {
        let answer = DefaultValueDialog
            .prompt_dialog(&dialog("Your name?", Some("Anonymous")))
            .await
            .unwrap();
        assert_eq!(answer, "Anonymous");
    }

    #[tokio::test]
    async fn default_value_dialog_falls_back_to_placeholder() {
        let mut options = dialog("Your name?", None);
        options.placeholder = Some("John".into());
        let answer = DefaultValueDialog.prompt_dialog(&options).await.unwrap();
        assert_eq!(answer, "John");

        options.placeholder = None;
        assert_eq!(DefaultValueDialog.prompt_dialog(&options).await.unwrap(), "");
    }

    #[tokio::test]
    async fn recording_plays_back_answers() {
        let recorder = RecordingDialog::new(vec!["Alice".into(), "Paris".into()]);

        let a1 = recorder.prompt_dialog(&dialog("Name?", None)).await.unwrap();
        let a2 = recorder.prompt_dialog(&dialog("City?", None)).await.unwrap();
        let a3 = recorder
            .prompt_dialog(&dialog("Country?", Some("France")))
            .await
            .unwrap();

        assert_eq!(a1, "Alice");
        assert_eq!(a2, "Paris");
        assert_eq!(a3, "France");

        let recorded = recorder.dialogs();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].message, "Name?");
        assert_eq!(recorded[2].default_value.as_deref(), Some("France"));
    }
}
