use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::{PipelineError, Stage};

/// Model shorthands accepted in `[model=…]` and the config file.
const MODEL_SHORTHANDS: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-5"),
    ("sonnet", "claude-sonnet-4-5"),
    ("haiku", "claude-haiku-4-5"),
];

/// Map a shorthand to its model id; anything else passes through.
pub fn resolve_model(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    MODEL_SHORTHANDS
        .iter()
        .find(|(short, _)| *short == lower)
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| name.trim().to_string())
}

/// A language model that turns a prompt into text.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String>;
}

/// Runs the `claude` CLI in print mode with the prompt on stdin.
pub struct ClaudeCli {
    cmd: String,
}

impl ClaudeCli {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

#[async_trait]
impl Synthesizer for ClaudeCli {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let mut child = Command::new(&self.cmd)
            .args(["--print", "--model", model])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to stdin")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for claude process")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "claude exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        String::from_utf8(output.stdout).context("Invalid UTF-8 in claude output")
    }
}

/// The synthesized replacement for an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedIssue {
    pub title: String,
    pub description: String,
}

impl EnhancedIssue {
    /// Parse model output. A JSON object with `title` and `description` wins;
    /// otherwise non-empty plain text becomes the description under
    /// `fallback_title`.
    pub fn parse(output: &str, fallback_title: &str) -> Result<Self, PipelineError> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            title: String,
            #[serde(default)]
            description: String,
        }

        if let Some(raw) = json_object(output).and_then(|j| serde_json::from_str::<Raw>(&j).ok()) {
            let description = raw.description.trim();
            if !description.is_empty() {
                let title = match raw.title.trim() {
                    "" => fallback_title,
                    title => title,
                };
                return Ok(Self {
                    title: title.to_string(),
                    description: description.to_string(),
                });
            }
        }

        let text = strip_fence(output.trim());
        if text.is_empty() {
            return Err(PipelineError::EmptyOutput {
                stage: Stage::Synthesis,
                reason: "model returned no description".into(),
            });
        }
        Ok(Self {
            title: fallback_title.to_string(),
            description: text.to_string(),
        })
    }
}

/// Outermost `{…}` in `text`, skipping braces inside JSON strings.
fn json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.strip_suffix("```").unwrap_or(body).trim()
}

pub fn enhance_prompt(title: &str, notes: &str, context: &str, code: &str) -> String {
    format!(
        "You are improving an issue in an issue tracker.\n\n\
         ## Issue title\n{title}\n\n\
         ## Author's notes\n{notes}\n\n\
         ## Related discussions and documents\n{context}\n\n\
         ## Related code\n{code}\n\n\
         Write a clear, actionable issue. Reply with a single JSON object: \
         {{\"title\": \"...\", \"description\": \"markdown\"}}. \
         Keep the author's intent. Do not invent facts that are not supported above.",
        notes = if notes.trim().is_empty() { "_No description_" } else { notes.trim() },
    )
}

pub fn retry_prompt(
    title: &str,
    notes: &str,
    previous: &str,
    feedback: &str,
    context: &str,
    code: &str,
) -> String {
    format!(
        "{}\n\n## Previous enhanced description\n{}\n\n## Reviewer feedback\n{}\n\n\
         Rewrite the description to address the feedback.",
        enhance_prompt(title, notes, context, code),
        if previous.trim().is_empty() { "_None_" } else { previous.trim() },
        if feedback.trim().is_empty() { "_No specific feedback_" } else { feedback.trim() },
    )
}

pub fn ask_prompt(title: &str, description: &str, question: &str, context: &str, code: &str) -> String {
    format!(
        "Answer a question about this issue.\n\n\
         ## Issue: {title}\n{description}\n\n\
         ## Related discussions and documents\n{context}\n\n\
         ## Related code\n{code}\n\n\
         ## Question\n{question}\n\n\
         Give a clear, direct answer in markdown with specific references where helpful."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthands_map_to_model_ids() {
        assert_eq!(resolve_model("opus"), "claude-opus-4-5");
        assert_eq!(resolve_model(" Sonnet "), "claude-sonnet-4-5");
        assert_eq!(resolve_model("haiku"), "claude-haiku-4-5");
        assert_eq!(resolve_model("claude-custom-1"), "claude-custom-1");
    }

    #[test]
    fn parse_prefers_embedded_json() {
        let out = "Sure, here it is:\n{\"title\": \"Fix {braces} in login\", \"description\": \"## Summary\\nDo it\"}\nThanks";
        let issue = EnhancedIssue::parse(out, "orig").unwrap();
        assert_eq!(issue.title, "Fix {braces} in login");
        assert_eq!(issue.description, "## Summary\nDo it");
    }

    #[test]
    fn parse_keeps_original_title_when_missing() {
        let issue = EnhancedIssue::parse(r#"{"description": "body"}"#, "orig").unwrap();
        assert_eq!(issue.title, "orig");
    }

    #[test]
    fn parse_falls_back_to_plain_text() {
        let issue = EnhancedIssue::parse("```markdown\n## Summary\nPlain\n```", "orig").unwrap();
        assert_eq!(issue.title, "orig");
        assert_eq!(issue.description, "## Summary\nPlain");
    }

    #[test]
    fn blank_output_is_an_empty_output_error() {
        let err = EnhancedIssue::parse("  \n ", "orig").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmptyOutput {
                stage: Stage::Synthesis,
                ..
            }
        ));
    }

    #[test]
    fn json_object_handles_unbalanced_input() {
        assert_eq!(json_object("no json"), None);
        assert_eq!(json_object("{\"a\": 1"), None);
        assert_eq!(json_object("x {\"a\": \"}\"} y").as_deref(), Some("{\"a\": \"}\"}"));
    }

    #[test]
    fn retry_prompt_carries_feedback_and_previous_text() {
        let prompt = retry_prompt("t", "", "old text", "focus on auth", "ctx", "code");
        assert!(prompt.contains("old text"));
        assert!(prompt.contains("focus on auth"));
        assert!(prompt.contains("_No description_"));
    }
}
