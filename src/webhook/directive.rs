//! Slash commands in issue comments.
//!
//! Grammar: `/<command> [key=value, ...] free text`. The bracket block is
//! optional and must come directly after the command. A block that never
//! closes is treated as free text. A closed block with an entry that is not
//! `key=value` is dropped as a whole and the free text after it still counts.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Ask,
    Enhance,
    Retry,
}

impl Command {
    pub const ALL: [Command; 4] = [Self::Help, Self::Ask, Self::Enhance, Self::Retry];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Ask => "ask",
            Self::Enhance => "enhance",
            Self::Retry => "retry",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    fn usage(&self) -> &'static str {
        match self {
            Self::Help => "/help",
            Self::Ask => "/ask [model=X] <question>",
            Self::Enhance => "/enhance [model=X, repo=owner/name]",
            Self::Retry => "/retry [model=X, repo=owner/name] [feedback]",
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            Self::Help => "Show this help message",
            Self::Ask => "Research a question about this issue and answer it in a reply",
            Self::Enhance => "Enhance this issue if it has not been enhanced yet",
            Self::Retry => "Re-run the enhancement, optionally with feedback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub command: Command,
    pub overrides: BTreeMap<String, String>,
    pub text: String,
    /// A closed override block was present but could not be parsed.
    pub dropped_block: bool,
}

/// Parse a comment body. `None` when the comment is not a known command.
pub fn parse_directive(body: &str) -> Option<Directive> {
    let rest = body.trim().strip_prefix('/')?;
    let (name, rest) = match rest.find(|c: char| c.is_whitespace() || c == '[') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let command = Command::from_name(&name.to_lowercase())?;
    let rest = rest.trim_start();

    let mut directive = Directive {
        command,
        overrides: BTreeMap::new(),
        text: rest.trim().to_string(),
        dropped_block: false,
    };

    let Some(block) = rest.strip_prefix('[') else {
        return Some(directive);
    };
    let Some(close) = block.find(']') else {
        // Unterminated block: keep everything as free text.
        return Some(directive);
    };

    directive.text = block[close + 1..].trim().to_string();
    match parse_block(&block[..close]) {
        Some(overrides) => directive.overrides = overrides,
        None => {
            tracing::debug!(block = %&block[..close], "Dropping malformed override block");
            directive.dropped_block = true;
        }
    }
    Some(directive)
}

fn parse_block(block: &str) -> Option<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for entry in block.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, value) = entry.split_once('=')?;
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return None;
        }
        overrides.insert(key, value.to_string());
    }
    Some(overrides)
}

pub fn help_text() -> String {
    let mut lines = vec!["## Available Commands".to_string(), String::new()];
    for command in Command::ALL {
        lines.push(format!("**`{}`**", command.usage()));
        lines.push(command.summary().to_string());
        lines.push(String::new());
    }
    lines.push("---".to_string());
    lines.push("_Models: `opus`, `sonnet`, `haiku`, or a full model id._".to_string());
    lines.join("\n")
}
