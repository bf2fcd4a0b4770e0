//! Prompt-template library
//!
//! Named templates with `{arg}` interpolation. The multiplexer asks for a
//! template by name and supplies named arguments; a missing template is an
//! error the caller logs and recovers from.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

/// System message for plain shell questions.
pub const SHELL_SYSTEM_MESSAGE: &str = "ShellSystemMessage";
/// Suggest a brand-new command from history alone.
pub const AUTOSUGGEST_NEW_COMMAND: &str = "ShellAutosuggestNewCommand";
/// Complete a partially typed command.
pub const AUTOSUGGEST_COMMAND: &str = "ShellAutosuggestCommand";
/// Complete a partially typed natural-language prompt.
pub const AUTOSUGGEST_PROMPT: &str = "ShellAutosuggestPrompt";

const DEFAULT_SHELL_SYSTEM_MESSAGE: &str = "You are an assistant helping the user \
with a unix shell. Give advice about commands to run and interpret the output of \
commands. Be concise: answer in a sentence or two when possible, use command \
examples where they help. The recent shell history is included so you can answer \
contextual questions about it.";

const DEFAULT_AUTOSUGGEST_NEW_COMMAND: &str = "The following is a log of a unix \
shell session. Predict the next command the user will run. Respond with only the \
command, no commentary and no quotes.\n\n{history}\n";

const DEFAULT_AUTOSUGGEST_COMMAND: &str = "The following is a log of a unix shell \
session, followed by the start of a command the user is typing. Complete the \
command. Respond with only the full command, no commentary and no quotes.\n\n\
{history}\n\nThe user is typing:\n{command}";

const DEFAULT_AUTOSUGGEST_PROMPT: &str = "The following is a log of a unix shell \
session, followed by the start of a question the user is asking an AI assistant. \
Complete the question. Respond with only the full question, no commentary and no \
quotes.\n\n{history}\n\nThe user is typing:\n{command}";

/// In-memory template store, seeded with defaults.
pub struct PromptLibrary {
    templates: BTreeMap<String, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(
            SHELL_SYSTEM_MESSAGE.to_string(),
            DEFAULT_SHELL_SYSTEM_MESSAGE.to_string(),
        );
        templates.insert(
            AUTOSUGGEST_NEW_COMMAND.to_string(),
            DEFAULT_AUTOSUGGEST_NEW_COMMAND.to_string(),
        );
        templates.insert(
            AUTOSUGGEST_COMMAND.to_string(),
            DEFAULT_AUTOSUGGEST_COMMAND.to_string(),
        );
        templates.insert(
            AUTOSUGGEST_PROMPT.to_string(),
            DEFAULT_AUTOSUGGEST_PROMPT.to_string(),
        );
        Self { templates }
    }
}

impl PromptLibrary {
    /// Replace or add a template.
    pub fn set(&mut self, name: &str, template: &str) {
        self.templates.insert(name.to_string(), template.to_string());
    }

    /// Resolve a template by name, substituting each `{arg}` placeholder.
    pub fn get(&self, name: &str, args: &[(&str, &str)]) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| anyhow!("no prompt template named {name}"))?;
        let mut resolved = template.clone();
        for (key, value) in args {
            resolved = resolved.replace(&format!("{{{key}}}"), value);
        }
        Ok(resolved)
    }
}
