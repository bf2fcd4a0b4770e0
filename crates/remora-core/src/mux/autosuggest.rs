//! Autosuggest coordination
//!
//! Debounced, cancellable completion requests issued as the user types,
//! reconciled against the buffer when the result comes back: stale or
//! malformed results are dropped, a live suggestion the user is typing out
//! is contracted in place, and Tab realizes the suggestion into the real
//! input stream.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ShellMultiplexer, ShellState, AUTOSUGGEST_MAX_TOKENS};
use crate::ansi::{AUTOSUGGEST_COLOR, COMMAND_COLOR};
use crate::buffer::LineBuffer;
use crate::history::blocks_to_string;
use crate::llm::{CompletionRequest, QUOTA_HELP};
use crate::prompts;

/// A completion delivered by a background suggestion task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosuggestResult {
    /// The buffer contents the request was issued for.
    pub command: String,
    pub suggestion: String,
}

pub(crate) struct AutosuggestState {
    pub enabled: bool,
    pub debounce: Duration,
    pub history_window: usize,
    /// Tail of the suggestion currently rendered past the typed text.
    pub last: String,
    pub cancel: Option<CancellationToken>,
    /// Buffer holding the render accounting for the drawn suggestion.
    pub buffer: Option<LineBuffer>,
}

/// Trim whitespace and wrapping straight quotes off a raw model reply.
pub(crate) fn clean_suggestion(output: &str) -> String {
    let trimmed = output.trim();
    let trimmed = if trimmed.len() > 1 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    trimmed.trim().to_string()
}

impl ShellMultiplexer {
    /// Called after every state-changing keystroke with the bytes typed.
    pub(crate) fn refresh_autosuggest(&mut self, typed: &str) {
        let (len, cursor) = {
            let buffer = self.active_suggest_buffer();
            (buffer.len(), buffer.cursor())
        };

        // the user is typing out the live suggestion at the end of the
        // buffer: contract it instead of round-tripping a new request
        if len > 0
            && len == cursor
            && !typed.is_empty()
            && self.autosuggest.last.starts_with(typed)
        {
            self.autosuggest.last.drain(..typed.len());
            self.write_parent(COMMAND_COLOR.as_bytes());
            if let Some(buffer) = &mut self.autosuggest.buffer {
                buffer.eat_runes(typed.chars().count());
            }
            return;
        }

        self.clear_autosuggest(COMMAND_COLOR);
        if matches!(self.state, ShellState::Shell | ShellState::Prompting) {
            let text = self.active_suggest_buffer().to_string();
            self.request_autosuggest(self.autosuggest.debounce, &text);
        }
    }

    fn active_suggest_buffer(&self) -> &LineBuffer {
        match self.state {
            ShellState::Prompting => &self.prompt,
            _ => &self.command,
        }
    }

    /// Erase the rendered suggestion, if any.
    pub(crate) fn clear_autosuggest(&mut self, color: &str) {
        if self.autosuggest.last.is_empty() {
            return;
        }
        self.autosuggest.last.clear();
        if let Some(mut buffer) = self.autosuggest.buffer.take() {
            let erase = buffer.clear_last_suggestion(color);
            self.write_parent(&erase);
        }
    }

    /// Cancel any in-flight request and spawn a new one after the debounce
    /// delay.
    pub(crate) fn request_autosuggest(&mut self, delay: Duration, command: &str) {
        if !self.autosuggest.enabled {
            return;
        }

        if let Some(cancel) = self.autosuggest.cancel.take() {
            cancel.cancel();
        }
        let token = self.cancel.child_token();
        self.autosuggest.cancel = Some(token.clone());

        // whitespace-only input never produces a useful suggestion
        if !command.is_empty() && command.trim().is_empty() {
            return;
        }

        let history_text = blocks_to_string(
            &self
                .history
                .last_n_bytes(self.autosuggest.history_window, 2048),
        );
        let template = if command.is_empty() {
            prompts::AUTOSUGGEST_NEW_COMMAND
        } else if command.chars().next().is_some_and(|c| c.is_uppercase()) {
            prompts::AUTOSUGGEST_PROMPT
        } else {
            prompts::AUTOSUGGEST_COMMAND
        };
        let llm_prompt = match self
            .prompts
            .get(template, &[("history", &history_text), ("command", command)])
        {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(error = %err, "autosuggest template lookup failed");
                return;
            }
        };

        let client = Arc::clone(&self.llm);
        let tx = self.autosuggest_tx.clone();
        let model = self.config.provider.autosuggest_model.clone();
        let command = command.to_string();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if token.is_cancelled() {
                return;
            }

            let request = CompletionRequest {
                cancel: token.clone(),
                prompt: llm_prompt,
                model,
                max_tokens: AUTOSUGGEST_MAX_TOKENS,
                temperature: 0.7,
                history: Vec::new(),
                system_message: None,
            };

            match client.completion(request).await {
                Ok(output) => {
                    let suggestion = clean_suggestion(&output);
                    let _ = tx.send(AutosuggestResult { command, suggestion }).await;
                }
                Err(err) if err.is_canceled() => {}
                Err(err) => {
                    warn!(error = %err, "autosuggest request failed");
                    if err.is_quota() {
                        warn!("{}", QUOTA_HELP);
                    }
                }
            }
        });
    }

    /// A result arrived: validate it against the current buffer and render
    /// the tail past the typed text, anchored at the real cursor column.
    pub(crate) async fn handle_autosuggest_result(&mut self, result: AutosuggestResult) {
        let buffer_text = match self.state {
            ShellState::Prompting => self.prompt.to_string(),
            ShellState::Shell | ShellState::Normal => self.command.to_string(),
            ShellState::PromptResponse => {
                debug!("dropping autosuggest result during prompt response");
                return;
            }
        };

        if result.suggestion.is_empty() {
            return;
        }
        if result.command != buffer_text {
            debug!(
                expected = %buffer_text,
                got = %result.command,
                "stale autosuggest result"
            );
            return;
        }
        if result.suggestion.contains('\n') {
            return;
        }
        if result.suggestion == self.autosuggest.last {
            return;
        }
        if result.suggestion == buffer_text {
            return;
        }
        if !result.command.is_empty()
            && !result
                .suggestion
                .to_lowercase()
                .starts_with(&result.command.to_lowercase())
        {
            debug!("autosuggest result does not extend the typed text");
            return;
        }
        if !result.suggestion.is_char_boundary(buffer_text.len()) {
            return;
        }

        let tail = result.suggestion[buffer_text.len()..].to_string();
        let (buffer_len, buffer_cursor) = {
            let buffer = self.active_suggest_buffer();
            (buffer.len(), buffer.cursor())
        };
        let jump_forward = buffer_len - buffer_cursor;

        let (_row, col) = self.cursor_position().await;

        let mut suggest_buffer = LineBuffer::new();
        suggest_buffer.set_prompt_offset(col.saturating_sub(1));
        suggest_buffer.set_term_width(self.term_width);
        let bytes = suggest_buffer.write_autosuggest(&tail, jump_forward, AUTOSUGGEST_COLOR);
        self.write_parent(&bytes);

        self.autosuggest.last = tail;
        self.autosuggest.buffer = Some(suggest_buffer);
    }

    /// Tab: commit the suggestion into the real input stream — the child
    /// PTY for commands, the terminal for prompts.
    pub(crate) fn realize_autosuggest(&mut self, to_child: bool, color: &str) {
        let suggestion = std::mem::take(&mut self.autosuggest.last);
        debug!(suggestion = %suggestion, "realizing autosuggest");
        self.autosuggest.buffer = None;

        let payload = {
            let buffer = if to_child {
                &mut self.command
            } else {
                &mut self.prompt
            };
            let jump = buffer.len() - buffer.cursor();
            let mut payload = Vec::new();
            // move past the tail of the typed text first so the suggestion
            // appends after the full command
            for _ in 0..jump {
                payload.extend_from_slice(b"\x1b[C");
                buffer.write("\x1b[C");
            }
            payload.extend_from_slice(suggestion.as_bytes());
            buffer.write(&suggestion);
            payload
        };

        self.write_parent(color.as_bytes());
        if to_child {
            self.write_child(&payload);
        } else {
            self.write_parent(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_suggestion_strips_quotes_and_space() {
        assert_eq!(clean_suggestion("  ls -la \n"), "ls -la");
        assert_eq!(clean_suggestion("\"git status\""), "git status");
        assert_eq!(clean_suggestion(" \" spaced \" "), "spaced");
        assert_eq!(clean_suggestion("\""), "\"");
    }
}
