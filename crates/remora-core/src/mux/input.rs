//! Parent-input dispatch
//!
//! Routes chunks of user input according to the current state. Each
//! dispatch consumes a prefix of the chunk and reports how much; the outer
//! loop re-dispatches the remainder until the chunk is spent, buffering a
//! trailing incomplete escape sequence for the next read.

use tracing::debug;

use super::{ShellMultiplexer, ShellState, CTRL_C};
use crate::ansi::{self, COMMAND_COLOR, PROMPT_COLOR};
use crate::buffer::LineBuffer;
use crate::history::BlockKind;

impl ShellMultiplexer {
    pub(crate) async fn handle_parent_input(&mut self, data: Vec<u8>) {
        let mut data = if self.parent_in_pending.is_empty() {
            data
        } else {
            let mut merged = std::mem::take(&mut self.parent_in_pending);
            merged.extend_from_slice(&data);
            merged
        };

        // a CSI split across reads is held for the next chunk
        if ansi::incomplete_csi(&data) {
            self.parent_in_pending = data;
            return;
        }

        loop {
            if data.is_empty() {
                return;
            }
            let consumed = self.input_from_parent(&data).await;
            if consumed == 0 {
                self.parent_in_pending = data;
                return;
            }
            if consumed >= data.len() {
                return;
            }
            data.drain(..consumed);
        }
    }

    /// Consume a prefix of the chunk according to the state machine and
    /// return its length.
    async fn input_from_parent(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        match self.state {
            ShellState::PromptResponse => {
                if data[0] == CTRL_C {
                    if let Some(cancel) = self.prompt_response_cancel.take() {
                        cancel.cancel();
                    }
                    return 1;
                }
                // everything else is discarded while a response streams
                data.len()
            }
            ShellState::Normal => self.input_normal(data).await,
            ShellState::Prompting => self.input_prompting(data).await,
            ShellState::Shell => self.input_shell(data),
        }
    }

    async fn input_normal(&mut self, data: &[u8]) -> usize {
        if (self.foreground_check)() {
            // the shell is running a foreground job (pager, editor, ...);
            // keep the wrapper out of the way entirely
            self.write_child(data);
            return data.len();
        }

        let (rune, rune_len) = leading_rune(data);

        if rune.is_uppercase() || rune == '!' {
            self.set_state(ShellState::Prompting);
            self.prompt.reset();
            self.prompt.write(&rune.to_string());
            self.write_parent(PROMPT_COLOR.as_bytes());
            self.write_parent(&data[..rune_len]);

            // anchor the prompt buffer at the real on-screen column
            let (_row, col) = self.cursor_position().await;
            let offset = col.saturating_sub(1).saturating_sub(self.prompt.len());
            self.prompt.set_prompt_offset(offset);
            self.prompt.set_term_width(self.term_width);
            return rune_len;
        }

        if data[0] == b'\t' {
            if !self.autosuggest.last.is_empty() {
                self.realize_autosuggest(true, COMMAND_COLOR);
                self.set_state(ShellState::Shell);
            } else {
                self.write_child(&data[..1]);
            }
            return 1;
        }

        if data[0] == b'\r' {
            self.write_child(&data[..1]);
            return 1;
        }

        let text = String::from_utf8_lossy(data).into_owned();
        let mut command = LineBuffer::new();
        command.set_term_width(self.term_width);
        command.write(&text);
        self.command = command;

        if !self.command.is_empty() {
            // a real command character, not a bare control sequence
            self.set_state(ShellState::Shell);
            self.history.new_block();
            self.refresh_autosuggest(&text);
        } else {
            self.clear_autosuggest(COMMAND_COLOR);
        }

        self.write_parent(COMMAND_COLOR.as_bytes());
        self.write_child(data);
        data.len()
    }

    async fn input_prompting(&mut self, data: &[u8]) -> usize {
        if let Some(index) = data.iter().position(|&b| b == b'\r') {
            self.clear_autosuggest(COMMAND_COLOR);

            let to_add = String::from_utf8_lossy(&data[..index]).into_owned();
            let to_print = self.prompt.write(&to_add);
            self.write_parent(&to_print);
            self.write_parent(b"\n\r");

            self.set_state(ShellState::PromptResponse);
            let prompt_str = self.prompt.to_string();
            if prompt_str.starts_with('!') {
                self.start_agent();
            } else if self.aquarium_mode {
                self.send_agent_followup();
            } else {
                self.send_prompt();
            }
            return index + 1;
        }

        if data[0] == b'\t' {
            if !self.autosuggest.last.is_empty() {
                // prompts are echoed by us, so the suggestion is realized
                // into the terminal only
                self.realize_autosuggest(false, PROMPT_COLOR);
            } else {
                self.write_parent(&data[..1]);
            }
            return 1;
        }

        if data[0] == CTRL_C {
            let erase = self.prompt.clear();
            self.write_parent(&erase);
            self.write_parent(COMMAND_COLOR.as_bytes());
            self.set_state(ShellState::Normal);
            return data.len();
        }

        let text = String::from_utf8_lossy(data).into_owned();
        let to_print = self.prompt.write(&text);
        self.write_parent(&to_print);
        self.refresh_autosuggest(&text);

        if self.prompt.is_empty() {
            self.write_parent(COMMAND_COLOR.as_bytes());
            self.set_state(ShellState::Normal);
        }
        data.len()
    }

    fn input_shell(&mut self, data: &[u8]) -> usize {
        if let Some(index) = data.iter().position(|&b| b == b'\r') {
            // command submitted
            self.clear_autosuggest(COMMAND_COLOR);
            self.set_state(ShellState::Normal);
            self.write_child(&data[..=index]);

            let command = self.command.to_string();
            self.history.append(BlockKind::ShellInput, &command);
            self.history.new_block();

            let mut fresh = LineBuffer::new();
            fresh.set_term_width(self.term_width);
            self.command = fresh;
            return index + 1;
        }

        if data[0] == b'\t' {
            if !self.autosuggest.last.is_empty() {
                self.realize_autosuggest(true, COMMAND_COLOR);
            } else {
                self.write_child(&data[..1]);
            }
            return 1;
        }

        let text = String::from_utf8_lossy(data).into_owned();
        self.command.write(&text);
        self.refresh_autosuggest(&text);
        self.write_child(data);

        if self.command.is_empty() {
            debug!("command buffer emptied");
            self.set_state(ShellState::Normal);
        }
        data.len()
    }
}

/// Decode the first rune of a chunk, falling back to the raw byte when the
/// chunk is not valid UTF-8.
fn leading_rune(data: &[u8]) -> (char, usize) {
    for len in 1..=data.len().min(4) {
        if let Ok(text) = std::str::from_utf8(&data[..len]) {
            if let Some(rune) = text.chars().next() {
                return (rune, len);
            }
        }
    }
    (data[0] as char, 1)
}
