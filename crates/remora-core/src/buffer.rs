//! Editable line buffer
//!
//! Holds the line being typed (a prompt or a shell command) as a vector of
//! runes with a cursor. Every mutation returns the byte sequence that,
//! written to a terminal currently showing the previous buffer, leaves it
//! showing the new one — including wrapped lines and a cursor parked in the
//! middle of the text. The same machinery renders and erases the inline
//! autosuggestion.

use std::fmt;
use std::io::Write;

#[derive(Debug, Default)]
pub struct LineBuffer {
    chars: Vec<char>,
    cursor: usize,
    term_width: usize,
    prompt_offset: usize,
    color: String,

    // accounting for the most recently rendered suggestion
    last_suggest_len: usize,
    last_jump_forward: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_color(&mut self, color: &str) {
        self.color = color.to_string();
    }

    /// Column the first buffer character occupies, i.e. the width of the
    /// shell prompt to the left of the editable region.
    pub fn set_prompt_offset(&mut self, offset: usize) {
        self.prompt_offset = offset;
    }

    /// Terminal width used for wrap math. Zero means "don't wrap".
    pub fn set_term_width(&mut self, width: usize) {
        self.term_width = width;
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Drop the contents without producing terminal bytes. Used when the
    /// buffer is not currently displayed.
    pub fn reset(&mut self) {
        self.chars.clear();
        self.cursor = 0;
    }

    /// Erase the buffer from the screen and empty it.
    pub fn clear(&mut self) -> Vec<u8> {
        for c in self.chars.iter_mut() {
            *c = ' ';
        }
        let original_cursor = self.cursor;
        self.cursor = 0;
        let update = self.render(original_cursor);
        self.chars.clear();
        update
    }

    /// Apply input to the buffer and return the terminal update.
    ///
    /// Recognized input: backspace/DEL deletes left of the cursor, CSI C/D
    /// move the cursor, CSI A/B are ignored (they would corrupt the edited
    /// line), other control characters are dropped, anything else inserts
    /// at the cursor.
    pub fn write(&mut self, data: &str) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        let starting_cursor = self.cursor;
        let runes: Vec<char> = data.chars().collect();

        let mut i = 0;
        while i < runes.len() {
            if runes[i] == '\x1b' && i + 2 < runes.len() && runes[i + 1] == '[' {
                match runes[i + 2] {
                    'A' | 'B' => {
                        tracing::debug!("ignoring up/down arrow in line buffer");
                        i += 3;
                        continue;
                    }
                    'C' => {
                        if self.cursor < self.chars.len() {
                            self.cursor += 1;
                        }
                        i += 3;
                        continue;
                    }
                    'D' => {
                        if self.cursor > 0 {
                            self.cursor -= 1;
                        }
                        i += 3;
                        continue;
                    }
                    _ => {}
                }
            }

            let r = runes[i];
            i += 1;

            match r {
                '\u{8}' | '\u{7f}' => {
                    if self.cursor > 0 && !self.chars.is_empty() {
                        self.chars.remove(self.cursor - 1);
                        self.cursor -= 1;
                    }
                }
                c if c.is_control() => {}
                c => {
                    self.chars.insert(self.cursor, c);
                    self.cursor += 1;
                }
            }
        }

        self.render(starting_cursor)
    }

    /// Produce the bytes that repaint the buffer on a terminal whose cursor
    /// currently sits at `starting_cursor` within the old rendering.
    fn render(&self, starting_cursor: usize) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let len = self.chars.len();
        let text: String = self.chars.iter().collect();

        if self.term_width == 0 {
            // degenerate form: no wrap accounting at all
            if starting_cursor > 0 {
                let _ = write!(out, "\x1b[{}D", starting_cursor);
            }
            out.extend_from_slice(text.as_bytes());
            let back = len - self.cursor;
            if back > 0 {
                let _ = write!(out, "\x1b[{}D", back);
            }
            return out;
        }

        let w = self.term_width;
        let new_num_lines = (len.max(self.cursor + 1) + self.prompt_offset) / w;
        let old_cursor_line = (starting_cursor + self.prompt_offset) / w;
        let new_cursor_line = (self.cursor + self.prompt_offset) / w;
        let new_column = (self.cursor + self.prompt_offset) % w;
        let pos_after_writing = (len + self.prompt_offset) % w;

        // back to the leftmost column of the first row the buffer occupies
        out.push(b'\r');
        if old_cursor_line > 0 {
            // clear out the final old line before moving up
            out.extend_from_slice(b"\x1b[0K");
            let _ = write!(out, "\x1b[{}A", old_cursor_line);
        }
        // skip over the shell prompt
        if self.prompt_offset > 0 {
            let _ = write!(out, "\x1b[{}C", self.prompt_offset);
        }

        if !self.color.is_empty() {
            out.extend_from_slice(self.color.as_bytes());
        }

        out.extend_from_slice(text.as_bytes());

        if pos_after_writing == 0 && len > 0 {
            // terminals differ on whether writing the last column advances
            // the row, force the cursor onto a fresh line
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\x1b[0K");

        // the full buffer was rewritten, reposition if the cursor is inside it
        if self.cursor < len {
            out.push(b'\r');
            let up = new_num_lines - new_cursor_line;
            if up > 0 {
                let _ = write!(out, "\x1b[{}A", up);
            }
            if new_column > 0 {
                let _ = write!(out, "\x1b[{}C", new_column);
            }
        }

        out
    }

    /// Render a suggestion after the typed text, then park the cursor back
    /// where it was. `jump_forward` is the number of already-typed
    /// characters between the cursor and the end of the buffer; the
    /// suggestion is drawn after them. `prompt_offset` here is the cursor's
    /// starting column.
    pub fn write_autosuggest(&mut self, text: &str, jump_forward: usize, color: &str) -> Vec<u8> {
        let suggest_len = text.chars().count();
        self.last_suggest_len = suggest_len;
        self.last_jump_forward = jump_forward;

        // a suggestion that would begin on the next line is not drawn
        if self.term_width == 0 || self.prompt_offset + jump_forward >= self.term_width {
            return Vec::new();
        }

        let num_lines = (suggest_len + jump_forward + self.prompt_offset) / self.term_width;
        let mut out: Vec<u8> = Vec::new();

        if jump_forward > 0 {
            let _ = write!(out, "\x1b[{}C", jump_forward);
        }
        if !color.is_empty() {
            out.extend_from_slice(color.as_bytes());
        } else if !self.color.is_empty() {
            out.extend_from_slice(self.color.as_bytes());
        }
        out.extend_from_slice(text.as_bytes());

        // return the cursor to where it started
        out.push(b'\r');
        if num_lines > 0 {
            let _ = write!(out, "\x1b[{}A", num_lines);
        }
        if self.prompt_offset > 0 {
            let _ = write!(out, "\x1b[{}C", self.prompt_offset);
        }

        out
    }

    /// Overwrite the previously rendered suggestion with spaces.
    pub fn clear_last_suggestion(&mut self, color: &str) -> Vec<u8> {
        let blanks = " ".repeat(self.last_suggest_len);
        self.write_autosuggest(&blanks, self.last_jump_forward, color)
    }

    /// The user typed `n` characters of the rendered suggestion; shrink the
    /// erase accounting instead of redrawing. Only valid when the cursor
    /// was at the end of the buffer when the suggestion was drawn.
    pub fn eat_runes(&mut self, n: usize) {
        debug_assert_eq!(self.last_jump_forward, 0, "jump forward should be 0");
        self.last_suggest_len = self.last_suggest_len.saturating_sub(n);
        self.prompt_offset += n;
    }
}

impl fmt::Display for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.chars {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}
