//! ANSI escape-sequence helpers
//!
//! The multiplexer speaks a small CSI vocabulary to the terminal and has to
//! recognize an even smaller one coming back from it: cursor-position
//! reports, and escape sequences that arrive split across reads.

use once_cell::sync::Lazy;
use regex::Regex;

/// Color written before prompt text typed by the user.
pub const PROMPT_COLOR: &str = "\x1b[38;5;154m";
/// Reset used for ordinary shell commands.
pub const COMMAND_COLOR: &str = "\x1b[0m";
/// Muted color for inline suggestions.
pub const AUTOSUGGEST_COLOR: &str = "\x1b[38;5;241m";
/// Color for streamed model output and error messages.
pub const ANSWER_COLOR: &str = "\x1b[38;5;214m";

static ANSI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "[\u{1b}\u{9b}][\\[\\]()#;?]*(?:(?:(?:[a-zA-Z\\d]*(?:;[a-zA-Z\\d]*)*)?\u{7})|(?:(?:\\d{1,4}(?:;\\d{0,4})*)?[\\dA-PRZcf-ntqry=><~]))",
    )
    .unwrap()
});

/// Strip ANSI control sequences from a string.
pub fn strip_ansi(input: &str) -> String {
    ANSI_PATTERN.replace_all(input, "").into_owned()
}

/// Strip control sequences and non-printable characters, keeping newlines
/// and tabs. Used before terminal output is handed to the model.
pub fn sanitize_tty(input: &str) -> String {
    strip_ansi(input)
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect()
}

/// Longest escape sequence we are willing to treat as "still incomplete".
const MAX_PENDING_CSI: usize = 32;

/// True if the chunk ends in the middle of a CSI sequence. The caller should
/// hold the chunk and concatenate the next read before dispatching.
pub fn incomplete_csi(data: &[u8]) -> bool {
    let Some(esc) = data.iter().rposition(|&b| b == 0x1b) else {
        return false;
    };
    let tail = &data[esc..];
    if tail.len() > MAX_PENDING_CSI {
        return false;
    }
    if tail.len() == 1 {
        return true;
    }
    if tail[1] != b'[' {
        return false;
    }
    // CSI body: parameter bytes, then intermediate bytes, then a final byte.
    for &b in &tail[2..] {
        match b {
            0x30..=0x3f | 0x20..=0x2f => continue,
            0x40..=0x7e => return false,
            _ => return false,
        }
    }
    true
}

/// A cursor-position report parsed out of the parent input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPos {
    pub row: usize,
    pub col: usize,
}

enum ReportMatch {
    /// Full `ESC [ row ; col R` consumed.
    Complete { pos: CursorPos, len: usize },
    /// Bytes so far are a valid report prefix but the chunk ended.
    Partial,
    /// Not a cursor report.
    No,
}

/// Peels `ESC [ row ; col R` cursor reports out of parent input so they
/// never reach the state machine, buffering a report split across reads.
#[derive(Default)]
pub struct CursorReportScanner {
    pending: Vec<u8>,
}

impl CursorReportScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a chunk, returning the bytes to forward and any reports found.
    pub fn scan(&mut self, data: &[u8]) -> (Vec<u8>, Vec<CursorPos>) {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);

        let mut forwarded = Vec::with_capacity(buf.len());
        let mut reports = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            if buf[i] != 0x1b {
                forwarded.push(buf[i]);
                i += 1;
                continue;
            }
            match match_report(&buf[i..]) {
                ReportMatch::Complete { pos, len } => {
                    reports.push(pos);
                    i += len;
                }
                ReportMatch::Partial => {
                    self.pending = buf[i..].to_vec();
                    return (forwarded, reports);
                }
                ReportMatch::No => {
                    forwarded.push(buf[i]);
                    i += 1;
                }
            }
        }
        (forwarded, reports)
    }
}

fn match_report(data: &[u8]) -> ReportMatch {
    debug_assert_eq!(data[0], 0x1b);
    if data.len() > MAX_PENDING_CSI {
        // too long to still be a report prefix
        if report_at(data).is_none() {
            return ReportMatch::No;
        }
    }
    if data.len() == 1 {
        return ReportMatch::Partial;
    }
    if data[1] != b'[' {
        return ReportMatch::No;
    }
    match report_at(data) {
        Some((pos, len)) => ReportMatch::Complete { pos, len },
        None => {
            // decide between "could still complete" and "definitely not"
            let mut i = 2;
            let mut seen_semicolon = false;
            while i < data.len() {
                match data[i] {
                    b'0'..=b'9' => i += 1,
                    b';' if !seen_semicolon => {
                        seen_semicolon = true;
                        i += 1;
                    }
                    _ => return ReportMatch::No,
                }
            }
            if i >= MAX_PENDING_CSI {
                ReportMatch::No
            } else {
                ReportMatch::Partial
            }
        }
    }
}

/// Parse a complete report at the start of `data`, returning it and its length.
fn report_at(data: &[u8]) -> Option<(CursorPos, usize)> {
    if data.len() < 6 || data[0] != 0x1b || data[1] != b'[' {
        return None;
    }
    let mut i = 2;
    let row_start = i;
    while i < data.len() && data[i].is_ascii_digit() {
        i += 1;
    }
    if i == row_start || i >= data.len() || data[i] != b';' {
        return None;
    }
    let row: usize = std::str::from_utf8(&data[row_start..i]).ok()?.parse().ok()?;
    i += 1;
    let col_start = i;
    while i < data.len() && data[i].is_ascii_digit() {
        i += 1;
    }
    if i == col_start || i >= data.len() || data[i] != b'R' {
        return None;
    }
    let col: usize = std::str::from_utf8(&data[col_start..i]).ok()?.parse().ok()?;
    Some((CursorPos { row, col }, i + 1))
}
