//! Prompt-marker injection and parsing
//!
//! The child shell's PS1 is rewritten to wrap the prompt in sentinel
//! markers plus the last exit status, so prompt boundaries and exit codes
//! can be recovered from the raw output stream. The markers are wrapped in
//! \001/\002 so the shell treats them as non-printing and its own cursor
//! math stays correct.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Marker emitted at the start of the child's prompt: `\001 ESC Q \002`.
pub const PROMPT_PREFIX: &str = "\u{1}\u{1b}Q\u{2}";
/// Marker emitted at the end of the child's prompt: `\001 ESC R \002`.
pub const PROMPT_SUFFIX: &str = "\u{1}\u{1b}R\u{2}";

// The forms that survive shell quoting; expanded by echo inside the PS1
// assignment so the raw control bytes end up in the prompt.
const PROMPT_PREFIX_ESCAPED: &str = "\\001\\033Q\\002";
const PROMPT_SUFFIX_ESCAPED: &str = "\\001\\033R\\002";

static SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(" ([0-9]+)\x01\x1bR\x02").unwrap());

/// Shell dialects whose exit-status expansion we know how to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    /// bash, sh, dash: `$?`
    Posix,
    /// zsh: `%?`
    Zsh,
}

impl ShellDialect {
    /// Detect the dialect from the shell binary path. `None` means the
    /// dialect is unknown and no injection should be attempted.
    pub fn detect(shell_binary: &str) -> Option<Self> {
        let name = Path::new(shell_binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match name.as_str() {
            "zsh" => Some(ShellDialect::Zsh),
            "bash" | "sh" | "dash" | "ksh" => Some(ShellDialect::Posix),
            _ => None,
        }
    }

    fn exit_code_expansion(&self) -> &'static str {
        match self {
            ShellDialect::Posix => "$?",
            ShellDialect::Zsh => "%?",
        }
    }
}

/// The assignment statement written to the child shell at startup. It
/// redefines PS1 as `PREFIX $PS1 <marker> <exit-code> SUFFIX`; the echos
/// make the escaped control characters print correctly.
pub fn injection_statement(dialect: ShellDialect, command_prompt: &str) -> String {
    format!(
        "PS1=\"$(echo '{}')$PS1{} {}$(echo '{}')\"\n",
        PROMPT_PREFIX_ESCAPED,
        command_prompt,
        dialect.exit_code_expansion(),
        PROMPT_SUFFIX_ESCAPED,
    )
}

/// Result of scanning a chunk of child output for prompt markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ps1Scan {
    /// Exit status captured by the last marker in the chunk, 0 if none.
    pub last_status: i32,
    /// Number of prompt boundaries seen in the chunk.
    pub prompt_count: usize,
    /// The chunk with every marker removed.
    pub cleaned: String,
}

/// Scan child output for ` <status>SUFFIX` markers and free-standing
/// prefixes, stripping both from the stream.
pub fn parse(data: &str) -> Ps1Scan {
    let mut last_status = 0;
    let mut prompt_count = 0;
    for caps in SUFFIX_RE.captures_iter(data) {
        last_status = caps[1].parse().unwrap_or(0);
        prompt_count += 1;
    }
    let cleaned = SUFFIX_RE.replace_all(data, " ");
    let cleaned = cleaned.replace(PROMPT_PREFIX, "");
    Ps1Scan {
        last_status,
        prompt_count,
        cleaned,
    }
}
