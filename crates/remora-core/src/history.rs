//! Session history
//!
//! An in-memory record of the conversation between the user, the child
//! shell, and the model: typed blocks that coalesce with the previous block
//! when the kind matches, and a byte-budgeted tail readback used to build
//! model context windows.

use crate::ansi::sanitize_tty;

/// What a history block contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A natural-language prompt the user typed.
    Prompt,
    /// A command sent to the child shell.
    ShellInput,
    /// Output the child shell printed.
    ShellOutput,
    /// A model response.
    LlmOutput,
}

impl BlockKind {
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::Prompt => "prompt",
            BlockKind::ShellInput => "shell input",
            BlockKind::ShellOutput => "shell output",
            BlockKind::LlmOutput => "model output",
        }
    }
}

/// A sanitized, truncated block as handed to the model.
#[derive(Debug, Clone)]
pub struct HistoryBlock {
    pub kind: BlockKind,
    pub content: String,
}

/// Append-only ordered sequence of typed blocks.
#[derive(Debug, Default)]
pub struct ShellHistory {
    blocks: Vec<(BlockKind, String)>,
}

impl ShellHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new block regardless of the trailing block's kind.
    pub fn add(&mut self, kind: BlockKind, content: &str) {
        self.blocks.push((kind, content.to_string()));
    }

    /// Append to the trailing block when the kind matches, otherwise start
    /// a new block.
    pub fn append(&mut self, kind: BlockKind, content: &str) {
        if let Some((last_kind, last_content)) = self.blocks.last_mut() {
            if *last_kind == kind {
                last_content.push_str(content);
                return;
            }
        }
        self.add(kind, content);
    }

    /// Force a block boundary without changing the kind, so the next append
    /// of the same kind starts fresh.
    pub fn new_block(&mut self) {
        if let Some(&(kind, _)) = self.blocks.last() {
            self.add(kind, "");
        }
    }

    /// Walk back from the tail collecting blocks until the byte budget is
    /// spent. Each block is sanitized and individually capped at
    /// `truncate_len` bytes (on a char boundary); a block that would exceed
    /// the remaining budget ends the walk so no block is ever split.
    pub fn last_n_bytes(&self, num_bytes: usize, truncate_len: usize) -> Vec<HistoryBlock> {
        let mut collected = Vec::new();
        let mut remaining = num_bytes;

        for &(kind, ref raw) in self.blocks.iter().rev() {
            if remaining == 0 {
                break;
            }
            let mut content = sanitize_tty(raw);
            if content.len() > truncate_len {
                let mut cut = truncate_len;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
            if content.len() > remaining {
                break;
            }
            remaining -= content.len();
            collected.push(HistoryBlock { kind, content });
        }

        collected.reverse();
        collected
    }
}

/// Flatten blocks into the plain-text form used by autosuggest templates.
pub fn blocks_to_string(blocks: &[HistoryBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_coalesces_matching_kind() {
        let mut h = ShellHistory::new();
        h.add(BlockKind::ShellOutput, "a");
        h.append(BlockKind::ShellOutput, "b");
        let blocks = h.last_n_bytes(100, 512);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "ab");
    }

    #[test]
    fn test_append_different_kind_starts_new_block() {
        let mut h = ShellHistory::new();
        h.add(BlockKind::ShellInput, "a");
        h.append(BlockKind::ShellOutput, "b");
        let blocks = h.last_n_bytes(100, 512);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, BlockKind::ShellInput);
        assert_eq!(blocks[1].kind, BlockKind::ShellOutput);
    }

    #[test]
    fn test_new_block_forces_boundary() {
        let mut h = ShellHistory::new();
        h.append(BlockKind::ShellInput, "ls");
        h.new_block();
        h.append(BlockKind::ShellInput, "pwd");
        let blocks = h.last_n_bytes(100, 512);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].content, "ls");
        assert_eq!(blocks[2].content, "pwd");
    }

    #[test]
    fn test_budget_drops_whole_blocks_and_keeps_order() {
        let mut h = ShellHistory::new();
        h.add(BlockKind::ShellInput, "first");
        h.add(BlockKind::ShellOutput, "second");
        h.add(BlockKind::ShellInput, "third");
        // budget fits "third" (5) and "second" (6) but not "first"
        let blocks = h.last_n_bytes(12, 512);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].content, "second");
        assert_eq!(blocks[1].content, "third");
    }

    #[test]
    fn test_block_longer_than_cap_is_truncated() {
        let mut h = ShellHistory::new();
        h.add(BlockKind::ShellOutput, &"x".repeat(600));
        let blocks = h.last_n_bytes(10_000, 512);
        assert_eq!(blocks[0].content.len(), 512);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let mut h = ShellHistory::new();
        // 3-byte runes, cap lands mid-rune
        h.add(BlockKind::ShellOutput, &"あ".repeat(300));
        let blocks = h.last_n_bytes(10_000, 512);
        assert!(blocks[0].content.len() <= 512);
        assert!(std::str::from_utf8(blocks[0].content.as_bytes()).is_ok());
    }

    #[test]
    fn test_readback_sanitizes_tty_noise() {
        let mut h = ShellHistory::new();
        h.add(BlockKind::ShellOutput, "a\x1b[38;5;154mb\r\nc");
        let blocks = h.last_n_bytes(100, 512);
        assert_eq!(blocks[0].content, "ab\nc");
    }

    #[test]
    fn test_blocks_to_string_joins_with_newline() {
        let blocks = vec![
            HistoryBlock {
                kind: BlockKind::ShellInput,
                content: "ls".into(),
            },
            HistoryBlock {
                kind: BlockKind::ShellOutput,
                content: "a.txt".into(),
            },
        ];
        assert_eq!(blocks_to_string(&blocks), "ls\na.txt");
    }
}
