//! Child-process accounting
//!
//! "Is the child shell running a foreground job?" is answered by walking
//! the process table transitively from our own PID. Exactly one descendant
//! (the shell) means the shell is idle; more means something like a pager
//! or editor is running and parent input should pass through untouched.

use std::collections::HashSet;

/// Count every transitive descendant of `root` in a `(pid, ppid)` table.
pub fn descendant_count(table: &[(u32, u32)], root: u32) -> usize {
    let mut pids: HashSet<u32> = HashSet::new();
    pids.insert(root);
    loop {
        let mut added = 0;
        for &(pid, ppid) in table {
            if pids.contains(&ppid) && pids.insert(pid) {
                added += 1;
            }
        }
        if added == 0 {
            break;
        }
    }
    pids.len() - 1
}

/// Snapshot the `(pid, ppid)` process table from /proc.
#[cfg(target_os = "linux")]
pub fn process_table() -> Vec<(u32, u32)> {
    let mut table = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return table;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // stat is `pid (comm) state ppid ...`; comm may itself contain
        // spaces and parens, so split after the last ')'
        let Some(close) = stat.rfind(')') else {
            continue;
        };
        let mut fields = stat[close + 1..].split_whitespace();
        let _state = fields.next();
        let Some(ppid) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
            continue;
        };
        table.push((pid, ppid));
    }
    table
}

/// True when the wrapper has more than one transitive descendant, i.e. the
/// child shell has spawned a foreground job of its own.
#[cfg(target_os = "linux")]
pub fn has_running_children() -> bool {
    descendant_count(&process_table(), std::process::id()) > 1
}

/// Without a process table the check degrades to "never", which keeps the
/// state machine engaged.
#[cfg(not(target_os = "linux"))]
pub fn has_running_children() -> bool {
    false
}
