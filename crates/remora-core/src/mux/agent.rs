//! Agent mode
//!
//! In agent mode the model pursues a goal by emitting `RUN:` directives
//! that the multiplexer executes in the child shell, feeding output and
//! exit codes back until the model declares the goal achieved or failed.

/// The model says it is done.
pub const GOAL_ACHIEVED: &str = "GOAL ACHIEVED";
/// The model says it cannot get there.
pub const GOAL_FAILED: &str = "GOAL FAILED";

/// Sentinel parked in the prompt-marker counter after a completion that
/// carried neither a directive nor a goal marker. Markers keep counting
/// from here, but the dispatch threshold is unreachable until the next
/// dispatched command resets the counter to zero.
pub(crate) const SUPPRESS_REPROMPT: i32 = -10000;

pub const AGENT_SYSTEM_MESSAGE: &str = "You are an agent working toward a goal in \
the user's unix shell. I will give you a goal, and you will give me unix commands \
to execute. A command must be on the final line of your response, preceded with \
'RUN: '. I will reply with the command's output and exit code. Keep giving me \
commands until the goal is reached, and verify that it has actually been reached. \
When it has, respond with simply GOAL ACHIEVED. If the goal cannot be reached, \
respond with simply GOAL FAILED.";

/// Extract the command from a final `RUN: <cmd>` line, if present.
pub fn parse_run_directive(output: &str) -> Option<&str> {
    let last_line = output.trim_end_matches(['\r', '\n']).lines().last()?;
    last_line
        .strip_prefix("RUN: ")
        .map(str::trim)
        .filter(|command| !command.is_empty())
}
