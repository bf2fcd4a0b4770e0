//! Shell multiplexer
//!
//! The single actor that owns the session: it sits between the user's
//! terminal and the child shell on a PTY, watches both byte streams, and
//! drives the state machine that decides whether a keystroke belongs to the
//! shell, to a prompt being composed, or to nothing at all while a model
//! response streams.
//!
//! All mutable state lives here and is touched only from `run`'s select
//! loop; reader tasks and LLM tasks communicate back through channels.

mod agent;
mod autosuggest;
mod input;

pub use agent::{parse_run_directive, AGENT_SYSTEM_MESSAGE, GOAL_ACHIEVED, GOAL_FAILED};
pub use autosuggest::AutosuggestResult;

use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ansi::{self, CursorPos, CursorReportScanner, ANSWER_COLOR};
use crate::buffer::LineBuffer;
use crate::config::Config;
use crate::history::{BlockKind, ShellHistory};
use crate::llm::{CompletionRequest, LlmClient, TokenCallback, QUOTA_HELP};
use crate::procs;
use crate::prompts::{self, PromptLibrary};
use crate::ps1;

use autosuggest::AutosuggestState;

pub(crate) const CTRL_C: u8 = 0x03;
pub(crate) const PROMPT_MAX_TOKENS: u32 = 512;
pub(crate) const AGENT_MAX_TOKENS: u32 = 2048;
pub(crate) const AUTOSUGGEST_MAX_TOKENS: u32 = 256;
/// Prompt markers required before an agent command is considered finished:
/// one from the echoed command line, one from the fresh prompt after it.
pub(crate) const AGENT_DISPATCH_PROMPTS: i32 = 2;
const CURSOR_REPLY_TIMEOUT: Duration = Duration::from_millis(100);

/// Writer shared between the multiplexer and short-lived LLM tasks.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn shared_writer<W: Write + Send + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Where a byte of parent input is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// Pass-through; watching for the first byte of something interesting.
    Normal,
    /// The user is typing a shell command.
    Shell,
    /// The user is composing a prompt for the model.
    Prompting,
    /// A model response is streaming to the terminal.
    PromptResponse,
}

impl fmt::Display for ShellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShellState::Normal => "Normal",
            ShellState::Shell => "Shell",
            ShellState::Prompting => "Prompting",
            ShellState::PromptResponse => "PromptResponse",
        };
        write!(f, "{name}")
    }
}

/// Terminal writer used by model tasks: answer color, raw-mode newlines,
/// flushed per token so streaming is visible immediately.
#[derive(Clone)]
pub struct AnswerWriter {
    out: SharedWriter,
    color: String,
}

impl AnswerWriter {
    pub fn new(out: SharedWriter, color: &str) -> Self {
        Self {
            out,
            color: color.to_string(),
        }
    }

    pub fn write_text(&self, text: &str) {
        let text = text.replace('\n', "\r\n");
        if let Ok(mut writer) = self.out.lock() {
            let _ = writer.write_all(self.color.as_bytes());
            let _ = writer.write_all(text.as_bytes());
            let _ = writer.flush();
        }
    }
}

pub struct MultiplexerOptions {
    pub config: Config,
    pub llm: Arc<dyn LlmClient>,
    pub prompts: Arc<PromptLibrary>,
    pub cancel: CancellationToken,
    pub child_in: SharedWriter,
    pub parent_out: SharedWriter,
    pub child_out_rx: mpsc::Receiver<Vec<u8>>,
    pub parent_in_rx: mpsc::Receiver<Vec<u8>>,
    pub cursor_rx: mpsc::Receiver<CursorPos>,
    pub resize_rx: mpsc::Receiver<usize>,
    pub term_width: usize,
}

pub struct ShellMultiplexer {
    state: ShellState,
    config: Config,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    cancel: CancellationToken,

    child_in: SharedWriter,
    parent_out: SharedWriter,
    answer: AnswerWriter,

    child_out_rx: mpsc::Receiver<Vec<u8>>,
    parent_in_rx: mpsc::Receiver<Vec<u8>>,
    cursor_rx: mpsc::Receiver<CursorPos>,
    resize_rx: mpsc::Receiver<usize>,
    prompt_output_tx: mpsc::Sender<String>,
    prompt_output_rx: mpsc::Receiver<String>,
    autosuggest_tx: mpsc::Sender<AutosuggestResult>,
    autosuggest_rx: mpsc::Receiver<AutosuggestResult>,

    history: ShellHistory,
    prompt: LineBuffer,
    command: LineBuffer,
    term_width: usize,

    aquarium_mode: bool,
    aquarium_buffer: String,
    prompt_suffix_counter: i32,
    prompt_response_cancel: Option<CancellationToken>,
    autosuggest: AutosuggestState,

    parent_in_pending: Vec<u8>,
    child_out_buffer: Vec<u8>,

    foreground_check: Box<dyn Fn() -> bool + Send>,
}

enum Event {
    Shutdown,
    Resize(usize),
    Suggest(AutosuggestResult),
    PromptOutput(String),
    ChildOut(Option<Vec<u8>>),
    ParentIn(Option<Vec<u8>>),
}

impl ShellMultiplexer {
    pub fn new(options: MultiplexerOptions) -> Self {
        let (prompt_output_tx, prompt_output_rx) = mpsc::channel(4);
        let (autosuggest_tx, autosuggest_rx) = mpsc::channel(4);

        let mut prompt = LineBuffer::new();
        prompt.set_term_width(options.term_width);
        prompt.set_color(ansi::PROMPT_COLOR);
        let mut command = LineBuffer::new();
        command.set_term_width(options.term_width);

        let answer = AnswerWriter::new(options.parent_out.clone(), ANSWER_COLOR);
        let autosuggest = AutosuggestState {
            enabled: options.config.autosuggest.enabled,
            debounce: Duration::from_millis(options.config.autosuggest.debounce_ms),
            history_window: options.config.autosuggest.history_window,
            last: String::new(),
            cancel: None,
            buffer: None,
        };

        Self {
            state: ShellState::Normal,
            config: options.config,
            llm: options.llm,
            prompts: options.prompts,
            cancel: options.cancel,
            child_in: options.child_in,
            parent_out: options.parent_out,
            answer,
            child_out_rx: options.child_out_rx,
            parent_in_rx: options.parent_in_rx,
            cursor_rx: options.cursor_rx,
            resize_rx: options.resize_rx,
            prompt_output_tx,
            prompt_output_rx,
            autosuggest_tx,
            autosuggest_rx,
            history: ShellHistory::new(),
            prompt,
            command,
            term_width: options.term_width,
            aquarium_mode: false,
            aquarium_buffer: String::new(),
            prompt_suffix_counter: 0,
            prompt_response_cancel: None,
            autosuggest,
            parent_in_pending: Vec::new(),
            child_out_buffer: Vec::new(),
            foreground_check: Box::new(procs::has_running_children),
        }
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    /// Run until the root cancellation fires or either stream closes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!("shell multiplexer started");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Shutdown,
                Some(width) = self.resize_rx.recv() => Event::Resize(width),
                Some(result) = self.autosuggest_rx.recv() => Event::Suggest(result),
                Some(output) = self.prompt_output_rx.recv() => Event::PromptOutput(output),
                chunk = self.child_out_rx.recv() => Event::ChildOut(chunk),
                chunk = self.parent_in_rx.recv() => Event::ParentIn(chunk),
            };

            match event {
                Event::Shutdown => {
                    info!("shell multiplexer shutting down");
                    return Ok(());
                }
                Event::Resize(width) => self.handle_resize(width),
                Event::Suggest(result) => self.handle_autosuggest_result(result).await,
                Event::PromptOutput(output) => self.handle_prompt_output(&output),
                Event::ChildOut(Some(data)) => self.handle_child_output(&data),
                Event::ChildOut(None) => {
                    info!("child output stream closed");
                    self.cancel.cancel();
                    return Ok(());
                }
                Event::ParentIn(Some(data)) => self.handle_parent_input(data).await,
                Event::ParentIn(None) => {
                    info!("parent input stream closed");
                    self.cancel.cancel();
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: ShellState) {
        if state != self.state {
            debug!(from = %self.state, to = %state, "state change");
        }
        self.state = state;
    }

    pub(crate) fn write_parent(&self, bytes: &[u8]) {
        if let Ok(mut writer) = self.parent_out.lock() {
            let _ = writer.write_all(bytes);
            let _ = writer.flush();
        }
    }

    pub(crate) fn write_child(&self, bytes: &[u8]) {
        if let Ok(mut writer) = self.child_in.lock() {
            let _ = writer.write_all(bytes);
            let _ = writer.flush();
        }
    }

    fn handle_resize(&mut self, width: usize) {
        debug!(width, "terminal resized");
        self.term_width = width;
        self.prompt.set_term_width(width);
        self.command.set_term_width(width);
        if let Some(buffer) = &mut self.autosuggest.buffer {
            buffer.set_term_width(width);
        }
    }

    /// Ask the terminal where the cursor is and wait for the reply peeled
    /// off the parent input stream. Stale replies are drained so the most
    /// recent one wins.
    pub(crate) async fn cursor_position(&mut self) -> (usize, usize) {
        self.write_parent(b"\x1b[6n");
        let mut pos = match tokio::time::timeout(CURSOR_REPLY_TIMEOUT, self.cursor_rx.recv()).await
        {
            Ok(Some(pos)) => pos,
            _ => panic!(
                "no reply to a cursor position query within {}ms; \
                 this terminal emulator does not answer CSI 6n, which remora requires. \
                 Try a different terminal emulator.",
                CURSOR_REPLY_TIMEOUT.as_millis()
            ),
        };
        while let Ok(newer) = self.cursor_rx.try_recv() {
            pos = newer;
        }
        (pos.row, pos.col)
    }

    /// Child output: strip prompt markers, account for them, then either
    /// buffer (while a response is streaming) or pass through.
    pub(crate) fn handle_child_output(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let scan = ps1::parse(&text);
        self.prompt_suffix_counter += scan.prompt_count as i32;

        if self.state == ShellState::PromptResponse {
            // held until the response finishes, then released atomically
            self.child_out_buffer.extend_from_slice(scan.cleaned.as_bytes());
            return;
        }

        if self.aquarium_mode {
            self.aquarium_buffer.push_str(&scan.cleaned);
        }

        // output while the user is mid-command is tab completion or paging,
        // not something the model should see
        if self.state != ShellState::Shell {
            self.history.append(BlockKind::ShellOutput, &scan.cleaned);
        }
        self.write_parent(scan.cleaned.as_bytes());

        if self.aquarium_mode && self.prompt_suffix_counter >= AGENT_DISPATCH_PROMPTS {
            self.write_parent(b"\r\x1b[K");
            let output = std::mem::take(&mut self.aquarium_buffer);
            self.respond_agent(scan.last_status, &output);
            self.prompt_suffix_counter = 0;
        }
    }

    /// A completion (or canned reply) finished: record it, release buffered
    /// child output, and either continue the agent loop or return to Normal.
    pub(crate) fn handle_prompt_output(&mut self, output: &str) {
        self.history.add(BlockKind::LlmOutput, output);

        if !self.child_out_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.child_out_buffer);
            self.write_parent(&buffered);
            self.history
                .append(BlockKind::ShellOutput, &String::from_utf8_lossy(&buffered));
        }

        if self.aquarium_mode {
            if output.contains(GOAL_ACHIEVED) || output.contains(GOAL_FAILED) {
                info!("agent goal finished, leaving agent mode");
                self.aquarium_mode = false;
                self.set_state(ShellState::Normal);
                self.write_child(b"\n");
                return;
            }

            if let Some(command) = parse_run_directive(output) {
                info!(command = %command, "agent dispatching command");
                self.aquarium_buffer.clear();
                self.prompt_suffix_counter = 0;
                self.set_state(ShellState::Normal);
                self.write_child(b"\n");
                self.write_child(command.as_bytes());
                self.write_child(b"\n");
                return;
            }

            // neither a goal marker nor a directive: park the counter far
            // below the dispatch threshold so stray prompts cannot
            // re-trigger the agent until the next dispatch resets it
            self.prompt_suffix_counter = agent::SUPPRESS_REPROMPT;
        }

        self.write_child(b"\n");
        self.request_autosuggest(Duration::ZERO, "");
        self.set_state(ShellState::Normal);
    }

    /// Dispatch the finished prompt: canned replies for the local commands,
    /// otherwise a streaming completion with the shell system message.
    pub(crate) fn send_prompt(&mut self) {
        let prompt_str = self.prompt.to_string();
        match prompt_str.trim().to_lowercase().as_str() {
            "status" => {
                self.emit_canned(self.status_text());
                self.prompt.reset();
                return;
            }
            "help" => {
                self.emit_canned(self.help_text());
                self.prompt.reset();
                return;
            }
            "history" => {
                self.emit_canned(self.history_text());
                self.prompt.reset();
                return;
            }
            _ => {}
        }

        let system_message = match self.prompts.get(prompts::SHELL_SYSTEM_MESSAGE, &[]) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "system message template lookup failed");
                self.set_state(ShellState::Normal);
                self.prompt.reset();
                return;
            }
        };

        let history = self
            .history
            .last_n_bytes(self.config.prompting.history_window, 512);
        let cancel = self.cancel.child_token();
        self.prompt_response_cancel = Some(cancel.clone());

        let request = CompletionRequest {
            cancel,
            prompt: prompt_str.clone(),
            model: self.config.provider.prompt_model.clone(),
            max_tokens: PROMPT_MAX_TOKENS,
            temperature: 0.7,
            history,
            system_message: Some(system_message),
        };

        self.history.add(BlockKind::Prompt, &prompt_str);
        self.spawn_completion(request);
        self.prompt.reset();
    }

    /// `!goal` — enter agent mode and send the goal.
    pub(crate) fn start_agent(&mut self) {
        self.aquarium_mode = true;
        let goal: String = self.prompt.to_string().chars().skip(1).collect();
        let prompt_str = format!("This is your goal: {goal}");
        info!(goal = %goal, "entering agent mode");
        self.prompt.reset();
        self.spawn_agent_prompt(prompt_str);
    }

    /// A plain prompt typed while agent mode is active is a chat follow-up
    /// under the agent system message.
    pub(crate) fn send_agent_followup(&mut self) {
        let prompt_str = self.prompt.to_string();
        self.prompt.reset();
        self.spawn_agent_prompt(prompt_str);
    }

    fn spawn_agent_prompt(&mut self, prompt_str: String) {
        let history = self
            .history
            .last_n_bytes(self.config.prompting.agent_history_window, 2048);
        let cancel = self.cancel.child_token();
        self.prompt_response_cancel = Some(cancel.clone());

        let request = CompletionRequest {
            cancel,
            prompt: prompt_str.clone(),
            model: self.config.provider.prompt_model.clone(),
            max_tokens: AGENT_MAX_TOKENS,
            temperature: 0.7,
            history,
            system_message: Some(AGENT_SYSTEM_MESSAGE.to_string()),
        };

        self.history.add(BlockKind::Prompt, &prompt_str);
        self.spawn_completion(request);
    }

    /// Feed a dispatched command's output and exit code back to the agent.
    fn respond_agent(&mut self, status: i32, output: &str) {
        debug!(status, "responding to agent with command result");
        let prompt_str = format!("{output}\nExit code: {status}\n");
        let history = self
            .history
            .last_n_bytes(self.config.prompting.agent_history_window, 2048);
        let cancel = self.cancel.child_token();
        self.prompt_response_cancel = Some(cancel.clone());

        let request = CompletionRequest {
            cancel,
            prompt: prompt_str,
            model: self.config.provider.prompt_model.clone(),
            max_tokens: AGENT_MAX_TOKENS,
            temperature: 0.7,
            history,
            system_message: Some(AGENT_SYSTEM_MESSAGE.to_string()),
        };

        self.spawn_completion(request);
    }

    /// Run a streaming completion in a background task. Tokens go to the
    /// answer writer as they arrive; the full text is delivered on the
    /// prompt-output channel when the task ends, however it ends.
    fn spawn_completion(&mut self, request: CompletionRequest) {
        let client = Arc::clone(&self.llm);
        let tx = self.prompt_output_tx.clone();
        let answer = self.answer.clone();
        let cancel = request.cancel.clone();
        let deadline = Duration::from_secs(self.config.prompting.timeout_secs);

        tokio::spawn(async move {
            let accumulated = Arc::new(Mutex::new(String::new()));
            let sink = answer.clone();
            let acc = Arc::clone(&accumulated);
            let on_token: TokenCallback = Box::new(move |token: &str| {
                sink.write_text(token);
                if let Ok(mut text) = acc.lock() {
                    text.push_str(token);
                }
            });

            let result =
                tokio::time::timeout(deadline, client.completion_stream(request, on_token)).await;

            let output = match result {
                Ok(Ok(full)) => full,
                Ok(Err(err)) if err.is_canceled() => {
                    debug!("completion canceled");
                    accumulated.lock().map(|t| t.clone()).unwrap_or_default()
                }
                Ok(Err(err)) => {
                    error!(error = %err, "completion failed");
                    let mut message = format!("Error prompting: {err}\n");
                    if err.is_quota() {
                        message.push_str(QUOTA_HELP);
                        message.push('\n');
                    }
                    answer.write_text(&message);
                    accumulated.lock().map(|t| t.clone()).unwrap_or_default()
                }
                Err(_) => {
                    cancel.cancel();
                    warn!("completion deadline exceeded");
                    answer.write_text("Error prompting: deadline exceeded\n");
                    accumulated.lock().map(|t| t.clone()).unwrap_or_default()
                }
            };

            let _ = tx.send(output).await;
        });
    }

    /// Local replies go out through the answer writer and come back through
    /// the prompt-output channel, so the next-prompt redraw logic is the
    /// same as for model replies.
    fn emit_canned(&self, text: String) {
        self.answer.write_text(&text);
        let tx = self.prompt_output_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(text).await;
        });
    }

    fn status_text(&self) -> String {
        format!(
            "You're in remora shell mode.\n\n\
             Prompting model:     {}\n\
             Prompt window:       {} bytes\n\
             Agent window:        {} bytes\n\
             Autosuggest:         {}\n\
             Autosuggest model:   {}\n\
             Autosuggest delay:   {} ms\n\
             Command marker:      {}\n",
            self.config.provider.prompt_model,
            self.config.prompting.history_window,
            self.config.prompting.agent_history_window,
            self.config.autosuggest.enabled,
            self.config.provider.autosuggest_model,
            self.config.autosuggest.debounce_ms,
            self.config.shell.command_prompt,
        )
    }

    fn help_text(&self) -> String {
        "You're in remora shell mode, a wrapper around your normal shell:\n\
         \n\
         - Type a command as usual, like \"ls -l\", and press enter to run it\n\
         - Start a line with a capital letter to ask the model a question,\n  \
           like \"How do I find local .py files?\"\n\
         - Start a line with ! to give the model a goal it will pursue by\n  \
           running commands itself\n\
         - Inline suggestions appear as you type; press tab to accept one\n\
         - Type \"Status\" for the current configuration, \"History\" for the\n  \
           recent session history\n\
         - The model sees your shell history, so contextual questions like\n  \
           \"Why didn't my last command work?\" are fine\n"
            .to_string()
    }

    fn history_text(&self) -> String {
        let blocks = self.history.last_n_bytes(2000, 512);
        if blocks.is_empty() {
            return "No session history yet.\n".to_string();
        }
        let mut text = String::new();
        for block in blocks {
            text.push_str(&format!("[{}] {}\n", block.kind.label(), block.content));
        }
        text
    }
}

/// Push chunks from a blocking reader into a channel until EOF.
pub fn spawn_byte_reader(reader: Box<dyn Read + Send>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(32);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "stream read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Like `spawn_byte_reader`, but peels cursor-position reports off the
/// stream onto their own channel so they never reach the state machine.
pub fn spawn_parent_reader(
    reader: Box<dyn Read + Send>,
) -> (mpsc::Receiver<Vec<u8>>, mpsc::Receiver<CursorPos>) {
    let (tx, rx) = mpsc::channel(32);
    let (cursor_tx, cursor_rx) = mpsc::channel(8);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut scanner = CursorReportScanner::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let (forwarded, reports) = scanner.scan(&buf[..n]);
                    for report in reports {
                        if cursor_tx.blocking_send(report).is_err() {
                            return;
                        }
                    }
                    if !forwarded.is_empty() && tx.blocking_send(forwarded).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "parent read failed");
                    break;
                }
            }
        }
    });
    (rx, cursor_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::collections::VecDeque;

    #[derive(Clone, Default)]
    struct CaptureWriter {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CaptureWriter {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.data.lock().unwrap()).into_owned()
        }
    }

    #[derive(Clone)]
    struct RecordedRequest {
        prompt: String,
        system_message: Option<String>,
        max_tokens: u32,
    }

    struct MockLlm {
        responses: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<RecordedRequest>>,
    }

    impl MockLlm {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, request: &CompletionRequest) {
            self.requests.lock().unwrap().push(RecordedRequest {
                prompt: request.prompt.clone(),
                system_message: request.system_message.clone(),
                max_tokens: request.max_tokens,
            });
        }

        fn next_response(&self) -> String {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, index: usize) -> RecordedRequest {
            self.requests.lock().unwrap()[index].clone()
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for MockLlm {
        async fn completion_stream(
            &self,
            request: CompletionRequest,
            mut on_token: TokenCallback,
        ) -> Result<String, LlmError> {
            self.record(&request);
            if request.cancel.is_cancelled() {
                return Err(LlmError::Canceled);
            }
            let response = self.next_response();
            on_token(&response);
            Ok(response)
        }

        async fn completion(&self, request: CompletionRequest) -> Result<String, LlmError> {
            self.record(&request);
            if request.cancel.is_cancelled() {
                return Err(LlmError::Canceled);
            }
            Ok(self.next_response())
        }
    }

    struct Fixture {
        mux: ShellMultiplexer,
        parent_out: CaptureWriter,
        child_in: CaptureWriter,
        cursor_tx: mpsc::Sender<CursorPos>,
        llm: Arc<MockLlm>,
        _child_out_tx: mpsc::Sender<Vec<u8>>,
        _parent_in_tx: mpsc::Sender<Vec<u8>>,
        _resize_tx: mpsc::Sender<usize>,
    }

    fn fixture(responses: &[&str]) -> Fixture {
        let llm = MockLlm::new(responses);
        let parent_out = CaptureWriter::default();
        let child_in = CaptureWriter::default();
        let (child_out_tx, child_out_rx) = mpsc::channel(8);
        let (parent_in_tx, parent_in_rx) = mpsc::channel(8);
        let (cursor_tx, cursor_rx) = mpsc::channel(8);
        let (resize_tx, resize_rx) = mpsc::channel(1);

        let mut config = Config::default();
        config.autosuggest.enabled = false;

        let mut mux = ShellMultiplexer::new(MultiplexerOptions {
            config,
            llm: llm.clone(),
            prompts: Arc::new(PromptLibrary::default()),
            cancel: CancellationToken::new(),
            child_in: shared_writer(child_in.clone()),
            parent_out: shared_writer(parent_out.clone()),
            child_out_rx,
            parent_in_rx,
            cursor_rx,
            resize_rx,
            term_width: 80,
        });
        mux.foreground_check = Box::new(|| false);

        Fixture {
            mux,
            parent_out,
            child_in,
            cursor_tx,
            llm,
            _child_out_tx: child_out_tx,
            _parent_in_tx: parent_in_tx,
            _resize_tx: resize_tx,
        }
    }

    async fn feed(fix: &mut Fixture, bytes: &[u8]) {
        fix.mux.handle_parent_input(bytes.to_vec()).await;
    }

    async fn preload_cursor(fix: &Fixture, col: usize) {
        fix.cursor_tx
            .send(CursorPos { row: 1, col })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_normal_command_is_forwarded_and_recorded() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"l").await;
        assert_eq!(fix.mux.state(), ShellState::Shell);
        feed(&mut fix, b"s").await;
        feed(&mut fix, b"\r").await;
        assert_eq!(fix.mux.state(), ShellState::Normal);
        assert_eq!(fix.child_in.text(), "ls\r");

        let blocks = fix.mux.history.last_n_bytes(1000, 512);
        assert!(blocks
            .iter()
            .any(|b| b.kind == BlockKind::ShellInput && b.content == "ls"));
    }

    #[tokio::test]
    async fn test_carriage_return_in_normal_passes_through() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"\r").await;
        assert_eq!(fix.mux.state(), ShellState::Normal);
        assert_eq!(fix.child_in.text(), "\r");
    }

    #[tokio::test]
    async fn test_uppercase_starts_prompt_and_streams_response() {
        let mut fix = fixture(&["Use grep -r <pattern> <dir>"]);
        preload_cursor(&fix, 2).await;

        feed(&mut fix, b"H").await;
        assert_eq!(fix.mux.state(), ShellState::Prompting);
        assert!(fix.parent_out.text().contains(ansi::PROMPT_COLOR));
        // the prompt byte is echoed by us, not the child
        assert!(fix.child_in.text().is_empty());

        feed(&mut fix, b"ow do I grep?").await;
        feed(&mut fix, b"\r").await;
        assert_eq!(fix.mux.state(), ShellState::PromptResponse);

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        assert_eq!(output, "Use grep -r <pattern> <dir>");
        // tokens were streamed to the terminal in answer color
        assert!(fix.parent_out.text().contains(ANSWER_COLOR));
        assert!(fix.parent_out.text().contains("Use grep -r"));

        fix.mux.handle_prompt_output(&output);
        assert_eq!(fix.mux.state(), ShellState::Normal);
        // a newline is sent to the child to re-elicit its prompt
        assert_eq!(fix.child_in.text(), "\n");

        let request = fix.llm.request(0);
        assert_eq!(request.prompt, "How do I grep?");
        assert_eq!(request.max_tokens, PROMPT_MAX_TOKENS);
        assert!(request.system_message.unwrap().contains("unix shell"));

        let blocks = fix.mux.history.last_n_bytes(4096, 512);
        assert!(blocks
            .iter()
            .any(|b| b.kind == BlockKind::Prompt && b.content == "How do I grep?"));
        assert!(blocks.iter().any(|b| b.kind == BlockKind::LlmOutput));
    }

    #[tokio::test]
    async fn test_child_output_buffered_until_response_completes() {
        let mut fix = fixture(&["answer text"]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"Question\r").await;
        assert_eq!(fix.mux.state(), ShellState::PromptResponse);

        fix.mux.handle_child_output(b"job output 1\r\n");
        assert!(!fix.parent_out.text().contains("job output 1"));

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        fix.mux.handle_prompt_output(&output);

        let shown = fix.parent_out.text();
        assert_eq!(shown.matches("job output 1").count(), 1);
        let blocks = fix.mux.history.last_n_bytes(4096, 512);
        assert!(blocks
            .iter()
            .any(|b| b.kind == BlockKind::ShellOutput && b.content.contains("job output 1")));
    }

    #[tokio::test]
    async fn test_ctrl_c_cancels_streaming_response() {
        let mut fix = fixture(&["partial"]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"Question\r").await;

        let token = fix
            .mux
            .prompt_response_cancel
            .clone()
            .expect("cancel handle should be stored");
        feed(&mut fix, &[CTRL_C]).await;
        assert!(token.is_cancelled());
        assert!(fix.mux.prompt_response_cancel.is_none());
        // state only returns to Normal once the output channel drains
        assert_eq!(fix.mux.state(), ShellState::PromptResponse);

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        fix.mux.handle_prompt_output(&output);
        assert_eq!(fix.mux.state(), ShellState::Normal);
    }

    #[tokio::test]
    async fn test_other_input_discarded_during_response() {
        let mut fix = fixture(&["answer"]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"Question\r").await;

        let child_before = fix.child_in.text();
        feed(&mut fix, b"stray keys").await;
        assert_eq!(fix.child_in.text(), child_before);
        assert_eq!(fix.mux.state(), ShellState::PromptResponse);
    }

    #[tokio::test]
    async fn test_agent_loop_dispatches_and_reports_exit_code() {
        let mut fix = fixture(&["Listing the files.\nRUN: ls *.md", "GOAL ACHIEVED"]);
        preload_cursor(&fix, 2).await;

        feed(&mut fix, b"!list all .md files\r").await;
        assert!(fix.mux.aquarium_mode);
        let request = fix.llm.request(0);
        assert_eq!(request.prompt, "This is your goal: list all .md files");
        assert_eq!(request.max_tokens, AGENT_MAX_TOKENS);
        assert_eq!(
            request.system_message.as_deref(),
            Some(AGENT_SYSTEM_MESSAGE)
        );

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        fix.mux.handle_prompt_output(&output);
        assert_eq!(fix.child_in.text(), "\nls *.md\n");
        assert_eq!(fix.mux.state(), ShellState::Normal);

        // the echoed command and the fresh prompt each carry one marker
        let chunk1 = format!("ls *.md\r\n 0{}", ps1::PROMPT_SUFFIX);
        fix.mux.handle_child_output(chunk1.as_bytes());
        assert_eq!(fix.llm.request_count(), 1);
        let chunk2 = format!("README.md\r\nNOTES.md\r\n 0{}", ps1::PROMPT_SUFFIX);
        fix.mux.handle_child_output(chunk2.as_bytes());

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        assert_eq!(output, "GOAL ACHIEVED");
        let request = fix.llm.request(1);
        assert!(request.prompt.contains("README.md"));
        assert!(request.prompt.contains("Exit code: 0"));

        fix.mux.handle_prompt_output(&output);
        assert!(!fix.mux.aquarium_mode);
        assert_eq!(fix.mux.state(), ShellState::Normal);
    }

    #[tokio::test]
    async fn test_agent_without_directive_parks_counter() {
        let mut fix = fixture(&["I cannot tell yet, thinking."]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"!do something\r").await;

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        fix.mux.handle_prompt_output(&output);
        assert!(fix.mux.aquarium_mode);
        assert_eq!(fix.mux.prompt_suffix_counter, agent::SUPPRESS_REPROMPT);

        // stray prompt markers no longer reach the dispatch threshold
        let chunk = format!(" 0{}", ps1::PROMPT_SUFFIX);
        fix.mux.handle_child_output(chunk.as_bytes());
        fix.mux.handle_child_output(chunk.as_bytes());
        assert_eq!(fix.llm.request_count(), 1);
    }

    #[tokio::test]
    async fn test_tab_realizes_suggestion_into_child() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"l").await;
        feed(&mut fix, b"s").await;
        fix.mux.autosuggest.last = " -la".to_string();

        feed(&mut fix, b"\t").await;
        assert_eq!(fix.mux.state(), ShellState::Shell);
        assert_eq!(fix.child_in.text(), "ls -la");
        assert_eq!(fix.mux.command.to_string(), "ls -la");
        assert!(fix.mux.autosuggest.last.is_empty());
    }

    #[tokio::test]
    async fn test_split_escape_sequence_is_reassembled() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"\x1b").await;
        // nothing dispatched yet
        assert!(fix.child_in.text().is_empty());
        feed(&mut fix, b"[C").await;
        // the complete arrow key reached the child in one piece
        assert_eq!(fix.child_in.text(), "\x1b[C");
        assert_eq!(fix.mux.state(), ShellState::Normal);
    }

    #[tokio::test]
    async fn test_foreground_job_bypasses_state_machine() {
        let mut fix = fixture(&[]);
        fix.mux.foreground_check = Box::new(|| true);
        feed(&mut fix, b"Uppercase goes straight through").await;
        assert_eq!(fix.mux.state(), ShellState::Normal);
        assert_eq!(fix.child_in.text(), "Uppercase goes straight through");
    }

    #[tokio::test]
    async fn test_status_command_is_answered_locally() {
        let mut fix = fixture(&[]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"Status\r").await;

        let output = fix.mux.prompt_output_rx.recv().await.unwrap();
        assert!(output.contains("Prompting model"));
        assert_eq!(fix.llm.request_count(), 0);

        fix.mux.handle_prompt_output(&output);
        assert_eq!(fix.mux.state(), ShellState::Normal);
    }

    #[tokio::test]
    async fn test_ctrl_c_while_prompting_returns_to_normal() {
        let mut fix = fixture(&[]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"Hel").await;
        assert_eq!(fix.mux.state(), ShellState::Prompting);
        feed(&mut fix, &[CTRL_C]).await;
        assert_eq!(fix.mux.state(), ShellState::Normal);
        assert!(fix.mux.prompt.is_empty());
    }

    #[tokio::test]
    async fn test_backspacing_prompt_to_empty_returns_to_normal() {
        let mut fix = fixture(&[]);
        preload_cursor(&fix, 2).await;
        feed(&mut fix, b"A").await;
        assert_eq!(fix.mux.state(), ShellState::Prompting);
        feed(&mut fix, b"\x7f").await;
        assert_eq!(fix.mux.state(), ShellState::Normal);
    }

    #[tokio::test]
    async fn test_backspacing_command_to_empty_returns_to_normal() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"x").await;
        assert_eq!(fix.mux.state(), ShellState::Shell);
        feed(&mut fix, b"\x7f").await;
        assert_eq!(fix.mux.state(), ShellState::Normal);
    }

    #[tokio::test]
    async fn test_resize_propagates_width() {
        let mut fix = fixture(&[]);
        fix.mux.handle_resize(42);
        assert_eq!(fix.mux.term_width, 42);
    }

    #[tokio::test]
    async fn test_autosuggest_result_validation() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"l").await;
        feed(&mut fix, b"s").await;

        // a result for a different buffer is stale and dropped
        fix.mux
            .handle_autosuggest_result(AutosuggestResult {
                command: "cd".into(),
                suggestion: "cd /tmp".into(),
            })
            .await;
        assert!(fix.mux.autosuggest.last.is_empty());

        // multi-line suggestions are dropped
        fix.mux
            .handle_autosuggest_result(AutosuggestResult {
                command: "ls".into(),
                suggestion: "ls -la\nls -lh".into(),
            })
            .await;
        assert!(fix.mux.autosuggest.last.is_empty());

        // a suggestion that does not extend the typed text is dropped
        fix.mux
            .handle_autosuggest_result(AutosuggestResult {
                command: "ls".into(),
                suggestion: "pwd".into(),
            })
            .await;
        assert!(fix.mux.autosuggest.last.is_empty());

        // a valid result renders its tail in the muted color
        preload_cursor(&fix, 5).await;
        fix.mux
            .handle_autosuggest_result(AutosuggestResult {
                command: "ls".into(),
                suggestion: "ls -la".into(),
            })
            .await;
        assert_eq!(fix.mux.autosuggest.last, " -la");
        let shown = fix.parent_out.text();
        assert!(shown.contains(ansi::AUTOSUGGEST_COLOR));
        assert!(shown.contains(" -la"));
    }

    #[tokio::test]
    async fn test_typing_suggestion_prefix_contracts_without_new_request() {
        let mut fix = fixture(&[]);
        feed(&mut fix, b"l").await;
        feed(&mut fix, b"s").await;
        preload_cursor(&fix, 5).await;
        fix.mux
            .handle_autosuggest_result(AutosuggestResult {
                command: "ls".into(),
                suggestion: "ls -la".into(),
            })
            .await;
        assert_eq!(fix.mux.autosuggest.last, " -la");

        feed(&mut fix, b" ").await;
        assert_eq!(fix.mux.autosuggest.last, "-la");
        feed(&mut fix, b"-l").await;
        assert_eq!(fix.mux.autosuggest.last, "a");
        // no request was issued for any of this
        assert_eq!(fix.llm.request_count(), 0);
    }
}
