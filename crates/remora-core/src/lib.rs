//! remora-core — shell multiplexer, line editing, and LLM plumbing
//!
//! The wrapper sits between the user's terminal and a child shell on a
//! PTY. This crate holds everything between the two file descriptors: the
//! multiplexer state machine, the line buffer and its terminal
//! reconciliation, the session history, prompt-marker injection and
//! parsing, autosuggest coordination, the agent loop, and the
//! language-model client.

pub mod ansi;
pub mod buffer;
pub mod config;
pub mod history;
pub mod llm;
pub mod mux;
pub mod procs;
pub mod prompts;
pub mod ps1;

pub use config::Config;
pub use mux::{
    shared_writer, spawn_byte_reader, spawn_parent_reader, MultiplexerOptions, ShellMultiplexer,
    ShellState,
};
