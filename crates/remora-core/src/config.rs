//! Configuration
//!
//! JSON config at ~/.config/remora/remora.json with defaults for every
//! section, so a missing file is a working setup. Environment variables
//! override the provider endpoint and key.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub shell: ShellConfig,
    pub provider: ProviderConfig,
    pub autosuggest: AutosuggestConfig,
    pub prompting: PromptingConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: ShellConfig::default(),
            provider: ProviderConfig::default(),
            autosuggest: AutosuggestConfig::default(),
            prompting: PromptingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// The shell binary to wrap.
    pub binary: String,
    /// Extra marker appended to the child's prompt so the user can see
    /// they are inside the wrapper.
    pub command_prompt: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            binary: env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            command_prompt: "»".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Environment variable consulted when `api_key` is empty.
    pub api_key_env: String,
    pub prompt_model: String,
    pub autosuggest_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            prompt_model: "gpt-4o".to_string(),
            autosuggest_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        env::var(&self.api_key_env).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosuggestConfig {
    pub enabled: bool,
    /// Keystroke debounce before a suggestion request is issued.
    pub debounce_ms: u64,
    /// History window handed to suggestion templates, in bytes.
    pub history_window: usize,
}

impl Default for AutosuggestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 400,
            history_window: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptingConfig {
    /// History window for plain prompts, in bytes.
    pub history_window: usize,
    /// History window while in agent mode, in bytes.
    pub agent_history_window: usize,
    /// Per-request deadline in seconds.
    pub timeout_secs: u64,
}

impl Default for PromptingConfig {
    fn default() -> Self {
        Self {
            history_window: 512,
            agent_history_window: 2048,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log file path; the terminal itself belongs to the session.
    pub file: String,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: "~/.local/share/remora/remora.log".to_string(),
            level: "info".to_string(),
        }
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = resolve_path(path.as_ref());
    if !path.exists() {
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        return Ok(cfg);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let mut cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

pub fn resolve_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if let Ok(home) = env::var("HOME") {
        if raw == "~" {
            return PathBuf::from(home);
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            return Path::new(&home).join(rest);
        }
    }
    path.to_path_buf()
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Some(value) = env_nonempty("REMORA_BASE_URL") {
        cfg.provider.base_url = value;
    }
    if let Some(value) = env_nonempty("REMORA_API_KEY") {
        cfg.provider.api_key = value;
    }
    if let Some(value) = env_nonempty("REMORA_PROMPT_MODEL") {
        cfg.provider.prompt_model = value;
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
