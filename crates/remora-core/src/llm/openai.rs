//! OpenAI-compatible chat-completions client
//!
//! Maps the session history onto chat roles and talks to any endpoint that
//! speaks the OpenAI chat API: plain JSON for one-shot completions, SSE for
//! streaming.

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{CompletionRequest, LlmError, TokenCallback};
use crate::history::{BlockKind, HistoryBlock};

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(request: &CompletionRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_message {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for block in &request.history {
            messages.push(history_message(block));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = Self::request_body(request, stream);
        let response = tokio::select! {
            _ = request.cancel.cancelled() => return Err(LlmError::Canceled),
            result = self
                .http
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send() => result.map_err(|e| LlmError::Http(e.to_string()))?,
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Quota(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {text}")));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl super::LlmClient for OpenAiClient {
    async fn completion_stream(
        &self,
        request: CompletionRequest,
        mut on_token: TokenCallback,
    ) -> Result<String, LlmError> {
        let response = self.send(&request, true).await?;
        let mut stream = response.bytes_stream();

        let mut pending = String::new();
        let mut full = String::new();
        loop {
            let chunk = tokio::select! {
                _ = request.cancel.cancelled() => return Err(LlmError::Canceled),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => return Err(LlmError::Http(e.to_string())),
                    None => break,
                },
            };

            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                match parse_sse_line(line.trim_end()) {
                    SseEvent::Token(token) => {
                        on_token(&token);
                        full.push_str(&token);
                    }
                    SseEvent::Done => {
                        debug!(output_len = full.len(), "completion stream done");
                        return Ok(full);
                    }
                    SseEvent::Skip => {}
                }
            }
        }
        Ok(full)
    }

    async fn completion(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let response = self.send(&request, false).await?;
        let body: CompletionResponse = tokio::select! {
            _ = request.cancel.cancelled() => return Err(LlmError::Canceled),
            result = response.json() => result.map_err(|e| LlmError::Api(e.to_string()))?,
        };
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.map(|m| m.content))
            .ok_or_else(|| LlmError::Api("response carried no choices".to_string()))?;
        Ok(text)
    }
}

fn history_message(block: &HistoryBlock) -> Value {
    match block.kind {
        BlockKind::Prompt => json!({ "role": "user", "content": block.content }),
        BlockKind::LlmOutput => json!({ "role": "assistant", "content": block.content }),
        BlockKind::ShellInput => json!({
            "role": "user",
            "content": format!("I ran this command:\n{}", block.content),
        }),
        BlockKind::ShellOutput => json!({
            "role": "user",
            "content": format!("The command printed:\n{}", block.content),
        }),
    }
}

enum SseEvent {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseEvent::Skip;
    };
    let token = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    if token.is_empty() {
        SseEvent::Skip
    } else {
        SseEvent::Token(token.to_string())
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}
