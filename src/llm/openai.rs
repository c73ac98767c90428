//! OpenAI-compatible Chat Completions adapter.
//!
//! Works against any endpoint speaking the Chat Completions wire format
//! (OpenAI, DeepSeek, local gateways) selected via `OPENAI_BASE_URL`.
//! Streams are decoded with [`SseDecoder`] and normalized to [`StreamEvent`];
//! each chunk read carries a deadline so a stalled provider cannot hang a
//! turn forever.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::sse_decoder::SseDecoder;
use super::types::{
    ChatMessage, StreamEvent, ToolCallDelta, ToolDefinition, Usage, WireToolCall,
};
use super::{ChatProvider, Workload};

pub struct OpenAiProvider {
    client: HttpClient,
    api_key: String,
    base_url: String,
    model: String,
    chunk_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, base_url: &str, model: &str, chunk_timeout: Duration) -> Self {
        Self {
            client: HttpClient::new(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').into(),
            model: model.into(),
            chunk_timeout,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    async fn post_request(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("(failed to read body: {e})"));
            bail!("LLM API error {status}: {text}");
        }
        Ok(response)
    }

    /// Pump the HTTP byte stream into normalized events.
    async fn process_sse_stream(
        response: reqwest::Response,
        chunk_timeout: Duration,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = match tokio::time::timeout(chunk_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = tx
                        .send(StreamEvent::Error(format!(
                            "LLM stream read timed out after {}s",
                            chunk_timeout.as_secs()
                        )))
                        .await;
                    break;
                }
            };

            for frame in decoder.push(&chunk) {
                if frame.is_done() {
                    continue;
                }
                let parsed: ChatStreamChunk = match frame.try_parse() {
                    Some(parsed) => parsed,
                    None => continue,
                };

                for choice in parsed.choices {
                    let delta = choice.delta;
                    if let Some(content) = delta.content {
                        if !content.is_empty()
                            && tx.send(StreamEvent::TextDelta(content)).await.is_err()
                        {
                            return;
                        }
                    }
                    if let Some(reasoning) = delta.reasoning_content {
                        if !reasoning.is_empty()
                            && tx.send(StreamEvent::ReasoningDelta(reasoning)).await.is_err()
                        {
                            return;
                        }
                    }
                    for tc in delta.tool_calls.unwrap_or_default() {
                        let delta = ToolCallDelta {
                            index: tc.index,
                            id: tc.id,
                            name_fragment: tc.function.as_ref().and_then(|f| f.name.clone()),
                            args_fragment: tc
                                .function
                                .as_ref()
                                .and_then(|f| f.arguments.clone()),
                        };
                        if tx.send(StreamEvent::ToolCallDelta(delta)).await.is_err() {
                            return;
                        }
                    }
                }

                if let Some(usage) = parsed.usage {
                    let _ = tx
                        .send(StreamEvent::Usage(Usage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                        }))
                        .await;
                }
            }
        }

        let _ = tx.send(StreamEvent::Done).await;
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn model_for(&self, _workload: Workload) -> String {
        // One configured model serves both workloads; the split exists so a
        // cheaper summarization model can be routed without touching callers.
        self.model.clone()
    }

    async fn generate_stream(
        &self,
        workload: Workload,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = ChatCompletionRequest {
            model: self.model_for(workload),
            messages: messages.to_vec(),
            tools: if tools.is_empty() {
                None
            } else {
                Some(Self::convert_tools(tools))
            },
            stream: true,
            stream_options: Some(serde_json::json!({ "include_usage": true })),
        };
        let response = self.post_request(&body).await?;

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(Self::process_sse_stream(response, self.chunk_timeout, tx));
        Ok(rx)
    }

    async fn generate(&self, workload: Workload, messages: &[ChatMessage]) -> Result<String> {
        let body = ChatCompletionRequest {
            model: self.model_for(workload),
            messages: messages.to_vec(),
            tools: None,
            stream: false,
            stream_options: None,
        };
        let response = self.post_request(&body).await?;
        let parsed: ChatCompletionResponse = response.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

// ---- wire types ----

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[allow(dead_code)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
