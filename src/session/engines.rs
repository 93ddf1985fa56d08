//! Engine client contracts for the local pipeline.
//!
//! The concrete STT/LLM/TTS engines live outside this process; the local
//! backend talks to them over their streaming contracts. The LLM client
//! speaks the OpenAI-compatible chat completions API with SSE streaming,
//! so any Ollama/vLLM/llama.cpp server works unchanged.

use crate::config::EngineConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A finished transcription.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.95
}

/// One message in the LLM conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Speech-to-text over a transcription service.
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Transcribe one utterance of PCM16/16k audio.
    async fn transcribe(&self, pcm: &[u8]) -> Result<Transcript>;
}

/// Token-streaming language model.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    /// Stream a reply for `messages`, sending each token through `tokens`.
    /// Returns the full response text. Stops early when `cancel` fires.
    async fn stream_reply(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Text-to-speech synthesis.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize `text` into PCM16/16k bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// STT client posting raw PCM to an HTTP transcription service.
pub struct HttpSttEngine {
    client: reqwest::Client,
    url: String,
}

impl HttpSttEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.stt_url.clone(),
        }
    }
}

#[async_trait]
impl SttEngine for HttpSttEngine {
    async fn transcribe(&self, pcm: &[u8]) -> Result<Transcript> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/octet-stream")
            .body(pcm.to_vec())
            .send()
            .await
            .map_err(|e| GatewayError::Stt(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(GatewayError::Stt(format!(
                "service returned {}",
                response.status()
            )));
        }
        response
            .json::<Transcript>()
            .await
            .map_err(|e| GatewayError::Stt(format!("invalid response: {e}")))
    }
}

/// LLM client for OpenAI-compatible chat completion endpoints with SSE.
pub struct OpenAiCompatLlm {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatLlm {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.llm_url.trim_end_matches('/').to_owned(),
            model: config.llm_model.clone(),
            api_key: config.llm_api_key.clone(),
        }
    }

    fn completions_url(&self) -> String {
        let base = self.base_url.strip_suffix("/v1").unwrap_or(&self.base_url);
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl LlmEngine for OpenAiCompatLlm {
    async fn stream_reply(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "stream": true,
        });

        let mut request = self.client.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Llm(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(GatewayError::Llm(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut pending = String::new();
        let mut full_text = String::new();

        'outer: while let Some(chunk) = tokio::select! {
            () = cancel.cancelled() => None,
            chunk = stream.next() => chunk,
        } {
            let chunk = chunk.map_err(|e| GatewayError::Llm(format!("stream error: {e}")))?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim_end_matches('\r').to_owned();
                pending.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }
                let parsed: serde_json::Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("skipping unparseable SSE chunk: {e}");
                        continue;
                    }
                };
                if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str()
                    && !content.is_empty()
                {
                    full_text.push_str(content);
                    if tokens.send(content.to_owned()).await.is_err() {
                        break 'outer;
                    }
                }
                if parsed["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break 'outer;
                }
            }
        }

        Ok(full_text)
    }
}

/// TTS client posting text to an HTTP synthesis service returning raw PCM.
pub struct HttpTtsEngine {
    client: reqwest::Client,
    url: String,
}

impl HttpTtsEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.tts_url.clone(),
        }
    }
}

#[async_trait]
impl TtsEngine for HttpTtsEngine {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| GatewayError::Tts(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(GatewayError::Tts(format!(
                "service returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Tts(format!("body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Split accumulated LLM text into sentences ready for synthesis.
///
/// Returns complete sentences and leaves the unfinished tail in `buffer`.
pub fn drain_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    loop {
        let Some(end) = buffer.find(['.', '!', '?']) else {
            break;
        };
        let sentence: String = buffer.drain(..=end).collect();
        let trimmed = sentence.trim();
        if trimmed.len() > 1 {
            sentences.push(trimmed.to_owned());
        }
    }
    sentences
}
