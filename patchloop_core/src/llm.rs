//! The language-model side of the loop.
//!
//! [`DiagnosisService`] is the only thing the rest of the crate sees. Concrete
//! backends speak to an HTTP chat API through [`ChatBackend`] and are wrapped
//! in [`ChatDiagnosis`], which owns the prompts. [`LoggedDiagnosis`] records
//! every exchange to the run's transcript file.

use crate::config::{LlmBackend, SupervisorConfig};
use crate::logs::LlmTranscript;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

const LOCATE_INSTRUCTION: &str = r#"Given this information in which files and functions should i look into to locate the bug? Return the results in a json format structured like the following example, without any additional comments.
[{
    "file": "example1.c",
    "function": "function1",
    "line": 10
}]"#;

const FIX_INSTRUCTION: &str = "Given this information, provide a fix. Return the fixed code for the whole function without any additional comments.";

const OPENAI_ENDPOINT: &str = "https://api.openai.com";
const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum LlmError {
    /// The service reported a failure on its side. Callers treat this as
    /// "no answer" rather than a fatal error.
    #[error("LLM service internal error: {0}")]
    Internal(String),
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("LLM service rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("LLM response has no message content: {0}")]
    MalformedReply(String),
    #[error("Environment variable {0} is not set")]
    MissingApiKey(&'static str),
    #[error("Failed to write LLM transcript: {0}")]
    Transcript(#[from] std::io::Error),
}

impl LlmError {
    pub fn is_internal(&self) -> bool {
        matches!(self, LlmError::Internal(_))
    }
}

/// Turns diagnostics into bug locations and buggy functions into fixes.
pub trait DiagnosisService: Send + Sync {
    /// Asks which files and functions are responsible for `report`. Returns
    /// the model's raw answer, expected to hold a JSON array.
    fn locate_bugs(&self, report: &str) -> Result<String, LlmError>;

    /// Asks for a corrected version of `function_text`. Returns the model's
    /// raw answer.
    fn propose_fix(&self, report: &str, function_text: &str) -> Result<String, LlmError>;
}

/// A single-turn chat completion endpoint.
pub trait ChatBackend: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Adapts a [`ChatBackend`] into a [`DiagnosisService`].
pub struct ChatDiagnosis<B> {
    backend: B,
}

impl<B: ChatBackend> ChatDiagnosis<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

pub fn locate_prompt(report: &str) -> String {
    format!("{report}{LOCATE_INSTRUCTION}")
}

pub fn fix_prompt(report: &str, function_text: &str) -> String {
    format!("{report}\n{function_text}\n {FIX_INSTRUCTION}")
}

impl<B: ChatBackend> DiagnosisService for ChatDiagnosis<B> {
    fn locate_bugs(&self, report: &str) -> Result<String, LlmError> {
        self.backend.complete(&locate_prompt(report))
    }

    fn propose_fix(&self, report: &str, function_text: &str) -> Result<String, LlmError> {
        self.backend.complete(&fix_prompt(report, function_text))
    }
}

/// Appends every request/response pair to the run's LLM transcript.
pub struct LoggedDiagnosis<S> {
    inner: S,
    transcript: LlmTranscript,
}

impl<S: DiagnosisService> LoggedDiagnosis<S> {
    pub fn new(inner: S, transcript: LlmTranscript) -> Self {
        Self { inner, transcript }
    }
}

impl<S: DiagnosisService> DiagnosisService for LoggedDiagnosis<S> {
    fn locate_bugs(&self, report: &str) -> Result<String, LlmError> {
        let reply = self.inner.locate_bugs(report);
        let shown = reply_for_log(&reply);
        self.transcript
            .append("ask_llm_to_find", &[("report", report), ("response", &shown)])?;
        reply
    }

    fn propose_fix(&self, report: &str, function_text: &str) -> Result<String, LlmError> {
        let reply = self.inner.propose_fix(report, function_text);
        let shown = reply_for_log(&reply);
        self.transcript.append(
            "ask_llm_to_fix",
            &[("function code", function_text), ("response", &shown)],
        )?;
        reply
    }
}

fn reply_for_log(reply: &Result<String, LlmError>) -> String {
    match reply {
        Ok(text) => text.clone(),
        Err(e) => format!("<error: {e}>"),
    }
}

/// Removes a surrounding Markdown code fence, if the reply is wrapped in one.
pub fn strip_code_fence(reply: &str) -> String {
    let trimmed = reply.trim();
    if !trimmed.starts_with("```") {
        return reply.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().skip(1).collect();
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n")
}

fn blocking_client() -> Result<reqwest::blocking::Client, LlmError> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

/// Runs `attempt` once plus up to `retries` more times while it fails at the
/// transport level.
fn with_retries<T>(
    retries: u32,
    mut attempt: impl FnMut() -> Result<T, LlmError>,
) -> Result<T, LlmError> {
    let mut tries = 0;
    loop {
        match attempt() {
            Err(LlmError::Transport(e)) if tries < retries => {
                tries += 1;
                tracing::warn!(attempt = tries, "LLM request failed, retrying: {e}");
            }
            other => return other,
        }
    }
}

/// OpenAI-compatible `/v1/chat/completions` backend.
pub struct OpenAiBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiBackend {
    pub fn new(
        api_key: String,
        model: String,
        endpoint: Option<String>,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            client: blocking_client()?,
            endpoint: endpoint.unwrap_or_else(|| OPENAI_ENDPOINT.to_string()),
            api_key,
            model,
            max_retries,
        })
    }
}

impl ChatBackend for OpenAiBackend {
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let url = format!("{}/v1/chat/completions", self.endpoint.trim_end_matches('/'));
        with_retries(self.max_retries, || {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()?;
            let status = response.status().as_u16();
            let text = response.text()?;
            parse_openai_reply(status, &text)
        })
    }
}

pub fn parse_openai_reply(status: u16, body: &str) -> Result<String, LlmError> {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    if status >= 500 || value["error"]["type"] == "server_error" {
        return Err(LlmError::Internal(body.to_string()));
    }
    if status >= 400 {
        return Err(LlmError::Rejected {
            status,
            body: body.to_string(),
        });
    }
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::MalformedReply(body.to_string()))
}

/// Anthropic `/v1/messages` backend.
pub struct AnthropicBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl AnthropicBackend {
    pub fn new(
        api_key: String,
        model: String,
        endpoint: Option<String>,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            client: blocking_client()?,
            endpoint: endpoint.unwrap_or_else(|| ANTHROPIC_ENDPOINT.to_string()),
            api_key,
            model,
            max_retries,
        })
    }
}

impl ChatBackend for AnthropicBackend {
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": ANTHROPIC_MAX_TOKENS,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
        with_retries(self.max_retries, || {
            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()?;
            let status = response.status().as_u16();
            let text = response.text()?;
            parse_anthropic_reply(status, &text)
        })
    }
}

pub fn parse_anthropic_reply(status: u16, body: &str) -> Result<String, LlmError> {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error_type = value["error"]["type"].as_str().unwrap_or_default();
    if status >= 500 || matches!(error_type, "api_error" | "overloaded_error") {
        return Err(LlmError::Internal(body.to_string()));
    }
    if status >= 400 {
        return Err(LlmError::Rejected {
            status,
            body: body.to_string(),
        });
    }
    let blocks = value["content"]
        .as_array()
        .ok_or_else(|| LlmError::MalformedReply(body.to_string()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    if text.is_empty() {
        return Err(LlmError::MalformedReply(body.to_string()));
    }
    Ok(text)
}

/// Builds the configured backend, reading its API key from the environment.
pub fn service_from_config(
    config: &SupervisorConfig,
) -> Result<Box<dyn DiagnosisService>, LlmError> {
    let model = config.llm_model.clone();
    let endpoint = config.llm_endpoint.clone();
    let retries = config.llm_max_retries;
    tracing::info!(backend = config.llm_backend.to_string(), %model, "using LLM backend");
    match config.llm_backend {
        LlmBackend::Openai => {
            let key = api_key("OPENAI_API_KEY")?;
            Ok(Box::new(ChatDiagnosis::new(OpenAiBackend::new(
                key, model, endpoint, retries,
            )?)))
        }
        LlmBackend::Anthropic => {
            let key = api_key("ANTHROPIC_API_KEY")?;
            Ok(Box::new(ChatDiagnosis::new(AnthropicBackend::new(
                key, model, endpoint, retries,
            )?)))
        }
    }
}

fn api_key(var: &'static str) -> Result<String, LlmError> {
    std::env::var(var).map_err(|_| LlmError::MissingApiKey(var))
}

impl DiagnosisService for Box<dyn DiagnosisService> {
    fn locate_bugs(&self, report: &str) -> Result<String, LlmError> {
        self.as_ref().locate_bugs(report)
    }

    fn propose_fix(&self, report: &str, function_text: &str) -> Result<String, LlmError> {
        self.as_ref().propose_fix(report, function_text)
    }
}
