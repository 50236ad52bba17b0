//! Wire shapes for the two completion endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bookgen_core::GenerationRequest;

#[derive(Debug, Serialize)]
pub(crate) struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

fn messages(request: &GenerationRequest) -> Vec<Message<'_>> {
    let mut messages = Vec::with_capacity(2);
    if !request.system.trim().is_empty() {
        messages.push(Message {
            role: "system",
            content: &request.system,
        });
    }
    messages.push(Message {
        role: "user",
        content: &request.prompt,
    });
    messages
}

/// `chat/completions` body. This shape never carries a structured-output
/// directive: the endpoint rejects it.
#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub(crate) fn new(request: &'a GenerationRequest, stream: bool) -> Self {
        let capabilities = request.capabilities();
        Self {
            model: &request.model,
            messages: messages(request),
            max_tokens: request.sampling.max_output_tokens,
            temperature: capabilities
                .supports_temperature
                .then_some(request.sampling.temperature),
            seed: request.sampling.seed,
            stream,
        }
    }
}

/// `responses` body: flattened `input`, output budget and optional JSON mode.
#[derive(Debug, Serialize)]
pub(crate) struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<Message<'a>>,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextOptions>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TextOptions {
    format: TextFormat,
}

#[derive(Debug, Serialize)]
pub(crate) struct TextFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> ResponsesRequest<'a> {
    pub(crate) fn new(request: &'a GenerationRequest) -> Self {
        let capabilities = request.capabilities();
        Self {
            model: &request.model,
            input: messages(request),
            max_output_tokens: request.sampling.max_output_tokens,
            temperature: capabilities
                .supports_temperature
                .then_some(request.sampling.temperature),
            text: request.wants_structured_output().then_some(TextOptions {
                format: TextFormat {
                    kind: "json_object",
                },
            }),
        }
    }
}

/// Completion text from either endpoint's response: `output_text`, then the
/// first text block under `output[].content[]`, then the chat-shaped
/// `choices[0].message.content`.
pub(crate) fn extract_text(response: &Value) -> Option<String> {
    let non_empty = |text: &str| (!text.trim().is_empty()).then(|| text.to_string());

    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if let Some(text) = non_empty(text) {
            return Some(text);
        }
    }

    let blocks = response
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten();
    for block in blocks {
        if let Some(text) = block.get("text").and_then(Value::as_str).and_then(non_empty) {
            return Some(text);
        }
    }

    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .and_then(non_empty)
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub size: &'a str,
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageResponse {
    #[serde(default)]
    pub data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageDatum {
    #[serde(default)]
    pub b64_json: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}
