use serde_json::{json, Value};

use parley_core::errors::UpstreamError;
use parley_core::messages::Turn;

/// Resolve the chat-completions endpoint from a configured base URL.
///
/// `https://host`, `https://host/` and `https://host/v1` all map to
/// `https://host/v1/chat/completions`.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Build the request body: the system instruction first, then every turn in
/// order.
pub fn build_request_body(model: &str, system_prompt: &str, turns: &[Turn], stream: bool) -> Value {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    messages.push(json!({ "role": "system", "content": system_prompt }));
    messages.extend(
        turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content })),
    );

    json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    })
}

/// Extract `choices[0].message.content` from a non-streaming response.
pub fn extract_reply(body: &Value) -> Result<String, UpstreamError> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            UpstreamError::MalformedResponse("missing choices[0].message.content".into())
        })
}
