use std::fmt;

use axum::http::StatusCode;
use serde_json::Value;

/// What the classifier is looking at: a full JSON reply or a drained stream's text.
#[derive(Debug, Clone, Copy)]
pub enum Completion<'a> {
    Json(&'a Value),
    Transcript(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyReason {
    Status(u16),
    NoChoices,
    EmptyContent,
    EmptyTranscript,
    Transport(String),
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::Status(code) => write!(f, "status {code}"),
            EmptyReason::NoChoices => f.write_str("no choices"),
            EmptyReason::EmptyContent => f.write_str("empty message content"),
            EmptyReason::EmptyTranscript => f.write_str("empty streamed content"),
            EmptyReason::Transport(class) => write!(f, "transport error ({class})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NonEmpty,
    Empty(EmptyReason),
}

/// First match wins: non-200, then missing choices, then blank first-choice content.
pub fn classify_completion(status: StatusCode, completion: Completion<'_>) -> Verdict {
    if status != StatusCode::OK {
        return Verdict::Empty(EmptyReason::Status(status.as_u16()));
    }
    match completion {
        Completion::Json(body) => classify_json(body),
        Completion::Transcript(text) => {
            if text.trim().is_empty() {
                Verdict::Empty(EmptyReason::EmptyTranscript)
            } else {
                Verdict::NonEmpty
            }
        }
    }
}

fn classify_json(body: &Value) -> Verdict {
    let Some(first) = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
    else {
        return Verdict::Empty(EmptyReason::NoChoices);
    };

    let has_text = match first.get("message").and_then(|m| m.get("content")) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        // Multi-part content: any non-blank text part counts.
        Some(Value::Array(parts)) => parts.iter().any(|p| {
            p.get("text")
                .and_then(|t| t.as_str())
                .is_some_and(|t| !t.trim().is_empty())
        }),
        _ => false,
    };
    if has_text {
        Verdict::NonEmpty
    } else {
        Verdict::Empty(EmptyReason::EmptyContent)
    }
}

/// Short class name for a transport failure; used in logs and fallback reasons.
pub fn transport_error_class(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_body() || err.is_decode() {
        "body_read"
    } else if err.is_request() {
        "request"
    } else {
        "upstream_transport_error"
    }
}
