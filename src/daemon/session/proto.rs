//! Session envelope and wire error payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::NodeId;

/// One frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Call {
        question: u64,
        request: Value,
    },
    Return {
        question: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<ErrorPayload>,
    },
}

impl Envelope {
    pub fn answer(question: u64, outcome: Result<Value, ErrorPayload>) -> Self {
        match outcome {
            Ok(value) => Envelope::Return {
                question,
                ok: Some(value),
                err: None,
            },
            Err(err) => Envelope::Return {
                question,
                ok: None,
                err: Some(err),
            },
        }
    }
}

/// Exchanged once in each direction before a peer session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
