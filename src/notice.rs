//! Purpose: Structured stderr notice for a failed check that will be retried.
//! Exports: `CheckFailed`.
//! Role: Lets `pollflag watch` report transient failures without ending the loop.
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: Serialized shape is `{"notice": {kind, time, cmd, channel, message, details}}`.
use serde::Serialize;
use serde_json::{Value, json};
use std::error::Error as StdError;

use crate::core::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailed {
    kind: &'static str,
    pub time: String,
    pub cmd: String,
    pub channel: String,
    pub message: String,
    details: CheckFailedDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CheckFailedDetails {
    error_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl CheckFailed {
    pub fn from_error(err: &Error, cmd: &str, channel: &str, time: String) -> Self {
        let mut causes = Vec::new();
        let mut cur = err.source();
        while let Some(source) = cur {
            causes.push(source.to_string());
            cur = source.source();
        }
        Self {
            kind: "check_failed",
            time,
            cmd: cmd.to_string(),
            channel: channel.to_string(),
            message: err.message().unwrap_or("check failed").to_string(),
            details: CheckFailedDetails {
                error_kind: format!("{:?}", err.kind()),
                hint: err.hint().map(str::to_string),
                causes,
            },
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "notice": self })
    }
}
