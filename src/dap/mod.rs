//! Client-facing DAP plumbing: message envelopes, the stateless protocol
//! factory, framing codecs and transports.

pub mod binary;
pub mod codec;
pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::EnumString;

/// DAP request envelope.
#[derive(Debug, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// DAP response envelope.
///
/// Note: the DAP specification allows responses with no `body` field at
/// all. Using a `serde_json::Value` keeps the envelope stable and avoids
/// type inference issues around `None` bodies.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Stateless envelope factory. `seq` is left at zero; the session assigns
/// it just before the message is written.
pub struct ProtocolHandler;

impl ProtocolHandler {
    pub fn create_response(
        request: &DapRequest,
        success: bool,
        body: Option<Value>,
        message: Option<String>,
    ) -> DapResponse {
        DapResponse {
            seq: 0,
            r#type: "response",
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        }
    }

    pub fn create_event(name: impl Into<String>, body: Option<Value>) -> DapEvent {
        DapEvent { seq: 0, r#type: "event", event: name.into(), body }
    }
}

/// The closed set of DAP commands the adapter implements. Unknown names
/// fail `from_str` and are answered with an "Unsupported command" error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum CommandKind {
    #[strum(serialize = "initialize")]
    Initialize,
    #[strum(serialize = "launch")]
    Launch,
    #[strum(serialize = "attach")]
    Attach,
    #[strum(serialize = "configurationDone")]
    ConfigurationDone,
    #[strum(serialize = "setBreakpoints")]
    SetBreakpoints,
    #[strum(serialize = "setFunctionBreakpoints")]
    SetFunctionBreakpoints,
    #[strum(serialize = "setExceptionBreakpoints")]
    SetExceptionBreakpoints,
    #[strum(serialize = "setDataBreakpoints")]
    SetDataBreakpoints,
    #[strum(serialize = "dataBreakpointInfo")]
    DataBreakpointInfo,
    #[strum(serialize = "continue")]
    Continue,
    #[strum(serialize = "next")]
    Next,
    #[strum(serialize = "stepIn")]
    StepIn,
    #[strum(serialize = "stepOut")]
    StepOut,
    #[strum(serialize = "pause")]
    Pause,
    #[strum(serialize = "threads")]
    Threads,
    #[strum(serialize = "stackTrace")]
    StackTrace,
    #[strum(serialize = "scopes")]
    Scopes,
    #[strum(serialize = "variables")]
    Variables,
    #[strum(serialize = "setVariable")]
    SetVariable,
    #[strum(serialize = "evaluate")]
    Evaluate,
    #[strum(serialize = "exceptionInfo")]
    ExceptionInfo,
    #[strum(serialize = "source")]
    Source,
    #[strum(serialize = "loadedSources")]
    LoadedSources,
    #[strum(serialize = "modules")]
    Modules,
    #[strum(serialize = "terminate")]
    Terminate,
    #[strum(serialize = "disconnect")]
    Disconnect,
    #[strum(serialize = "restart")]
    Restart,
}
