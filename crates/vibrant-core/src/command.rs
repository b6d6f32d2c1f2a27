//! Command kinds, outbound envelopes, and agent replies.
//!
//! Every command the broker can send is one of three kinds. Each kind has a
//! fixed outbound `type` tag, a payload shape, a reply `type` tag, and a
//! reply shape. The broker only correlates; these types carry the content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::ReplyError;
use crate::ids::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Evaluate,
    Screenshot,
    Paste,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [Self::Evaluate, Self::Screenshot, Self::Paste];

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evaluate => "evaluate",
            Self::Screenshot => "screenshot",
            Self::Paste => "paste",
        }
    }

    /// `type` tag of the outbound command envelope.
    pub fn command_type(self) -> &'static str {
        match self {
            Self::Evaluate => "EVALUATE_SCRIPT",
            Self::Screenshot => "CAPTURE_ELEMENTS_SCREENSHOT",
            Self::Paste => "PASTE_DATA",
        }
    }

    /// `type` tag the agent uses when replying.
    pub fn reply_type(self) -> &'static str {
        match self {
            Self::Evaluate => "EVALUATION_RESULT",
            Self::Screenshot => "ELEMENTS_SCREENSHOT_RESULT",
            Self::Paste => "PASTE_RESULT",
        }
    }

    pub fn from_reply_type(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.reply_type() == tag)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to send to the agent. Opaque to the broker beyond its kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandPayload {
    Evaluate { script: String },
    Screenshot { selectors: Vec<String> },
    Paste { selector: String, data_url: String },
}

impl CommandPayload {
    pub fn evaluate(script: impl Into<String>) -> Self {
        Self::Evaluate {
            script: script.into(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Evaluate { .. } => CommandKind::Evaluate,
            Self::Screenshot { .. } => CommandKind::Screenshot,
            Self::Paste { .. } => CommandKind::Paste,
        }
    }

    /// The `payload` field as the agent expects it.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Evaluate { script } => Value::String(script.clone()),
            Self::Screenshot { selectors } => json!(selectors),
            Self::Paste { selector, data_url } => json!({
                "selector": selector,
                "dataUrl": data_url,
            }),
        }
    }
}

/// Command envelope broadcast to every connection of a client.
#[derive(Clone, Debug, Serialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub command_type: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    pub payload: Value,
}

impl OutboundEnvelope {
    pub fn new(request_id: RequestId, payload: &CommandPayload) -> Self {
        Self {
            command_type: payload.kind().command_type(),
            request_id,
            payload: payload.to_wire(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Result of evaluating a script in the agent's page.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalOutcome {
    /// JSON-compatible value the script produced.
    Value(Value),
    /// The script threw; carries the agent's exception description.
    Exception(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScreenshotOutcome {
    /// Selector → PNG data URL, `None` when the element was not captured.
    pub images: BTreeMap<String, Option<String>>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PasteOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// A resolved command. Remote failures live inside the variants; they are
/// results, not broker errors.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResult {
    Evaluate(EvalOutcome),
    Screenshot(ScreenshotOutcome),
    Paste(PasteOutcome),
}

impl CommandResult {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Evaluate(_) => CommandKind::Evaluate,
            Self::Screenshot(_) => CommandKind::Screenshot,
            Self::Paste(_) => CommandKind::Paste,
        }
    }

    /// Whether the agent reported a failure.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Evaluate(outcome) => matches!(outcome, EvalOutcome::Exception(_)),
            Self::Screenshot(outcome) => outcome.error.is_some(),
            Self::Paste(outcome) => !outcome.success,
        }
    }

    /// Body returned to HTTP callers in the `response` field.
    pub fn to_response_json(&self) -> Value {
        match self {
            Self::Evaluate(EvalOutcome::Value(value)) => value.clone(),
            Self::Evaluate(EvalOutcome::Exception(info)) => json!({
                "isException": true,
                "exceptionInfo": info,
            }),
            Self::Screenshot(outcome) => match &outcome.error {
                Some(error) => json!({ "imageData": outcome.images, "error": error }),
                None => json!(outcome.images),
            },
            Self::Paste(outcome) => json!({
                "success": outcome.success,
                "message": outcome.message,
                "error": outcome.error,
            }),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationBody {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    is_exception: bool,
    #[serde(default)]
    exception_info: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotBody {
    #[serde(default)]
    image_data: Option<BTreeMap<String, Option<String>>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PasteBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A reply from an agent, correlated by `request_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentReply {
    pub kind: CommandKind,
    pub request_id: RequestId,
    pub result: CommandResult,
}

impl AgentReply {
    pub fn parse(raw: &str) -> Result<Self, ReplyError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ReplyError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ReplyError> {
        let obj = value.as_object().ok_or(ReplyError::NotAnObject)?;
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ReplyError::MissingType)?;
        let request_id = obj
            .get("requestId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(RequestId::from_raw)
            .ok_or(ReplyError::MissingRequestId)?;
        let kind =
            CommandKind::from_reply_type(tag).ok_or_else(|| ReplyError::UnknownType(tag.to_owned()))?;

        let invalid = |e: serde_json::Error| ReplyError::InvalidBody {
            kind: kind.as_str(),
            reason: e.to_string(),
        };

        let result = match kind {
            CommandKind::Evaluate => {
                let body: EvaluationBody = serde_json::from_value(value).map_err(invalid)?;
                if body.is_exception {
                    CommandResult::Evaluate(EvalOutcome::Exception(describe_exception(
                        body.exception_info,
                    )))
                } else {
                    CommandResult::Evaluate(EvalOutcome::Value(body.result))
                }
            }
            CommandKind::Screenshot => {
                let body: ScreenshotBody = serde_json::from_value(value).map_err(invalid)?;
                CommandResult::Screenshot(ScreenshotOutcome {
                    images: body.image_data.unwrap_or_default(),
                    error: body.error.filter(|e| !e.is_empty()),
                })
            }
            CommandKind::Paste => {
                let body: PasteBody = serde_json::from_value(value).map_err(invalid)?;
                CommandResult::Paste(PasteOutcome {
                    success: body.success,
                    message: body.message,
                    error: body.error,
                })
            }
        };

        Ok(Self {
            kind,
            request_id,
            result,
        })
    }
}

fn describe_exception(info: Value) -> String {
    match info {
        Value::String(s) => s,
        Value::Null => "unknown exception".to_owned(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_types_map_back_to_kinds() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_reply_type(kind.reply_type()), Some(kind));
        }
        assert_eq!(CommandKind::from_reply_type("EVALUATE_SCRIPT"), None);
    }

    #[test]
    fn evaluate_envelope_wire_format() {
        let payload = CommandPayload::evaluate("1+1");
        let env = OutboundEnvelope::new(RequestId::from_raw("req_1"), &payload);
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "EVALUATE_SCRIPT");
        assert_eq!(json["requestId"], "req_1");
        assert_eq!(json["payload"], "1+1");
    }

    #[test]
    fn screenshot_payload_is_selector_array() {
        let payload = CommandPayload::Screenshot {
            selectors: vec!["#a".into(), ".b".into()],
        };
        assert_eq!(payload.kind(), CommandKind::Screenshot);
        assert_eq!(payload.to_wire(), json!(["#a", ".b"]));
    }

    #[test]
    fn paste_payload_uses_camel_case() {
        let payload = CommandPayload::Paste {
            selector: "textarea".into(),
            data_url: "data:image/png;base64,AAAA".into(),
        };
        let wire = payload.to_wire();
        assert_eq!(wire["selector"], "textarea");
        assert_eq!(wire["dataUrl"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn parse_evaluation_value() {
        let reply = AgentReply::parse(
            r#"{"type":"EVALUATION_RESULT","requestId":"req_x","result":2,"isException":false}"#,
        )
        .unwrap();
        assert_eq!(reply.kind, CommandKind::Evaluate);
        assert_eq!(reply.request_id.as_str(), "req_x");
        assert_eq!(reply.result, CommandResult::Evaluate(EvalOutcome::Value(json!(2))));
        assert!(!reply.result.is_failure());
    }

    #[test]
    fn parse_evaluation_exception() {
        let reply = AgentReply::parse(
            r#"{"type":"EVALUATION_RESULT","requestId":"r","isException":true,"exceptionInfo":"ReferenceError: x"}"#,
        )
        .unwrap();
        assert_eq!(
            reply.result,
            CommandResult::Evaluate(EvalOutcome::Exception("ReferenceError: x".into()))
        );
        assert!(reply.result.is_failure());
        assert_eq!(reply.result.to_response_json()["isException"], true);
    }

    #[test]
    fn parse_exception_without_info() {
        let reply = AgentReply::parse(
            r#"{"type":"EVALUATION_RESULT","requestId":"r","isException":true,"exceptionInfo":null}"#,
        )
        .unwrap();
        assert_eq!(
            reply.result,
            CommandResult::Evaluate(EvalOutcome::Exception("unknown exception".into()))
        );
    }

    #[test]
    fn parse_screenshot_with_missing_element() {
        let reply = AgentReply::parse(
            r##"{"type":"ELEMENTS_SCREENSHOT_RESULT","requestId":"r","imageData":{"#a":"data:image/png;base64,AA","#b":null},"error":null}"##,
        )
        .unwrap();
        let CommandResult::Screenshot(outcome) = &reply.result else {
            panic!("expected screenshot result");
        };
        assert_eq!(outcome.images.len(), 2);
        assert_eq!(outcome.images["#b"], None);
        assert!(outcome.error.is_none());
        assert_eq!(reply.result.to_response_json()["#a"], "data:image/png;base64,AA");
    }

    #[test]
    fn screenshot_error_surfaces_in_response() {
        let reply = AgentReply::parse(
            r#"{"type":"ELEMENTS_SCREENSHOT_RESULT","requestId":"r","imageData":{},"error":"capture failed"}"#,
        )
        .unwrap();
        assert!(reply.result.is_failure());
        assert_eq!(
            reply.result.to_response_json(),
            json!({"imageData": {}, "error": "capture failed"})
        );
    }

    #[test]
    fn screenshot_error_keeps_partial_images() {
        let reply = AgentReply::parse(
            r##"{"type":"ELEMENTS_SCREENSHOT_RESULT","requestId":"r","imageData":{"#a":"data:image/png;base64,AA","#b":null},"error":"Failed to capture #b"}"##,
        )
        .unwrap();
        let body = reply.result.to_response_json();
        assert_eq!(body["imageData"]["#a"], "data:image/png;base64,AA");
        assert!(body["imageData"]["#b"].is_null());
        assert_eq!(body["error"], "Failed to capture #b");
    }

    #[test]
    fn parse_paste_failure() {
        let reply = AgentReply::parse(
            r#"{"type":"PASTE_RESULT","requestId":"r","success":false,"message":null,"error":"Element not found"}"#,
        )
        .unwrap();
        assert_eq!(
            reply.result,
            CommandResult::Paste(PasteOutcome {
                success: false,
                message: None,
                error: Some("Element not found".into()),
            })
        );
    }

    #[test]
    fn missing_type_or_request_id() {
        assert_eq!(
            AgentReply::parse(r#"{"requestId":"r"}"#).unwrap_err(),
            ReplyError::MissingType
        );
        assert_eq!(
            AgentReply::parse(r#"{"type":"EVALUATION_RESULT"}"#).unwrap_err(),
            ReplyError::MissingRequestId
        );
        assert_eq!(
            AgentReply::parse(r#"{"type":"EVALUATION_RESULT","requestId":7}"#).unwrap_err(),
            ReplyError::MissingRequestId
        );
    }

    #[test]
    fn non_object_and_bad_json() {
        assert_eq!(AgentReply::parse("[1,2]").unwrap_err(), ReplyError::NotAnObject);
        assert!(matches!(
            AgentReply::parse("{not json").unwrap_err(),
            ReplyError::InvalidJson(_)
        ));
    }

    #[test]
    fn unknown_reply_type() {
        let err = AgentReply::parse(r#"{"type":"HELLO","requestId":"r"}"#).unwrap_err();
        assert_eq!(err, ReplyError::UnknownType("HELLO".into()));
    }

    #[test]
    fn wrongly_typed_body_is_invalid() {
        let err = AgentReply::parse(
            r#"{"type":"PASTE_RESULT","requestId":"r","success":"yes"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ReplyError::InvalidBody { kind: "paste", .. }));
    }
}
