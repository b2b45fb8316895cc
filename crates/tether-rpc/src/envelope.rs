use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::ErrorCode;

/// A raw message body as it travels over a transport.
///
/// Either a single envelope or an array of envelopes (batch).
pub type Message = Value;

/// Caller-chosen request identifier
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

/// Envelope method
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString,
)]
pub enum Method {
    #[serde(rename = "query")]
    #[strum(serialize = "query")]
    Query,
    #[serde(rename = "mutation")]
    #[strum(serialize = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    #[strum(serialize = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    #[strum(serialize = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    /// The procedure kind this method invokes, `None` for `subscription.stop`.
    pub fn kind(self) -> Option<ProcedureKind> {
        match self {
            Self::Query => Some(ProcedureKind::Query),
            Self::Mutation => Some(ProcedureKind::Mutation),
            Self::Subscription => Some(ProcedureKind::Subscription),
            Self::SubscriptionStop => None,
        }
    }
}

/// Kind of a registered procedure
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl From<ProcedureKind> for Method {
    fn from(kind: ProcedureKind) -> Self {
        match kind {
            ProcedureKind::Query => Self::Query,
            ProcedureKind::Mutation => Self::Mutation,
            ProcedureKind::Subscription => Self::Subscription,
        }
    }
}

/// One RPC call or batch member
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// `None` only on malformed input; the server answers with `BAD_REQUEST`.
    pub id: Option<RequestId>,
    /// Optional protocol version tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(id: RequestId, kind: ProcedureKind, path: impl Into<String>, input: Value) -> Self {
        Self {
            id: Some(id),
            jsonrpc: None,
            method: kind.into(),
            path: Some(path.into()),
            input: Some(input),
        }
    }

    /// Create a `subscription.stop` envelope for `id`
    pub fn stop(id: RequestId) -> Self {
        Self {
            id: Some(id),
            jsonrpc: None,
            method: Method::SubscriptionStop,
            path: None,
            input: None,
        }
    }
}

/// Result payload of a successful response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    Data {
        #[serde(default)]
        data: Value,
    },
    Started,
    Stopped,
}

/// Error attached to a failed response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Result(ResultPayload),
    Error(ErrorShape),
}

/// One RPC result
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn data(id: RequestId, data: Value) -> Self {
        Self::result(id, ResultPayload::Data { data })
    }

    pub fn started(id: RequestId) -> Self {
        Self::result(id, ResultPayload::Started)
    }

    pub fn stopped(id: RequestId) -> Self {
        Self::result(id, ResultPayload::Stopped)
    }

    pub fn error(id: Option<RequestId>, error: ErrorShape) -> Self {
        Self {
            id,
            jsonrpc: None,
            body: ResponseBody::Error(error),
        }
    }

    fn result(id: RequestId, payload: ResultPayload) -> Self {
        Self {
            id: Some(id),
            jsonrpc: None,
            body: ResponseBody::Result(payload),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.body, ResponseBody::Result(ResultPayload::Stopped))
    }

    /// The data value, if this is a `data` result
    pub fn into_data(self) -> Option<Value> {
        match self.body {
            ResponseBody::Result(ResultPayload::Data { data }) => Some(data),
            _ => None,
        }
    }
}

/// Server-initiated notification, e.g. `{"id": null, "method": "reconnect"}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: Option<RequestId>,
    pub method: String,
}

impl Notification {
    pub const RECONNECT: &'static str = "reconnect";

    pub fn reconnect() -> Self {
        Self {
            id: None,
            method: Self::RECONNECT.to_owned(),
        }
    }
}

/// Anything a client may receive
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub(crate) enum ClientIncoming {
    Notification(Notification),
    Response(ResponseEnvelope),
}

/// Split a message body into its batch members
pub fn batch_members(message: Message) -> Vec<Value> {
    match message {
        Value::Array(members) => members,
        single => vec![single],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = RequestEnvelope::new(1.into(), ProcedureKind::Query, "echo", json!("hi"));
        let value = serde_json::to_value(&request).expect("Failed to serialize");

        assert_eq!(
            value,
            json!({"id": 1, "method": "query", "path": "echo", "input": "hi"})
        );
    }

    #[test]
    fn test_stop_has_no_params() {
        let value =
            serde_json::to_value(RequestEnvelope::stop("abc".into())).expect("Failed to serialize");
        assert_eq!(value, json!({"id": "abc", "method": "subscription.stop"}));
    }

    #[test]
    fn test_response_wire_format() {
        let data = ResponseEnvelope::data(1.into(), json!("hi"));
        assert_eq!(
            serde_json::to_value(&data).expect("Failed to serialize"),
            json!({"id": 1, "result": {"type": "data", "data": "hi"}})
        );

        let started = ResponseEnvelope::started("s".into());
        assert_eq!(
            serde_json::to_value(&started).expect("Failed to serialize"),
            json!({"id": "s", "result": {"type": "started"}})
        );
    }

    #[test]
    fn test_error_response_parses() {
        let value = json!({
            "id": null,
            "error": {"code": "PARSE_ERROR", "message": "bad envelope"}
        });
        let response: ResponseEnvelope =
            serde_json::from_value(value).expect("Failed to deserialize");

        assert!(response.id.is_none());
        match response.body {
            ResponseBody::Error(shape) => assert_eq!(shape.code, ErrorCode::ParseError),
            ResponseBody::Result(_) => panic!("Expected error body"),
        }
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let value = json!({"id": 1, "method": "call", "path": "x"});
        assert!(serde_json::from_value::<RequestEnvelope>(value).is_err());
    }

    #[test]
    fn test_client_incoming_distinguishes_notification() {
        let incoming: ClientIncoming =
            serde_json::from_value(json!({"id": null, "method": "reconnect"}))
                .expect("Failed to deserialize");
        assert!(matches!(incoming, ClientIncoming::Notification(n) if n.method == "reconnect"));

        let incoming: ClientIncoming =
            serde_json::from_value(json!({"id": 3, "result": {"type": "stopped"}}))
                .expect("Failed to deserialize");
        assert!(matches!(incoming, ClientIncoming::Response(r) if r.is_stopped()));
    }

    #[test]
    fn test_batch_members() {
        assert_eq!(batch_members(json!([1, 2])).len(), 2);
        assert_eq!(batch_members(json!({"id": 1})).len(), 1);
    }
}
