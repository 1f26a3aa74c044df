//! The JSON-RPC 2.0 wire format, as far as a client needs it.
//!
//! Only the client half of the protocol is modeled here: requests go out, responses come back.
//! Either can travel alone or as part of a batch, which is what [`Payload`] represents.
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The standard error codes and the `"2.0"` version marker come from `jsonrpsee`.
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// Request ID, used to correlate a response with the call that caused it.
///
/// The scheduler only ever generates numbers or strings.  `null` is what servers put in the
/// response to a request they couldn't even parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Null,
    Number(u64),
    Str(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Null => f.write_str("null"),
            Id::Number(n) => write!(f, "{n}"),
            Id::Str(s) => f.write_str(s),
        }
    }
}

/// Name of a remote method.
///
/// Cheap to clone since every pending call, log line, and error carries one around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Arc<str>);

impl Method {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for Method {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&Method> for Method {
    fn from(value: &Method) -> Self {
        value.clone()
    }
}

impl PartialEq<str> for Method {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Method {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// A method call, as sent to the server.
///
/// Calls made through the scheduler always have an ID; this client never sends notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub jsonrpc: TwoPointZero,
    pub id: Id,
    pub method: Method,
    /// Left out of the JSON entirely when `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    pub fn new(id: Id, method: impl Into<Method>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// The server's answer to one [`Request`], carrying either a result or an error object.
///
/// Only `id` and the payload matter for correlation.  Servers that leave out the `"jsonrpc"`
/// marker are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<TwoPointZero>,
    #[serde(flatten)]
    pub payload: ResponsePayload,
    pub id: Id,
}

impl Response {
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self {
            jsonrpc: Some(TwoPointZero),
            payload: ResponsePayload::Success(SuccessResponse { result }),
            id,
        }
    }

    pub fn error(
        id: Id,
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self {
            jsonrpc: Some(TwoPointZero),
            payload: ResponsePayload::Error(ErrorResponse {
                error: ErrorDetails::new(code, message, data),
            }),
            id,
        }
    }
}

/// Either `{"result": ...}` or `{"error": {...}}`.
///
/// Untagged, so serde tells them apart by which of the two fields is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Error(ErrorResponse),
    Success(SuccessResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// The error object of a failed call.  This is what error mappers get to look at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }
}

/// Either a single JSON-RPC object or a batch of them.
///
/// A batch is a JSON array; anything else is a single object.  This is what flows through a
/// [`crate::Transport`] in both directions: `Payload<Request>` out, `Payload<Response>` back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload<T> {
    /// Several objects sent together in one JSON array
    Batch(Vec<T>),
    /// A lone object
    Single(T),
}

impl<T> Payload<T> {
    /// Number of objects in this payload
    pub fn len(&self) -> usize {
        match self {
            Payload::Batch(items) => items.len(),
            Payload::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Payload::Batch(_))
    }

    /// Flatten into a list regardless of how it was framed on the wire.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Payload::Batch(items) => items,
            Payload::Single(item) => vec![item],
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Payload::Batch(items) => items.iter(),
            Payload::Single(item) => std::slice::from_ref(item).iter(),
        }
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        match self {
            Payload::Batch(items) => items.iter_mut(),
            Payload::Single(item) => std::slice::from_mut(item).iter_mut(),
        }
    }
}

impl<T> IntoIterator for Payload<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_vec().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    #[test]
    fn request_matches_wire_format() {
        let known_good_json = r#"{"jsonrpc":"2.0","method":"exampleRPC.test","params":{"arg1":"x"},"id":1}"#;
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let request = Request::new(Id::Number(1), "exampleRPC.test", json!({"arg1": "x"}));
        let our_value = serde_json::to_value(&request).unwrap();

        assert_eq!(known_good_value, our_value);
    }

    #[test]
    fn request_without_params_omits_field() {
        let request = Request::new(Id::Number(7), "ping", None);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}));
    }

    #[test]
    fn batch_payload_is_a_json_array() {
        let payload = Payload::Batch(vec![
            Request::new(Id::Number(1), "a", json!([1])),
            Request::new(Id::Number(2), "b", json!([2])),
        ]);

        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.is_array());
        assert_eq!(value[1]["method"], json!("b"));
    }

    #[test]
    fn single_payload_is_a_bare_object() {
        let payload = Payload::Single(Request::new(Id::Number(1), "a", None));
        let value = serde_json::to_value(&payload).unwrap();

        assert!(value.is_object());
        assert_eq!(payload.len(), 1);
        assert!(!payload.is_batch());
    }

    #[test]
    fn response_batch_with_mixed_payloads() {
        let json = concat!(
            r#"[{"jsonrpc":"2.0","result":"b","id":2},"#,
            r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":1}]"#
        );

        let payload: Payload<Response> = serde_json::from_str(json).unwrap();
        assert!(payload.is_batch());

        let responses = payload.into_vec();
        assert_eq!(responses[0].id, Id::Number(2));
        assert_matches!(&responses[0].payload, ResponsePayload::Success(SuccessResponse { result }) if result == &json!("b"));
        assert_eq!(responses[1].id, Id::Number(1));
        assert_matches!(
            &responses[1].payload,
            ResponsePayload::Error(ErrorResponse { error: ErrorDetails { code, .. } }) if *code == ErrorCode::MethodNotFound
        );
    }

    #[test]
    fn single_response_with_custom_error_code() {
        let json = r#"{"jsonrpc":"2.0","error":{"code":-32001,"message":"nope","data":{"why":"because"}},"id":"abc"}"#;

        let payload: Payload<Response> = serde_json::from_str(json).unwrap();
        let response = assert_matches!(payload, Payload::Single(response) => response);

        assert_eq!(response.id, Id::Str("abc".into()));
        let error = assert_matches!(response.payload, ResponsePayload::Error(ErrorResponse { error }) => error);
        assert_eq!(error.code.code(), -32001);
        assert_eq!(error.data, Some(json!({"why": "because"})));
    }

    #[test]
    fn null_result_is_still_a_success() {
        let json = r#"{"jsonrpc":"2.0","result":null,"id":3}"#;
        let response: Response = serde_json::from_str(json).unwrap();

        assert_matches!(response.payload, ResponsePayload::Success(SuccessResponse { result: Value::Null }));
    }

    #[test]
    fn version_marker_is_optional_in_responses() {
        let payload: Payload<Response> = serde_json::from_str(r#"{"id":1,"result":42}"#).unwrap();
        let response = assert_matches!(payload, Payload::Single(response) => response);
        assert_eq!(response.id, Id::Number(1));
        assert!(response.jsonrpc.is_none());
        assert_matches!(response.payload, ResponsePayload::Success(SuccessResponse { result }) if result == json!(42));

        let payload: Payload<Response> =
            serde_json::from_str(r#"[{"id":1,"result":42},{"id":2,"error":{"code":-32000,"message":"x"}}]"#)
                .unwrap();
        let responses = assert_matches!(payload, Payload::Batch(responses) => responses);
        assert_eq!(responses.len(), 2);
        assert_matches!(&responses[1].payload, ResponsePayload::Error(_));

        // What we construct ourselves always carries the marker
        let value = serde_json::to_value(Response::success(Id::Number(3), json!(null))).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 3, "result": null}));
    }

    #[test]
    fn id_display() {
        assert_eq!(Id::Number(42).to_string(), "42");
        assert_eq!(Id::Str("abc".into()).to_string(), "abc");
        assert_eq!(Id::Null.to_string(), "null");
    }

    #[test]
    fn method_compares_with_str() {
        let method = Method::from("exampleRPC.test");
        assert_eq!(method, "exampleRPC.test");
        assert_eq!(serde_json::to_value(&method).unwrap(), json!("exampleRPC.test"));
    }
}
