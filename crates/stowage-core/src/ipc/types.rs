//! Request/response types for the backend wire protocol.
//!
//! Messages are newline-delimited JSON. Both the client side (correlator and
//! reader) and any backend implementation use these types, so the parsers
//! and line builders for both directions live here.
//!
//! ```text
//! → {"request_id": 3, "type": "Save", "data": ["scores", "player1", "42"]}
//! ← {"request_id": 3, "type": "Ok"}
//! → {"request_id": 4, "type": "Load", "data": ["scores", "player1"]}
//! ← {"request_id": 4, "type": "Object", "data": "42"}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::codec::{self, JsonCodec, ValueCodec};
use crate::error::PersistError;

/// The three request shapes the backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Save,
    Load,
    Flush,
}

/// A request's kind together with its operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Save {
        group: String,
        key: String,
        value: String,
    },
    Load {
        group: String,
        key: String,
    },
    Flush,
}

impl Operation {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Save { .. } => RequestKind::Save,
            Self::Load { .. } => RequestKind::Load,
            Self::Flush => RequestKind::Flush,
        }
    }
}

/// An identified request. Immutable once allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    id: u64,
    operation: Operation,
}

impl Request {
    pub(crate) fn new(id: u64, operation: Operation) -> Self {
        Self { id, operation }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.operation.kind()
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Render the request as one wire line, without the trailing newline.
    ///
    /// The envelope is built by hand for the three fixed shapes. Operands go
    /// in as JSON string literals, so an already-serialized payload nests as
    /// a string and is never re-parsed.
    pub fn to_line(&self) -> String {
        let id = self.id;
        match &self.operation {
            Operation::Save { group, key, value } => format!(
                r#"{{"request_id": {id}, "type": "Save", "data": [{}, {}, {}]}}"#,
                string_literal(group),
                string_literal(key),
                string_literal(value),
            ),
            Operation::Load { group, key } => format!(
                r#"{{"request_id": {id}, "type": "Load", "data": [{}, {}]}}"#,
                string_literal(group),
                string_literal(key),
            ),
            Operation::Flush => format!(r#"{{"request_id": {id}, "type": "Flush"}}"#),
        }
    }

    /// Parse a request line, as a backend would.
    pub fn parse(line: &str) -> Result<Self, PersistError> {
        let wire: WireRequest = serde_json::from_str(line)
            .map_err(|e| PersistError::Protocol(format!("malformed request: {e}")))?;
        let mut data = wire.data.unwrap_or_default().into_iter();
        let mut operand = |name: &str| {
            data.next().ok_or_else(|| {
                PersistError::Protocol(format!(
                    "{:?} request {} is missing its {name}",
                    wire.kind, wire.request_id
                ))
            })
        };
        let operation = match wire.kind {
            RequestKind::Save => Operation::Save {
                group: operand("group")?,
                key: operand("key")?,
                value: operand("value")?,
            },
            RequestKind::Load => Operation::Load {
                group: operand("group")?,
                key: operand("key")?,
            },
            RequestKind::Flush => Operation::Flush,
        };
        Ok(Self::new(wire.request_id, operation))
    }
}

fn string_literal(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

#[derive(Deserialize)]
struct WireRequest {
    request_id: u64,
    #[serde(rename = "type")]
    kind: RequestKind,
    #[serde(default)]
    data: Option<Vec<String>>,
}

/// Response tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Ok,
    Err,
    Object,
}

/// An `Object` response's value.
///
/// The tag decides how the value is decoded; nothing is inferred from the
/// payload's leading character.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The wire carried a string: a nested document produced by a codec.
    Encoded(String),
    /// The wire carried structured JSON, decoded directly.
    Structured(Value),
}

impl Payload {
    fn from_wire(data: Value) -> Self {
        match data {
            Value::String(s) => Self::Encoded(s),
            other => Self::Structured(other),
        }
    }

    fn to_wire(&self) -> Value {
        match self {
            Self::Encoded(s) => Value::String(s.clone()),
            Self::Structured(v) => v.clone(),
        }
    }

    /// The payload as a string: encoded payloads verbatim, structured ones
    /// rendered as compact JSON.
    pub fn to_raw(&self) -> String {
        match self {
            Self::Encoded(s) => s.clone(),
            Self::Structured(v) => v.to_string(),
        }
    }

    /// Decode into `T` with the given codec.
    pub fn decode<T: DeserializeOwned>(&self, codec: &dyn ValueCodec) -> Result<T, PersistError> {
        match self {
            Self::Encoded(s) => codec::decode_value(codec, s),
            Self::Structured(v) => Ok(serde_json::from_value(v.clone())?),
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Ok,
    Err(String),
    Object(Payload),
}

/// A response, remote or locally produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    request_id: Option<u64>,
    body: ResponseBody,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    request_id: u64,
    #[serde(rename = "type")]
    kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Response {
    /// A locally produced success with no payload.
    pub fn ok() -> Self {
        Self {
            request_id: None,
            body: ResponseBody::Ok,
        }
    }

    /// A locally produced failure.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            request_id: None,
            body: ResponseBody::Err(message.into()),
        }
    }

    /// A locally produced value.
    pub fn object(payload: Payload) -> Self {
        Self {
            request_id: None,
            body: ResponseBody::Object(payload),
        }
    }

    /// Attach the id of the request this answers.
    pub fn answering(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Parse one wire line.
    pub fn parse(line: &str) -> Result<Self, PersistError> {
        let wire: WireResponse = serde_json::from_str(line)
            .map_err(|e| PersistError::Protocol(format!("malformed response: {e}")))?;
        let body = match (wire.kind, wire.data) {
            (ResponseKind::Ok, _) => ResponseBody::Ok,
            (ResponseKind::Err, Some(Value::String(message))) => ResponseBody::Err(message),
            (ResponseKind::Err, Some(other)) => ResponseBody::Err(other.to_string()),
            (ResponseKind::Err, None) => ResponseBody::Err(String::new()),
            (ResponseKind::Object, Some(data)) => ResponseBody::Object(Payload::from_wire(data)),
            (ResponseKind::Object, None) => {
                return Err(PersistError::Protocol(format!(
                    "Object response {} carries no data",
                    wire.request_id
                )));
            }
        };
        Ok(Self {
            request_id: Some(wire.request_id),
            body,
        })
    }

    /// Render as one wire line, without the trailing newline. Local
    /// responses carry id 0.
    pub fn to_line(&self) -> String {
        let (kind, data) = match &self.body {
            ResponseBody::Ok => (ResponseKind::Ok, None),
            ResponseBody::Err(message) => (ResponseKind::Err, Some(Value::String(message.clone()))),
            ResponseBody::Object(payload) => (ResponseKind::Object, Some(payload.to_wire())),
        };
        let wire = WireResponse {
            request_id: self.request_id.unwrap_or_default(),
            kind,
            data,
        };
        // Value/String/u64 fields cannot fail to serialize.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Id of the request this answers; `None` for local responses.
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    pub fn kind(&self) -> ResponseKind {
        match self.body {
            ResponseBody::Ok => ResponseKind::Ok,
            ResponseBody::Err(_) => ResponseKind::Err,
            ResponseBody::Object(_) => ResponseKind::Object,
        }
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.body, ResponseBody::Ok)
    }

    pub fn is_err(&self) -> bool {
        matches!(self.body, ResponseBody::Err(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self.body, ResponseBody::Object(_))
    }

    /// The error message of an `Err` response.
    pub fn error(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Err(message) => Some(message),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            ResponseBody::Object(payload) => Some(payload),
            _ => None,
        }
    }

    /// Decode the payload into `T` with the default JSON codec.
    pub fn try_as_type<T: DeserializeOwned>(&self) -> Result<T, PersistError> {
        self.try_as_type_with(&JsonCodec)
    }

    /// Decode the payload into `T` with an explicit codec.
    pub fn try_as_type_with<T: DeserializeOwned>(
        &self,
        codec: &dyn ValueCodec,
    ) -> Result<T, PersistError> {
        match &self.body {
            ResponseBody::Object(payload) => payload.decode(codec),
            ResponseBody::Err(message) => Err(PersistError::Remote(message.clone())),
            ResponseBody::Ok => Err(PersistError::Protocol(
                "Ok response carries no value".to_string(),
            )),
        }
    }

    /// Decode the payload into `T`, or `None` for `Ok`, `Err` and
    /// undecodable payloads. Failures are logged.
    pub fn as_type<T: DeserializeOwned>(&self) -> Option<T> {
        self.as_type_with(&JsonCodec)
    }

    pub fn as_type_with<T: DeserializeOwned>(&self, codec: &dyn ValueCodec) -> Option<T> {
        match self.try_as_type_with(codec) {
            Ok(value) => Some(value),
            Err(PersistError::Protocol(_)) => None,
            Err(PersistError::Remote(message)) => {
                warn!(request_id = ?self.request_id, error = %message, "Tried to get value from error response");
                None
            }
            Err(e) => {
                warn!(request_id = ?self.request_id, error = %e, "Failed to decode response payload");
                None
            }
        }
    }
}
