//! Outgoing request objects.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::InvocationError;

/// Key naming the type of every object on the wire.
pub const TYPE_FIELD: &str = "@type";

/// A JSON object addressed to the native library.
///
/// Always carries a string `@type` naming the operation.
///
/// ```rust
/// use tdlayer_client::Request;
///
/// let req = Request::new("sendMessage")
///     .with("chat_id", 42)
///     .with("text", "hi");
/// assert_eq!(req.type_name(), "sendMessage");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    fields: Map<String, Value>,
}

impl Request {
    /// Create a request for `type_name` with no other fields.
    pub fn new(type_name: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.to_string(), Value::String(type_name.into()));
        Self { fields }
    }

    /// Set a field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Build a request from any serializable value that produces an object with `@type`.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, InvocationError> {
        Self::try_from(serde_json::to_value(value)?)
    }

    /// The operation name.
    pub fn type_name(&self) -> &str {
        self.fields.get(TYPE_FIELD).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub(crate) fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    /// The wire form.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl TryFrom<Value> for Request {
    type Error = InvocationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(InvocationError::InvalidRequest("request must be a JSON object".into()));
        };
        match fields.get(TYPE_FIELD) {
            Some(Value::String(t)) if !t.is_empty() => Ok(Self { fields }),
            _ => Err(InvocationError::InvalidRequest(format!("missing string {TYPE_FIELD}"))),
        }
    }
}

impl From<Request> for Value {
    fn from(r: Request) -> Self { Value::Object(r.fields) }
}
