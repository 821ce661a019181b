//! Incoming updates.
//!
//! An update is any inbound object that does not answer one of our requests.
//! It is kept as JSON; typed access is opt-in through [`Update::deserialize`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::InvocationError;
use crate::request::TYPE_FIELD;

/// An unsolicited object pushed by the native library.
///
/// Cheap to clone: every handler for the same update shares one allocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    raw: Arc<Value>,
}

impl Update {
    pub fn new(raw: Value) -> Self {
        Self { raw: Arc::new(raw) }
    }

    /// The update's `@type`, e.g. `"updateNewMessage"`.
    pub fn type_name(&self) -> &str {
        self.raw.get(TYPE_FIELD).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn raw(&self) -> &Value { &self.raw }

    pub fn get(&self, key: &str) -> Option<&Value> { self.raw.get(key) }

    /// Look up a nested value by JSON pointer, e.g. `"/message/chat_id"`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> { self.raw.pointer(pointer) }

    /// The chat this update concerns, if it names one.
    ///
    /// Checks a top-level `chat_id`, then `message.chat_id`.
    pub fn chat_id(&self) -> Option<i64> {
        self.raw.get("chat_id")
            .or_else(|| self.raw.pointer("/message/chat_id"))
            .and_then(Value::as_i64)
    }

    /// Text of a carried text message, if any.
    pub fn message_text(&self) -> Option<&str> {
        self.raw.pointer("/message/content/text/text").and_then(Value::as_str)
    }

    /// `true` if the carried message was sent by this account.
    pub fn is_outgoing(&self) -> bool {
        self.raw.pointer("/message/is_outgoing")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Deserialize the whole update into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, InvocationError> {
        T::deserialize(&*self.raw).map_err(Into::into)
    }
}

impl From<Value> for Update {
    fn from(v: Value) -> Self { Self::new(v) }
}
