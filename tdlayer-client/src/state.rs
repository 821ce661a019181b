//! Session state folded from updates.
//!
//! The native library announces option values (`updateOption`) and login
//! progress (`updateAuthorizationState`) as ordinary updates; the dispatcher
//! records the latest of each here before handlers see them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::request::TYPE_FIELD;
use crate::update::Update;

#[derive(Default)]
struct Inner {
    options:             HashMap<String, Value>,
    authorization_state: Option<String>,
}

#[derive(Default)]
pub(crate) struct SessionState {
    inner: RwLock<Inner>,
}

impl SessionState {
    pub(crate) fn observe(&self, update: &Update) {
        match update.type_name() {
            "updateOption" => {
                let Some(name) = update.get("name").and_then(Value::as_str) else { return };
                let value = update.get("value");
                let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
                match value {
                    None => { inner.options.remove(name); }
                    Some(v) if v.get(TYPE_FIELD).and_then(Value::as_str) == Some("optionValueEmpty") => {
                        inner.options.remove(name);
                    }
                    // optionValue* objects wrap the scalar in `value`.
                    Some(v) => {
                        let scalar = v.get("value").cloned().unwrap_or_else(|| v.clone());
                        inner.options.insert(name.to_string(), scalar);
                    }
                }
            }
            "updateAuthorizationState" => {
                let state = update.pointer("/authorization_state/@type").and_then(Value::as_str);
                if let Some(state) = state {
                    tracing::info!("[tdlayer] authorization state: {state}");
                    self.inner.write().unwrap_or_else(PoisonError::into_inner)
                        .authorization_state = Some(state.to_string());
                }
            }
            _ => {}
        }
    }

    pub(crate) fn option(&self, name: &str) -> Option<Value> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).options.get(name).cloned()
    }

    pub(crate) fn authorization_state(&self) -> Option<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).authorization_state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_are_unwrapped_and_cleared() {
        let s = SessionState::default();
        s.observe(&Update::new(json!({
            "@type": "updateOption", "name": "version",
            "value": {"@type": "optionValueString", "value": "1.8.0"},
        })));
        assert_eq!(s.option("version"), Some(json!("1.8.0")));
        s.observe(&Update::new(json!({
            "@type": "updateOption", "name": "version",
            "value": {"@type": "optionValueEmpty"},
        })));
        assert_eq!(s.option("version"), None);
    }

    #[test]
    fn authorization_state_tracks_latest() {
        let s = SessionState::default();
        assert_eq!(s.authorization_state(), None);
        s.observe(&Update::new(json!({
            "@type": "updateAuthorizationState",
            "authorization_state": {"@type": "authorizationStateReady"},
        })));
        assert_eq!(s.authorization_state().as_deref(), Some("authorizationStateReady"));
    }
}
