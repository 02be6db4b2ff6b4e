//! Declared and dynamically registered capabilities for one side of a session.

use std::fmt::{self, Debug, Formatter};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::Error;

/// Governs how strictly dynamic registration is checked against the declared capabilities.
///
/// Grounded in the same builder-config idiom the rest of this crate's ambient configuration uses
/// (`ReconnectPolicy`, `concurrency_level`): a plain enum set once at session construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CapabilityMode {
    /// A `client/registerCapability` for a method whose `dynamicRegistration` capability was never
    /// declared is rejected with `InvalidParams`.
    Strict,
    /// Any method may be dynamically registered regardless of what was declared.
    Compat,
}

/// One dynamically registered capability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    /// The id the peer chose for this registration; must be unique among currently active ones.
    pub id: String,
    /// The method this registration applies to.
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Method-specific registration options.
    pub register_options: Option<Value>,
}

/// Identifies one previously registered capability to remove.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Unregistration {
    /// The id passed to the matching [`Registration`].
    pub id: String,
    /// The method that registration applied to.
    pub method: String,
}

/// Params of an inbound `client/registerCapability` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationParams {
    pub registrations: Vec<Registration>,
}

/// Params of an inbound `client/unregisterCapability` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnregistrationParams {
    pub unregisterations: Vec<Unregistration>,
}

/// Tracks the capabilities declared at initialization time plus any registered or unregistered
/// dynamically afterward.
///
/// No direct teacher precedent; `tower-lsp`'s capability handling was baked into generated
/// `initialize` request/response types by the macro. This is a fresh `DashMap`-backed table in the
/// same style as [`crate::registry::HandlerRegistry`], storing registrations by id for O(1)
/// unregister lookups.
pub struct CapabilityState {
    declared: Mutex<Value>,
    dynamic: DashMap<String, Registration>,
    mode: CapabilityMode,
}

impl CapabilityState {
    /// Creates a capability table from the capabilities object declared during initialization.
    pub fn new(declared: Value, mode: CapabilityMode) -> Self {
        CapabilityState {
            declared: Mutex::new(declared),
            dynamic: DashMap::new(),
            mode,
        }
    }

    /// The capabilities object declared at initialization time, unmodified.
    pub fn declared(&self) -> Value {
        self.declared.lock().unwrap().clone()
    }

    /// Replaces the declared capabilities object wholesale, leaving dynamic registrations as-is.
    pub fn set_declared(&self, declared: Value) {
        *self.declared.lock().unwrap() = declared;
    }

    /// Returns `true` if `path` (dot-separated, e.g. `"textDocument.hover.dynamicRegistration"`)
    /// is present and truthy within the declared capabilities object.
    pub fn declares(&self, path: &str) -> bool {
        let declared = self.declared.lock().unwrap();
        let mut current = &*declared;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(value) => current = value,
                None => return false,
            }
        }
        current.as_bool().unwrap_or(false)
    }

    /// Registers a dynamic capability.
    ///
    /// Fails with `InvalidParams` if `id` is already registered, or if [`CapabilityMode::Strict`]
    /// is in effect and `method`'s namespace never declared `dynamicRegistration` support.
    pub fn register(&self, registration: Registration) -> Result<(), Error> {
        if self.dynamic.contains_key(&registration.id) {
            return Err(Error::invalid_params(format!(
                "registration id already in use: {}",
                registration.id
            )));
        }

        if self.mode == CapabilityMode::Strict {
            let declared_path = format!("{}.dynamicRegistration", namespace_of(&registration.method));
            if !self.declares(&declared_path) {
                return Err(Error::invalid_params(format!(
                    "Dynamic registration not declared for method: {}",
                    registration.method
                )));
            }
        }

        self.dynamic.insert(registration.id.clone(), registration);
        Ok(())
    }

    /// Unregisters a dynamic capability by id.
    ///
    /// Fails with `InvalidParams` if `id` was never registered, or was already unregistered.
    pub fn unregister(&self, id: &str) -> Result<(), Error> {
        match self.dynamic.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::invalid_params(format!("unknown registration id: {id}"))),
        }
    }

    /// Returns `true` if `method` has an active dynamic registration.
    pub fn is_registered(&self, method: &str) -> bool {
        self.dynamic.iter().any(|e| e.value().method == method)
    }

    /// Returns the number of currently active dynamic registrations.
    pub fn registration_count(&self) -> usize {
        self.dynamic.len()
    }
}

impl Debug for CapabilityState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CapabilityState")
            .field("mode", &self.mode)
            .field("dynamic", &self.dynamic.len())
            .finish()
    }
}

fn namespace_of(method: &str) -> &str {
    method.split('/').next().unwrap_or(method)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registration(id: &str, method: &str) -> Registration {
        Registration {
            id: id.into(),
            method: method.into(),
            register_options: None,
        }
    }

    #[test]
    fn declares_walks_nested_path() {
        let state = CapabilityState::new(
            json!({ "textDocument": { "hover": { "dynamicRegistration": true } } }),
            CapabilityMode::Compat,
        );
        assert!(state.declares("textDocument.hover.dynamicRegistration"));
        assert!(!state.declares("textDocument.definition.dynamicRegistration"));
    }

    #[test]
    fn compat_mode_allows_undeclared_registration() {
        let state = CapabilityState::new(json!({}), CapabilityMode::Compat);
        assert!(state.register(registration("1", "textDocument/hover")).is_ok());
    }

    #[test]
    fn strict_mode_rejects_undeclared_registration() {
        let state = CapabilityState::new(json!({}), CapabilityMode::Strict);
        let err = state.register(registration("1", "textDocument/hover")).unwrap_err();
        assert_eq!(err.code, crate::jsonrpc::ErrorCode::InvalidParams);
        assert!(err.message.contains("Dynamic registration not declared"));
    }

    #[test]
    fn strict_mode_allows_declared_registration() {
        let state = CapabilityState::new(
            json!({ "textDocument": { "dynamicRegistration": true } }),
            CapabilityMode::Strict,
        );
        assert!(state.register(registration("1", "textDocument/hover")).is_ok());
    }

    #[test]
    fn duplicate_registration_id_is_rejected() {
        let state = CapabilityState::new(json!({}), CapabilityMode::Compat);
        state.register(registration("1", "textDocument/hover")).unwrap();
        let err = state.register(registration("1", "textDocument/definition")).unwrap_err();
        assert_eq!(err.code, crate::jsonrpc::ErrorCode::InvalidParams);
    }

    #[test]
    fn unregister_unknown_id_is_rejected() {
        let state = CapabilityState::new(json!({}), CapabilityMode::Compat);
        assert!(state.unregister("missing").is_err());
    }

    #[test]
    fn unregister_removes_registration() {
        let state = CapabilityState::new(json!({}), CapabilityMode::Compat);
        state.register(registration("1", "textDocument/hover")).unwrap();
        assert!(state.is_registered("textDocument/hover"));

        state.unregister("1").unwrap();
        assert!(!state.is_registered("textDocument/hover"));
        assert!(state.unregister("1").is_err());
    }
}
