//! Request routing.
//!
//! An incoming JSON object must carry a string `request` field naming a
//! handler. Registration is explicit and happens before the dispatcher is
//! shared with connection tasks, so lookup needs no locking.

use crate::error::{constants, ProtocolError, Result};
use crate::server::connection::ConnectionCtl;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;

type HandlerFn = dyn Fn(&mut ConnectionCtl, &Value) -> Result<Value> + Send + Sync + 'static;

/// Request-name → handler table with zero-copy keys for static names.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<Cow<'static, str>, Box<HandlerFn>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Builder-style so a fully populated dispatcher
    /// is constructed in one expression and then frozen.
    pub fn register<F>(mut self, name: impl Into<Cow<'static, str>>, handler: F) -> Self
    where
        F: Fn(&mut ConnectionCtl, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Route one request to its handler.
    ///
    /// # Errors
    /// - [`ProtocolError::MalformedRequest`] if the `request` field is
    ///   absent or not a string
    /// - [`ProtocolError::UnsupportedRequest`] if no handler is registered
    ///   under that name
    /// - whatever the handler itself returns
    pub fn dispatch(&self, ctl: &mut ConnectionCtl, request: &Value) -> Result<Value> {
        let name = match request.get("request") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(ProtocolError::MalformedRequest(
                    constants::ERR_MISSING_REQUEST_FIELD.into(),
                ))
            }
        };
        let handler = self
            .handlers
            .get(name.as_str())
            .ok_or_else(|| ProtocolError::UnsupportedRequest(name.clone()))?;
        handler(ctl, request)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ctl() -> ConnectionCtl {
        let mut ctl = ConnectionCtl::new();
        ctl.authorize("test");
        ctl
    }

    #[test]
    fn routes_to_registered_handler() {
        let dispatcher = Dispatcher::new()
            .register("ping", |_ctl, _req| Ok(json!({"pong": true})))
            .register("whoami", |ctl, _req| {
                Ok(json!({"user": ctl.user().unwrap_or("")}))
            });

        let mut ctl = test_ctl();
        let response = dispatcher.dispatch(&mut ctl, &json!({"request": "ping"})).unwrap();
        assert_eq!(response["pong"], true);

        let response = dispatcher
            .dispatch(&mut ctl, &json!({"request": "whoami"}))
            .unwrap();
        assert_eq!(response["user"], "test");
    }

    #[test]
    fn unknown_request_name() {
        let dispatcher = Dispatcher::new().register("ping", |_, _| Ok(json!({})));
        let mut ctl = test_ctl();
        let err = dispatcher
            .dispatch(&mut ctl, &json!({"request": "nope"}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedRequest(name) if name == "nope"));
    }

    #[test]
    fn missing_or_nonstring_request_field() {
        let dispatcher = Dispatcher::new().register("ping", |_, _| Ok(json!({})));
        let mut ctl = test_ctl();

        let err = dispatcher.dispatch(&mut ctl, &json!({"x": 1})).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedRequest(_)));

        let err = dispatcher
            .dispatch(&mut ctl, &json!({"request": 42}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedRequest(_)));
    }

    #[test]
    fn handler_errors_pass_through() {
        let dispatcher = Dispatcher::new().register("denied", |_, _| {
            Err(ProtocolError::Remote {
                code: "access-denied".into(),
                message: "not yours".into(),
            })
        });
        let mut ctl = test_ctl();
        let err = dispatcher
            .dispatch(&mut ctl, &json!({"request": "denied"}))
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
