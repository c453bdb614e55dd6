//! Request/response envelopes exchanged with services.
//!
//! A [`Request`] addresses a service by router and path. The owning worker
//! wraps it in an [`Event`], runs the middleware pipelines over it and ships
//! the resulting [`Response`] back to the caller.

mod body;
mod event;

pub use body::{Body, BodyStream, StreamSender};
pub use event::Event;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::Router;

/// Delivery mode of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Caller awaits a response.
    Fetch,
    /// Fire-and-forget.
    Notify,
}

/// Request addressed to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Router>,
    pub target: Router,
    pub path: String,
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl Request {
    pub fn fetch(target: Router, path: impl Into<String>) -> Self {
        Self::with_method(target, path, Method::Fetch)
    }

    pub fn notify(target: Router, path: impl Into<String>) -> Self {
        Self::with_method(target, path, Method::Notify)
    }

    fn with_method(target: Router, path: impl Into<String>, method: Method) -> Self {
        Self {
            source: None,
            target,
            path: path.into(),
            method,
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn source(mut self, source: Router) -> Self {
        self.source = Some(source);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Response produced by a service.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_message: None,
            headers: BTreeMap::new(),
            body: Body::Empty,
        }
    }

    pub fn ok(body: impl Into<Body>) -> Self {
        let mut response = Self::new(200);
        response.body = body.into();
        response
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        let mut response = Self::new(404);
        response.status_message = Some(message.into());
        response
    }

    /// Upstream failure, carrying the error description.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        let mut response = Self::new(502);
        response.status_message = Some(message.into());
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Split off the body, leaving the status line and headers.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}

impl Default for Response {
    /// Unhandled until something sets a status.
    fn default() -> Self {
        Self::new(404)
    }
}
