//! The single collaborator the harness talks to: a request/response client
//! against the service under test.

use std::fmt;

use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};

/// HTTP-style request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// One request against the service. Paths are relative to the service root.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<String>,
    pub content_type: Option<String>,
}

impl ServiceRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        ServiceRequest {
            method,
            path,
            params: Vec::new(),
            body: None,
            content_type: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Attach a JSON body.
    pub fn json(self, body: &Value) -> Self {
        self.raw_body(body.to_string(), "application/json")
    }

    /// Attach a pre-rendered body with an explicit content type.
    pub fn raw_body(mut self, body: impl Into<String>, content_type: &str) -> Self {
        self.body = Some(body.into());
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Look up a query parameter by name.
    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

/// Status and raw body returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: String,
}

impl ServiceResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        ServiceResponse {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 503 means "not ready yet" (e.g. shards still recovering), which
    /// pollers treat as transient.
    pub fn is_unavailable(&self) -> bool {
        self.status == 503
    }

    /// Parse the body as JSON. A body that is not JSON is a malformed
    /// response and therefore fatal.
    pub fn json(&self) -> HarnessResult<Value> {
        serde_json::from_str(&self.body).map_err(|e| {
            HarnessError::fatal(format!(
                "response body is not JSON ({}): {}",
                e,
                truncate(&self.body)
            ))
        })
    }

    /// Parse a successful response as JSON, failing on any non-2xx status.
    pub fn success_json(&self, context: &str) -> HarnessResult<Value> {
        self.ensure_success(context)?;
        self.json()
    }

    pub fn ensure_success(&self, context: &str) -> HarnessResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(HarnessError::fatal(format!(
                "{}: unexpected status {}: {}",
                context,
                self.status,
                truncate(&self.body)
            )))
        }
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        body.to_string()
    } else {
        let mut end = LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

/// Request/response access to the service under test.
///
/// Implementations block until the service answers. Transport failures are
/// reported as [`HarnessError::Unreachable`]; any HTTP status, including
/// errors, comes back as a [`ServiceResponse`].
pub trait ServiceClient {
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse>;
}

impl<C: ServiceClient + ?Sized> ServiceClient for &C {
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        (**self).call(request)
    }
}

impl<C: ServiceClient + ?Sized> ServiceClient for Box<C> {
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        (**self).call(request)
    }
}
