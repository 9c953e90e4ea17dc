use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    http::header,
};
use serde_json::Value;

use super::ApiError;
use crate::error::CoordinatorError;

/// Named request arguments gathered from the query string and the body.
///
/// The body may be a JSON object or a form-encoded payload. Non-string JSON
/// values are kept as their compact JSON text, so a template or a batch can
/// be sent either inline or pre-serialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestArgs(HashMap<String, String>);

impl RequestArgs {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Fetch a non-blank argument, or build the error for its absence.
    pub fn require<F>(&self, name: &str, missing: F) -> Result<&str, CoordinatorError>
    where
        F: FnOnce(String) -> CoordinatorError,
    {
        match self.get(name) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(missing(format!("missing '{}' argument", name))),
        }
    }

    fn extend_form(&mut self, raw: &[u8]) -> Result<(), CoordinatorError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(raw)
            .map_err(|e| CoordinatorError::MalformedData(format!("invalid form body: {}", e)))?;
        self.0.extend(pairs);
        Ok(())
    }

    fn extend_json(&mut self, raw: &[u8]) -> Result<(), CoordinatorError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| CoordinatorError::MalformedData(format!("invalid JSON body: {}", e)))?;
        let Value::Object(fields) = value else {
            return Err(CoordinatorError::MalformedData(
                "JSON body must be an object of arguments".to_string(),
            ));
        };

        for (name, value) in fields {
            let value = match value {
                Value::String(s) => s,
                Value::Null => continue,
                other => other.to_string(),
            };
            self.0.insert(name, value);
        }
        Ok(())
    }
}

impl<S> FromRequest<S> for RequestArgs
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mut args = RequestArgs::default();
        if let Some(query) = req.uri().query() {
            args.extend_form(query.as_bytes())?;
        }

        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| CoordinatorError::MalformedData(format!("unreadable body: {}", e)))?;

        if !body.is_empty() {
            if is_json {
                args.extend_json(&body)?;
            } else {
                args.extend_form(&body)?;
            }
        }
        Ok(args)
    }
}
