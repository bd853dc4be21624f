//! Backend seams for the saved-listings and property-creation endpoints.
//!
//! The transport itself lives in the shell; this module only fixes the
//! contract, the error shape it reports, and the tolerant decoding of the
//! saved-list response body.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::model::{PropertyId, PropertySubmission, UserId};
use crate::{AppError, ErrorKind};

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("DNS resolution failed for {host}: {message}")]
    DnsError { host: String, message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("device is offline")]
    Offline,

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
        retryable: bool,
    },

    #[error("request cancelled")]
    Cancelled { request_id: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl HttpError {
    /// Builds an `HttpStatus` error with retryability derived from the code.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        HttpError::HttpStatus {
            status,
            message: message.into(),
            request_id: String::new(),
            retryable: matches!(status, 408 | 429 | 500..=599),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. }
            | HttpError::ConnectionError { .. }
            | HttpError::DnsError { .. }
            | HttpError::Offline => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// The request never reached the server. Only these are worth queueing
    /// for a later replay.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            HttpError::Offline
                | HttpError::ConnectionError { .. }
                | HttpError::DnsError { .. }
                | HttpError::Timeout { .. }
        )
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            HttpError::Timeout { request_id, .. }
            | HttpError::HttpStatus { request_id, .. }
            | HttpError::Cancelled { request_id }
            | HttpError::InvalidResponse { request_id, .. } => {
                Some(request_id.as_str()).filter(|id| !id.is_empty())
            }
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (400..500).contains(status))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (500..600).contains(status))
    }
}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let internal = e.to_string();
        let err = match &e {
            HttpError::HttpStatus { status, message, .. } => {
                AppError::from_http_status(*status, None).with_context("server_message", message)
            }
            HttpError::Timeout { .. } => AppError::new(ErrorKind::Timeout, "Request timed out"),
            HttpError::DnsError { .. } | HttpError::ConnectionError { .. } | HttpError::Offline => {
                AppError::new(ErrorKind::Network, "Network unavailable")
            }
            HttpError::Cancelled { .. } => AppError::new(ErrorKind::Network, "Request cancelled"),
            HttpError::InvalidResponse { .. } | HttpError::SerializationError { .. } => {
                AppError::new(ErrorKind::Deserialization, "Unexpected server response")
            }
        };
        match e.request_id() {
            Some(id) => err.with_internal(internal).with_context("request_id", id),
            None => err.with_internal(internal),
        }
    }
}

/// Saved-listings endpoints for the signed-in user.
#[async_trait]
pub trait SavedPropertiesApi: Send + Sync {
    async fn list_saved_ids(&self, user: &UserId) -> Result<BTreeSet<PropertyId>, HttpError>;
    async fn save_property(&self, user: &UserId, property: &PropertyId) -> Result<(), HttpError>;
    async fn unsave_property(&self, user: &UserId, property: &PropertyId)
        -> Result<(), HttpError>;
}

/// Property-creation endpoint. Returns the server id of the new listing.
#[async_trait]
pub trait PropertySubmitter: Send + Sync {
    async fn create_property(
        &self,
        submission: &PropertySubmission,
    ) -> Result<PropertyId, HttpError>;
}

const LIST_WRAPPERS: &[&str] = &["data", "savedProperties", "saved_properties", "items"];
const ID_FIELDS: &[&str] = &["propertyId", "property_id", "_id", "id"];

/// Decodes a saved-list response body.
///
/// Accepts a bare array or one wrapped under a known key; elements may be ids
/// (string or number), objects carrying an id field, or objects nesting the
/// listing under `property`. Unrecognized elements are skipped.
pub fn parse_saved_ids(body: &[u8]) -> Result<BTreeSet<PropertyId>, HttpError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| HttpError::InvalidResponse {
        reason: e.to_string(),
        request_id: String::new(),
    })?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => LIST_WRAPPERS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .ok_or_else(|| HttpError::InvalidResponse {
                reason: "no saved-list array in response".to_string(),
                request_id: String::new(),
            })?,
        _ => {
            return Err(HttpError::InvalidResponse {
                reason: "saved-list response must be an array or object".to_string(),
                request_id: String::new(),
            })
        }
    };

    Ok(items.iter().filter_map(id_from_value).collect())
}

fn id_from_value(value: &Value) -> Option<PropertyId> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(PropertyId::new(s.trim())),
        Value::Number(n) => Some(PropertyId::new(n.to_string())),
        Value::Object(map) => ID_FIELDS
            .iter()
            .find_map(|k| map.get(*k).and_then(id_from_value))
            .or_else(|| map.get("property").and_then(id_from_value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> BTreeSet<PropertyId> {
        list.iter().map(|s| PropertyId::new(*s)).collect()
    }

    #[test]
    fn test_error_retryable() {
        assert!(HttpError::Offline.is_retryable());
        assert!(HttpError::status(503, "down").is_retryable());
        assert!(HttpError::status(429, "slow").is_retryable());
        assert!(!HttpError::status(400, "bad").is_retryable());
        assert!(!HttpError::Cancelled {
            request_id: "r".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_connectivity_excludes_server_errors() {
        assert!(HttpError::ConnectionError {
            host: "api".into(),
            message: "refused".into()
        }
        .is_connectivity());
        assert!(!HttpError::status(503, "down").is_connectivity());
        assert!(!HttpError::status(422, "invalid").is_connectivity());
    }

    #[test]
    fn test_status_classification() {
        assert!(HttpError::status(404, "missing").is_client_error());
        assert!(HttpError::status(502, "gateway").is_server_error());
    }

    #[test]
    fn test_app_error_conversion() {
        let app: AppError = HttpError::status(401, "expired").into();
        assert_eq!(app.kind, ErrorKind::Authentication);

        let app: AppError = HttpError::Offline.into();
        assert_eq!(app.kind, ErrorKind::Network);
        assert!(app.is_retryable());

        let app: AppError = HttpError::Timeout {
            timeout_ms: 30_000,
            request_id: "req-1".into(),
        }
        .into();
        assert_eq!(app.kind, ErrorKind::Timeout);
        assert_eq!(app.context.get("request_id").map(String::as_str), Some("req-1"));
    }

    #[test]
    fn test_parse_bare_string_array() {
        let parsed = parse_saved_ids(br#"["a1", "b2", " "]"#).unwrap();
        assert_eq!(parsed, ids(&["a1", "b2"]));
    }

    #[test]
    fn test_parse_wrapped_objects() {
        let body = br#"{"data":[{"propertyId":"p1"},{"_id":"p2"},{"property":{"id":7}},{"note":"x"}]}"#;
        assert_eq!(parse_saved_ids(body).unwrap(), ids(&["p1", "p2", "7"]));
    }

    #[test]
    fn test_parse_saved_properties_wrapper() {
        let body = br#"{"savedProperties":[1, 2, 2]}"#;
        assert_eq!(parse_saved_ids(body).unwrap(), ids(&["1", "2"]));
    }

    #[test]
    fn test_parse_rejects_unknown_shapes() {
        assert!(parse_saved_ids(b"not json").is_err());
        assert!(parse_saved_ids(br#"{"other":[]}"#).is_err());
        assert!(parse_saved_ids(b"42").is_err());
    }
}
