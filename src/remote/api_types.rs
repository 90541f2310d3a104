//! Wire shapes of the PostgREST-style backend.
//!
//! Rows arrive as plain JSON objects and are kept that way; only the error
//! body and the `Content-Range` header need parsing.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Entity;
use crate::error::RemoteError;

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub struct ApiError {
  #[serde(default)]
  pub message: String,
  pub code: Option<String>,
  pub details: Option<String>,
  pub hint: Option<String>,
}

impl ApiError {
  /// Best human-readable description of a rejected request.
  pub fn describe(body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
      Ok(error) if !error.message.is_empty() => {
        let mut text = error.message;
        if let Some(code) = error.code {
          text = format!("{} [{}]", text, code);
        }
        if let Some(details) = error.details.filter(|d| !d.is_empty()) {
          text = format!("{}: {}", text, details);
        }
        if let Some(hint) = error.hint.filter(|h| !h.is_empty()) {
          text = format!("{} (hint: {})", text, hint);
        }
        text
      }
      _ if body.trim().is_empty() => "empty response body".to_string(),
      _ => body.trim().to_string(),
    }
  }
}

/// Total row count from a `Content-Range` header such as `0-24/3573`,
/// `*/0` or `0-9/*`. `None` when the backend did not count.
pub fn content_range_total(header: &str) -> Option<u64> {
  let (_, total) = header.trim().rsplit_once('/')?;
  total.parse().ok()
}

/// Decode a response body holding an array of rows.
pub fn decode_rows(body: Value) -> Result<Vec<Entity>, RemoteError> {
  let rows: Vec<Value> = reserialize(body).map_err(|e| RemoteError::decode(e.to_string()))?;
  rows
    .into_iter()
    .map(|row| Entity::from_value(row).map_err(|e| RemoteError::decode(e.to_string())))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_content_range_total() {
    assert_eq!(content_range_total("0-24/3573"), Some(3573));
    assert_eq!(content_range_total("*/0"), Some(0));
    assert_eq!(content_range_total("0-9/*"), None);
    assert_eq!(content_range_total("garbage"), None);
  }

  #[test]
  fn test_describe_error_body() {
    let body = r#"{"message":"permission denied","code":"42501","details":null,"hint":""}"#;
    assert_eq!(ApiError::describe(body), "permission denied [42501]");
    assert_eq!(ApiError::describe("Bad Gateway\n"), "Bad Gateway");
    assert_eq!(ApiError::describe(""), "empty response body");
  }

  #[test]
  fn test_decode_rows_rejects_non_objects() {
    let rows = decode_rows(json!([{"id": 1}, {"id": "b"}])).unwrap();
    assert_eq!(rows[0].id().as_deref(), Some("1"));
    assert!(matches!(decode_rows(json!([1, 2])), Err(RemoteError::Decode(_))));
    assert!(matches!(decode_rows(json!({"id": 1})), Err(RemoteError::Decode(_))));
  }
}
