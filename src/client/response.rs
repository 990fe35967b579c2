//! Origin response envelope.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The envelope the origin wraps every item payload in.
#[derive(Debug, Deserialize)]
pub struct ItemResult<T> {
    #[serde(default)]
    pub meta: Option<Value>,
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl<T> ItemResult<T> {
    /// First origin-reported error, if the envelope carries any.
    pub fn first_error(&self) -> Option<&ItemError> {
        self.errors.first()
    }
}

/// An error entry reported inside an otherwise well-formed envelope.
#[derive(Debug, Clone, Deserialize, Error)]
#[error("{message}")]
pub struct ItemError {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Article {
        id: u64,
        title: String,
    }

    #[test]
    fn data_envelope_decodes() {
        let body = json!({
            "data": [{"id": 1, "title": "first"}, {"id": 2, "title": "second"}],
            "meta": {"total_count": 2}
        })
        .to_string();

        let result: ItemResult<Vec<Article>> =
            serde_json::from_str(&body).expect("decode");
        let data = result.data.expect("data");
        assert_eq!(data.len(), 2);
        assert_eq!(data[0], Article { id: 1, title: "first".to_string() });
        assert_eq!(result.meta.expect("meta")["total_count"], 2);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn error_envelope_decodes() {
        let body = json!({
            "errors": [{"message": "permission denied"}]
        })
        .to_string();

        let result: ItemResult<Vec<Article>> =
            serde_json::from_str(&body).expect("decode");
        assert!(result.data.is_none());
        assert_eq!(
            result.first_error().expect("error").message,
            "permission denied"
        );
    }
}
