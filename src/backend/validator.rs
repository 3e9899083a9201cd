use serde_json::{Map, Value};
use thiserror::Error;

const REQUIRED_SECTIONS: [&str; 2] = ["inbounds", "outbounds"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("config document is empty")]
    Empty,
    #[error("config document is not valid JSON: {0}")]
    Malformed(String),
    #[error("config document is not a JSON object")]
    NotAnObject,
    #[error("config document is missing required sections (inbounds/outbounds)")]
    MissingRequiredSections,
}

/// A document that parsed as a JSON object with at least one of the
/// `inbounds`/`outbounds` sections.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidDocument {
    raw: Vec<u8>,
    document: Map<String, Value>,
    pretty: String,
}

impl ValidDocument {
    /// The exact bytes that were validated. These are what gets persisted.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn pretty(&self) -> &str {
        &self.pretty
    }
}

pub fn validate(bytes: &[u8]) -> Result<ValidDocument, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    let Value::Object(document) = value else {
        return Err(ValidationError::NotAnObject);
    };

    if !REQUIRED_SECTIONS
        .iter()
        .any(|section| document.contains_key(*section))
    {
        return Err(ValidationError::MissingRequiredSections);
    }

    let pretty = serde_json::to_string_pretty(&document)
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;

    Ok(ValidDocument {
        raw: bytes.to_vec(),
        document,
        pretty,
    })
}
