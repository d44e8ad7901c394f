//! Payload value model and the three interchangeable payload codecs.
//!
//! A pod negotiates one payload format at describe time and keeps it for
//! its whole life. All three codecs read into and write from the same
//! host-side [`Value`] model, so the dispatch layer never cares which
//! format a pod speaks.

use thiserror::Error;

pub mod edn;
mod handlers;
pub mod json;
pub mod transit;
mod value;

pub use handlers::{Handlers, ReadHandler, WriteHandler};
pub use value::Value;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{format} decode: {reason}")]
    Decode { format: &'static str, reason: String },
    #[error("{format} encode: {reason}")]
    Encode { format: &'static str, reason: String },
}

impl FormatError {
    pub(crate) fn decode(format: &'static str, reason: impl Into<String>) -> Self {
        FormatError::Decode {
            format,
            reason: reason.into(),
        }
    }

    pub(crate) fn encode(format: &'static str, reason: impl Into<String>) -> Self {
        FormatError::Encode {
            format,
            reason: reason.into(),
        }
    }
}

/// Payload format negotiated with a pod. Fixed after describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Edn,
    Json,
    TransitJson,
}

impl Format {
    /// Parse the `format` field of a describe reply.
    pub fn from_wire(name: &str) -> Option<Format> {
        match name {
            "edn" => Some(Format::Edn),
            "json" => Some(Format::Json),
            "transit+json" => Some(Format::TransitJson),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Edn => "edn",
            Format::Json => "json",
            Format::TransitJson => "transit+json",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize one value in the given format.
pub fn encode_payload(
    format: Format,
    value: &Value,
    handlers: &Handlers,
) -> Result<String, FormatError> {
    match format {
        Format::Edn => edn::to_edn(value, handlers),
        Format::Json => json::to_json(value),
        Format::TransitJson => transit::to_transit_json(value, handlers),
    }
}

/// Deserialize one value in the given format.
pub fn decode_payload(
    format: Format,
    text: &str,
    handlers: &Handlers,
) -> Result<Value, FormatError> {
    match format {
        Format::Edn => edn::from_edn(text, handlers),
        Format::Json => json::from_json(text),
        Format::TransitJson => transit::from_transit_json(text, handlers),
    }
}
