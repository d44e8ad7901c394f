//! JSON payload codec.
//!
//! The plain-tree format: no tags, no keywords on the wire. Keyword and
//! symbol values are written as their names and arrive back as strings,
//! matching what pods see on their side of the boundary.

use serde_json::Value as Json;

use crate::{FormatError, Value};

const FORMAT: &str = "json";

pub fn from_json(text: &str) -> Result<Value, FormatError> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| FormatError::decode(FORMAT, e.to_string()))?;
    Ok(json_to_value(&json))
}

pub fn to_json(value: &Value) -> Result<String, FormatError> {
    let json = value_to_json(value)?;
    serde_json::to_string(&json).map_err(|e| FormatError::encode(FORMAT, e.to_string()))
}

pub(crate) fn json_to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => number_to_value(n),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Vector(items.iter().map(json_to_value).collect()),
        Json::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}

pub(crate) fn number_to_value(n: &serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

pub(crate) fn float_to_json(f: f64, format: &'static str) -> Result<Json, FormatError> {
    serde_json::Number::from_f64(f)
        .map(Json::Number)
        .ok_or_else(|| FormatError::encode(format, "non-finite float"))
}

fn value_to_json(value: &Value) -> Result<Json, FormatError> {
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Float(f) => float_to_json(*f, FORMAT)?,
        Value::String(s) | Value::Keyword(s) | Value::Symbol(s) => Json::String(s.clone()),
        Value::List(items) | Value::Vector(items) | Value::Set(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(value_to_json(item)?);
            }
            Json::Array(out)
        }
        Value::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match k {
                    Value::String(s) | Value::Keyword(s) | Value::Symbol(s) => s.clone(),
                    Value::Int(n) => n.to_string(),
                    other => {
                        return Err(FormatError::encode(
                            FORMAT,
                            format!("map key {other:?} has no JSON form"),
                        ))
                    }
                };
                out.insert(key, value_to_json(v)?);
            }
            Json::Object(out)
        }
        Value::Tagged(tag, _) => {
            return Err(FormatError::encode(
                FORMAT,
                format!("tagged value #{tag} has no JSON form"),
            ))
        }
        Value::WithMeta(..) => {
            return Err(FormatError::encode(FORMAT, "metadata has no JSON form"))
        }
    })
}
