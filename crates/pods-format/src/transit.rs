//! transit+json payload codec.
//!
//! JSON-carried typed values: scalars encode into `~`-prefixed strings,
//! composite typed values into one-entry `{"~#tag": rep}` objects. The
//! codec implements the built-in tags pods rely on (`u`, `local-date-time`,
//! `with-meta`, `set`, `list`, `cmap`) plus user handler tables; an
//! unhandled tag survives as [`Value::Tagged`]. Key caching is not
//! implemented; the map-as-array form `["^ ", ...]` is accepted on decode.

use serde_json::Value as Json;

use crate::json::{float_to_json, number_to_value};
use crate::{FormatError, Handlers, Value};

const FORMAT: &str = "transit+json";

pub fn from_transit_json(text: &str, handlers: &Handlers) -> Result<Value, FormatError> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| FormatError::decode(FORMAT, e.to_string()))?;
    decode_json(&json, handlers)
}

pub fn to_transit_json(value: &Value, handlers: &Handlers) -> Result<String, FormatError> {
    let json = encode_json(value, handlers)?;
    serde_json::to_string(&json).map_err(|e| FormatError::encode(FORMAT, e.to_string()))
}

fn decode_json(json: &Json, handlers: &Handlers) -> Result<Value, FormatError> {
    Ok(match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => number_to_value(n),
        Json::String(s) => decode_string(s, handlers)?,
        Json::Array(items) => {
            if items.first() == Some(&Json::String("^ ".to_string())) {
                return decode_array_map(&items[1..], handlers);
            }
            if items.len() == 2 {
                if let Json::String(s) = &items[0] {
                    if let Some(tag) = s.strip_prefix("~#") {
                        let rep = decode_json(&items[1], handlers)?;
                        return apply_read_tag(tag, rep, handlers);
                    }
                }
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_json(item, handlers)?);
            }
            Value::Vector(out)
        }
        Json::Object(entries) => {
            if entries.len() == 1 {
                let (key, rep) = entries.iter().next().unwrap_or_else(|| unreachable!());
                if let Some(tag) = key.strip_prefix("~#") {
                    let rep = decode_json(rep, handlers)?;
                    return apply_read_tag(tag, rep, handlers);
                }
            }
            let mut out = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                out.push((decode_string(key, handlers)?, decode_json(value, handlers)?));
            }
            Value::Map(out)
        }
    })
}

fn decode_array_map(items: &[Json], handlers: &Handlers) -> Result<Value, FormatError> {
    if items.len() % 2 != 0 {
        return Err(FormatError::decode(FORMAT, "map-as-array has a dangling key"));
    }
    let mut entries = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        entries.push((
            decode_json(&pair[0], handlers)?,
            decode_json(&pair[1], handlers)?,
        ));
    }
    Ok(Value::Map(entries))
}

fn decode_string(s: &str, handlers: &Handlers) -> Result<Value, FormatError> {
    let Some(rest) = s.strip_prefix('~') else {
        return Ok(Value::String(s.to_string()));
    };
    let mut chars = rest.chars();
    let Some(tag) = chars.next() else {
        return Err(FormatError::decode(FORMAT, "bare '~'"));
    };
    let body = chars.as_str();
    match tag {
        '~' | '^' => Ok(Value::String(rest.to_string())),
        ':' => Ok(Value::Keyword(body.to_string())),
        '$' => Ok(Value::Symbol(body.to_string())),
        'i' | 'n' => body
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| FormatError::decode(FORMAT, format!("bad integer string '~{tag}{body}'"))),
        'd' => body
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| FormatError::decode(FORMAT, format!("bad double string '{body}'"))),
        '?' => match body {
            "t" => Ok(Value::Bool(true)),
            "f" => Ok(Value::Bool(false)),
            _ => Err(FormatError::decode(FORMAT, format!("bad boolean string '{body}'"))),
        },
        '_' => Ok(Value::Nil),
        other => apply_read_tag(&other.to_string(), Value::String(body.to_string()), handlers),
    }
}

fn apply_read_tag(tag: &str, rep: Value, handlers: &Handlers) -> Result<Value, FormatError> {
    if let Some(handler) = handlers.transit_read_for(tag) {
        return handler(rep);
    }
    match tag {
        "with-meta" => match rep {
            Value::Vector(mut pair) | Value::List(mut pair) if pair.len() == 2 => {
                let meta = pair.pop().unwrap_or(Value::Nil);
                let value = pair.pop().unwrap_or(Value::Nil);
                Ok(Value::with_meta(value, meta))
            }
            _ => Err(FormatError::decode(
                FORMAT,
                "with-meta expects a [value meta] pair",
            )),
        },
        "set" => match rep {
            Value::Vector(items) | Value::List(items) => Ok(Value::Set(items)),
            _ => Err(FormatError::decode(FORMAT, "set expects an array")),
        },
        "list" => match rep {
            Value::Vector(items) | Value::List(items) => Ok(Value::List(items)),
            _ => Err(FormatError::decode(FORMAT, "list expects an array")),
        },
        "cmap" => match rep {
            Value::Vector(items) if items.len() % 2 == 0 => {
                let mut entries = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    entries.push((k, v));
                }
                Ok(Value::Map(entries))
            }
            _ => Err(FormatError::decode(FORMAT, "cmap expects an even array")),
        },
        "u" => match &rep {
            Value::String(s) if is_uuid(s) => Ok(Value::tagged("u", rep)),
            _ => Err(FormatError::decode(FORMAT, "u expects a uuid string")),
        },
        "local-date-time" => match &rep {
            Value::String(s) if s.contains('T') => Ok(Value::tagged("local-date-time", rep)),
            _ => Err(FormatError::decode(
                FORMAT,
                "local-date-time expects an ISO-8601 string",
            )),
        },
        _ => Ok(Value::tagged(tag, rep)),
    }
}

fn is_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, &b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

fn encode_json(value: &Value, handlers: &Handlers) -> Result<Json, FormatError> {
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Float(f) => float_to_json(*f, FORMAT)?,
        Value::String(s) => Json::String(encode_plain_string(s)),
        Value::Keyword(name) => Json::String(format!("~:{name}")),
        Value::Symbol(name) => Json::String(format!("~${name}")),
        Value::Vector(items) => Json::Array(encode_items(items, handlers)?),
        Value::List(items) => tagged_json("list", Json::Array(encode_items(items, handlers)?)),
        Value::Set(items) => tagged_json("set", Json::Array(encode_items(items, handlers)?)),
        Value::Map(entries) => encode_map(entries, handlers)?,
        Value::Tagged(tag, inner) => {
            let handler = handlers
                .transit_write
                .get(tag)
                .or(handlers.transit_default_write.as_ref());
            match handler {
                Some(handler) => {
                    let (out_tag, rep) = handler(value)?;
                    tagged_json(&out_tag, encode_json(&rep, handlers)?)
                }
                None => tagged_json(tag, encode_json(inner, handlers)?),
            }
        }
        Value::WithMeta(inner, meta) => tagged_json(
            "with-meta",
            Json::Array(vec![
                encode_json(inner, handlers)?,
                encode_json(meta, handlers)?,
            ]),
        ),
    })
}

fn encode_items(items: &[Value], handlers: &Handlers) -> Result<Vec<Json>, FormatError> {
    items.iter().map(|item| encode_json(item, handlers)).collect()
}

fn tagged_json(tag: &str, rep: Json) -> Json {
    let mut out = serde_json::Map::with_capacity(1);
    out.insert(format!("~#{tag}"), rep);
    Json::Object(out)
}

fn encode_plain_string(s: &str) -> String {
    if s.starts_with('~') || s.starts_with('^') {
        format!("~{s}")
    } else {
        s.to_string()
    }
}

fn encode_map(entries: &[(Value, Value)], handlers: &Handlers) -> Result<Json, FormatError> {
    let stringable = entries.iter().all(|(k, _)| {
        matches!(
            k,
            Value::String(_) | Value::Keyword(_) | Value::Symbol(_) | Value::Int(_)
        )
    });
    if stringable {
        let mut out = serde_json::Map::with_capacity(entries.len());
        for (k, v) in entries {
            let key = match k {
                Value::String(s) => encode_plain_string(s),
                Value::Keyword(name) => format!("~:{name}"),
                Value::Symbol(name) => format!("~${name}"),
                Value::Int(n) => format!("~i{n}"),
                _ => unreachable!(),
            };
            out.insert(key, encode_json(v, handlers)?);
        }
        Ok(Json::Object(out))
    } else {
        let mut flat = Vec::with_capacity(entries.len() * 2);
        for (k, v) in entries {
            flat.push(encode_json(k, handlers)?);
            flat.push(encode_json(v, handlers)?);
        }
        Ok(tagged_json("cmap", Json::Array(flat)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn roundtrip(value: &Value) -> Value {
        let handlers = Handlers::new();
        let text = to_transit_json(value, &handlers).expect("encode");
        from_transit_json(&text, &handlers).expect(&text)
    }

    #[test]
    fn scalar_roundtrips() {
        for v in [
            Value::Nil,
            Value::Bool(true),
            Value::Int(-5),
            Value::Float(1.25),
            Value::string("plain"),
            Value::string("~starts-with-tilde"),
            Value::string("^starts-with-caret"),
            Value::keyword("status"),
            Value::symbol("my/sym"),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn composite_roundtrips() {
        for v in [
            Value::Vector(vec![Value::Int(1), Value::keyword("two")]),
            Value::List(vec![Value::Int(1)]),
            Value::Set(vec![Value::string("a"), Value::string("b")]),
            Value::Map(vec![
                (Value::keyword("a"), Value::Int(1)),
                (Value::string("b"), Value::Nil),
                (Value::Int(3), Value::Bool(true)),
            ]),
            Value::Map(vec![(
                Value::Vector(vec![Value::Int(1)]),
                Value::string("composite key"),
            )]),
            Value::tagged("point", Value::Vector(vec![Value::Int(1), Value::Int(2)])),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn with_meta_roundtrip() {
        let v = Value::with_meta(
            Value::Vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            Value::Map(vec![
                (Value::string("source"), Value::string("x")),
                (Value::string("v"), Value::Int(1)),
            ]),
        );
        assert_eq!(roundtrip(&v), v);
        let text = to_transit_json(&v, &Handlers::new()).expect("encode");
        assert!(text.contains("~#with-meta"), "{text}");
    }

    #[test]
    fn uuid_validation() {
        let ok = r#"{"~#u":"f81d4fae-7dec-11d0-a765-00a0c91e6bf6"}"#;
        assert_eq!(
            from_transit_json(ok, &Handlers::new()).expect("uuid"),
            Value::tagged("u", Value::string("f81d4fae-7dec-11d0-a765-00a0c91e6bf6"))
        );
        let bad = r#"{"~#u":"not-a-uuid"}"#;
        assert!(from_transit_json(bad, &Handlers::new()).is_err());
    }

    #[test]
    fn map_as_array_form_decodes() {
        let text = r#"["^ ","~:a",1,"b",2]"#;
        assert_eq!(
            from_transit_json(text, &Handlers::new()).expect("decode"),
            Value::Map(vec![
                (Value::keyword("a"), Value::Int(1)),
                (Value::string("b"), Value::Int(2)),
            ])
        );
    }

    #[test]
    fn read_handler_shadows_builtin_fallthrough() {
        let mut handlers = Handlers::new();
        handlers.transit_read.insert(
            "point".to_string(),
            Arc::new(|rep| {
                Ok(Value::Map(vec![(
                    Value::keyword("rep"),
                    rep,
                )]))
            }),
        );
        let text = r#"{"~#point":[1,2]}"#;
        let v = from_transit_json(text, &handlers).expect("decode");
        assert_eq!(
            v.get("rep"),
            Some(&Value::Vector(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn write_handler_and_default() {
        let mut handlers = Handlers::new();
        handlers.transit_write.insert(
            "point".to_string(),
            Arc::new(|v| match v {
                Value::Tagged(_, inner) => Ok(("geo/point".to_string(), (**inner).clone())),
                _ => unreachable!(),
            }),
        );
        let text = to_transit_json(
            &Value::tagged("point", Value::Vector(vec![Value::Int(1)])),
            &handlers,
        )
        .expect("encode");
        assert!(text.contains("~#geo/point"), "{text}");

        handlers.transit_default_write = Some(Arc::new(|v| match v {
            Value::Tagged(tag, _) => Ok((
                "unknown".to_string(),
                Value::String(tag.clone()),
            )),
            _ => unreachable!(),
        }));
        let text = to_transit_json(&Value::tagged("mystery", Value::Nil), &handlers)
            .expect("encode");
        assert_eq!(text, r#"{"~#unknown":"mystery"}"#);
    }

    #[test]
    fn scalar_tag_strings_decode() {
        let handlers = Handlers::new();
        assert_eq!(
            from_transit_json(r#""~i99""#, &handlers).expect("int"),
            Value::Int(99)
        );
        assert_eq!(
            from_transit_json(r#""~d1.5""#, &handlers).expect("double"),
            Value::Float(1.5)
        );
        assert_eq!(
            from_transit_json(r#""~?t""#, &handlers).expect("bool"),
            Value::Bool(true)
        );
        assert_eq!(
            from_transit_json(r#""~~tilde""#, &handlers).expect("escape"),
            Value::string("~tilde")
        );
    }
}
