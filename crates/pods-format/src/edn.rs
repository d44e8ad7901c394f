//! EDN reader and printer.
//!
//! Covers the subset pods exchange: literal scalars, keywords, symbols,
//! strings, characters, lists, vectors, sets, maps, metadata, comments,
//! discard forms, and tagged literals. A tagged literal with no registered
//! read handler decodes to [`Value::Tagged`] so unknown tags survive a
//! round trip.

use crate::{FormatError, Handlers, Value};

const FORMAT: &str = "edn";

pub fn from_edn(text: &str, handlers: &Handlers) -> Result<Value, FormatError> {
    let mut reader = Reader {
        bytes: text.as_bytes(),
        pos: 0,
    };
    let value = reader.read_value(handlers)?;
    reader.skip_ws();
    if !reader.eof() {
        return Err(reader.err("trailing content after value"));
    }
    Ok(value)
}

pub fn to_edn(value: &Value, handlers: &Handlers) -> Result<String, FormatError> {
    let mut out = String::new();
    write_value(&mut out, value, handlers)?;
    Ok(out)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn err(&self, reason: impl std::fmt::Display) -> FormatError {
        FormatError::decode(FORMAT, format!("{reason} at byte {}", self.pos))
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' => {
                    self.pos += 1;
                }
                b';' => {
                    while let Some(b) = self.bump() {
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn read_value(&mut self, handlers: &Handlers) -> Result<Value, FormatError> {
        self.skip_ws();
        let b = self.peek().ok_or_else(|| self.err("unexpected end of input"))?;
        match b {
            b'"' => self.read_string(),
            b'\\' => self.read_char(),
            b':' => {
                self.pos += 1;
                let name = self.read_token()?;
                Ok(Value::Keyword(name))
            }
            b'(' => {
                self.pos += 1;
                Ok(Value::List(self.read_seq(b')', handlers)?))
            }
            b'[' => {
                self.pos += 1;
                Ok(Value::Vector(self.read_seq(b']', handlers)?))
            }
            b'{' => {
                self.pos += 1;
                self.read_map(handlers)
            }
            b'#' => {
                self.pos += 1;
                match self.peek() {
                    Some(b'{') => {
                        self.pos += 1;
                        Ok(Value::Set(self.read_seq(b'}', handlers)?))
                    }
                    Some(b'_') => {
                        self.pos += 1;
                        self.read_value(handlers)?;
                        self.read_value(handlers)
                    }
                    Some(_) => {
                        let tag = self.read_token()?;
                        if tag.is_empty() {
                            return Err(self.err("empty tag"));
                        }
                        let value = self.read_value(handlers)?;
                        match handlers.edn_read_for(&tag) {
                            Some(handler) => handler(value),
                            None => Ok(Value::tagged(tag, value)),
                        }
                    }
                    None => Err(self.err("dangling '#'")),
                }
            }
            b'^' => {
                self.pos += 1;
                let meta = self.read_value(handlers)?;
                let value = self.read_value(handlers)?;
                Ok(Value::with_meta(value, meta))
            }
            b'0'..=b'9' => self.read_number(),
            b'+' | b'-' if matches!(self.bytes.get(self.pos + 1), Some(d) if d.is_ascii_digit()) => {
                self.read_number()
            }
            _ => {
                let token = self.read_token()?;
                if token.is_empty() {
                    return Err(self.err(format!("unexpected byte 0x{b:02x}")));
                }
                Ok(match token.as_str() {
                    "nil" => Value::Nil,
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::Symbol(token),
                })
            }
        }
    }

    fn read_seq(&mut self, close: u8, handlers: &Handlers) -> Result<Vec<Value>, FormatError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b) if b == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(_) => items.push(self.read_value(handlers)?),
                None => return Err(self.err("unterminated collection")),
            }
        }
    }

    fn read_map(&mut self, handlers: &Handlers) -> Result<Value, FormatError> {
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Map(entries));
                }
                Some(_) => {
                    let key = self.read_value(handlers)?;
                    self.skip_ws();
                    if self.peek() == Some(b'}') {
                        return Err(self.err("map has a dangling key"));
                    }
                    let value = self.read_value(handlers)?;
                    entries.push((key, value));
                }
                None => return Err(self.err("unterminated map")),
            }
        }
    }

    fn read_string(&mut self) -> Result<Value, FormatError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            let b = self.bump().ok_or_else(|| self.err("unterminated string"))?;
            match b {
                b'"' => return Ok(Value::String(out)),
                b'\\' => {
                    let esc = self.bump().ok_or_else(|| self.err("unterminated escape"))?;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        b'r' => out.push('\r'),
                        b'b' => out.push('\u{0008}'),
                        b'f' => out.push('\u{000c}'),
                        b'u' => out.push(self.read_unicode_escape()?),
                        other => return Err(self.err(format!("bad escape '\\{}'", other as char))),
                    }
                }
                _ => {
                    // Re-walk as utf-8 from the byte before `pos`.
                    let start = self.pos - 1;
                    let rest = &self.bytes[start..];
                    let s = std::str::from_utf8(rest)
                        .map_err(|_| self.err("invalid utf-8 in string"))?;
                    let ch = s.chars().next().ok_or_else(|| self.err("empty string tail"))?;
                    out.push(ch);
                    self.pos = start + ch.len_utf8();
                }
            }
        }
    }

    fn read_unicode_escape(&mut self) -> Result<char, FormatError> {
        let mut code: u32 = 0;
        for _ in 0..4 {
            let b = self.bump().ok_or_else(|| self.err("unterminated \\u escape"))?;
            let digit = (b as char)
                .to_digit(16)
                .ok_or_else(|| self.err("non-hex digit in \\u escape"))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| self.err("invalid \\u code point"))
    }

    fn read_char(&mut self) -> Result<Value, FormatError> {
        self.pos += 1; // backslash
        let token = self.read_token()?;
        let ch = match token.as_str() {
            "newline" => '\n',
            "space" => ' ',
            "tab" => '\t',
            "return" => '\r',
            "backspace" => '\u{0008}',
            "formfeed" => '\u{000c}',
            _ => {
                let mut chars = token.chars();
                match (chars.next(), chars.next()) {
                    (Some('u'), Some(_)) if token.len() == 5 => {
                        let code = u32::from_str_radix(&token[1..], 16)
                            .map_err(|_| self.err("bad \\u character"))?;
                        char::from_u32(code).ok_or_else(|| self.err("invalid character code"))?
                    }
                    (Some(c), None) => c,
                    _ => return Err(self.err(format!("bad character literal '\\{token}'"))),
                }
            }
        };
        Ok(Value::String(ch.to_string()))
    }

    /// Read a token up to the next delimiter. Used for symbols, keywords,
    /// tags, and character names.
    fn read_token(&mut self) -> Result<String, FormatError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' | b'(' | b')' | b'[' | b']' | b'{' | b'}'
                | b'"' | b';' => break,
                _ => self.pos += 1,
            }
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .map(str::to_string)
            .map_err(|_| self.err("invalid utf-8 in token"))
    }

    fn read_number(&mut self) -> Result<Value, FormatError> {
        let token = self.read_token()?;
        let mut text = token.as_str();
        let mut float = false;
        if let Some(stripped) = text.strip_suffix('N') {
            text = stripped;
        } else if let Some(stripped) = text.strip_suffix('M') {
            text = stripped;
            float = true;
        }
        if text.contains(['.', 'e', 'E']) || float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.err(format!("bad float '{token}'")))
        } else {
            let text = text.strip_prefix('+').unwrap_or(text);
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| self.err(format!("integer '{token}' outside 64-bit range")))
        }
    }
}

fn write_value(out: &mut String, value: &Value, handlers: &Handlers) -> Result<(), FormatError> {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(FormatError::encode(FORMAT, "non-finite float"));
            }
            out.push_str(&format!("{f:?}"));
        }
        Value::String(s) => write_string(out, s),
        Value::Keyword(name) => {
            out.push(':');
            out.push_str(name);
        }
        Value::Symbol(name) => out.push_str(name),
        Value::List(items) => write_seq(out, items, "(", ")", handlers)?,
        Value::Vector(items) => write_seq(out, items, "[", "]", handlers)?,
        Value::Set(items) => write_seq(out, items, "#{", "}", handlers)?,
        Value::Map(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, k, handlers)?;
                out.push(' ');
                write_value(out, v, handlers)?;
            }
            out.push('}');
        }
        Value::Tagged(tag, inner) => match handlers.edn_write.get(tag) {
            Some(handler) => {
                let (out_tag, rep) = handler(value)?;
                out.push('#');
                out.push_str(&out_tag);
                out.push(' ');
                write_value(out, &rep, handlers)?;
            }
            None => {
                out.push('#');
                out.push_str(tag);
                out.push(' ');
                write_value(out, inner, handlers)?;
            }
        },
        Value::WithMeta(inner, meta) => {
            out.push('^');
            write_value(out, meta, handlers)?;
            out.push(' ');
            write_value(out, inner, handlers)?;
        }
    }
    Ok(())
}

fn write_seq(
    out: &mut String,
    items: &[Value],
    open: &str,
    close: &str,
    handlers: &Handlers,
) -> Result<(), FormatError> {
    out.push_str(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write_value(out, item, handlers)?;
    }
    out.push_str(close);
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn parse(text: &str) -> Value {
        from_edn(text, &Handlers::new()).expect(text)
    }

    #[test]
    fn scalars() {
        assert_eq!(parse("nil"), Value::Nil);
        assert_eq!(parse("true"), Value::Bool(true));
        assert_eq!(parse("-42"), Value::Int(-42));
        assert_eq!(parse("+7"), Value::Int(7));
        assert_eq!(parse("1.5"), Value::Float(1.5));
        assert_eq!(parse("1e3"), Value::Float(1000.0));
        assert_eq!(parse("3N"), Value::Int(3));
        assert_eq!(parse("\"a\\nb\""), Value::string("a\nb"));
        assert_eq!(parse(":kw"), Value::keyword("kw"));
        assert_eq!(parse(":ns/kw"), Value::keyword("ns/kw"));
        assert_eq!(parse("a-sym"), Value::symbol("a-sym"));
        assert_eq!(parse("\\newline"), Value::string("\n"));
        assert_eq!(parse("\\a"), Value::string("a"));
    }

    #[test]
    fn collections_and_comments() {
        assert_eq!(
            parse("(1, 2, 3)"),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            parse("[1 ; comment\n 2]"),
            Value::Vector(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            parse("#{:a :b}"),
            Value::Set(vec![Value::keyword("a"), Value::keyword("b")])
        );
        assert_eq!(
            parse("{:a 1 \"b\" 2}"),
            Value::Map(vec![
                (Value::keyword("a"), Value::Int(1)),
                (Value::string("b"), Value::Int(2)),
            ])
        );
        assert_eq!(parse("[#_ 1 2]"), Value::Vector(vec![Value::Int(2)]));
    }

    #[test]
    fn unknown_tag_becomes_tagged_literal() {
        assert_eq!(
            parse("#person {:name \"A\"}"),
            Value::tagged(
                "person",
                Value::Map(vec![(Value::keyword("name"), Value::string("A"))])
            )
        );
    }

    #[test]
    fn read_handler_transforms_tag() {
        let mut handlers = Handlers::new();
        handlers.edn_read.insert(
            "inc".to_string(),
            Arc::new(|v| match v {
                Value::Int(n) => Ok(Value::Int(n + 1)),
                other => Ok(other),
            }),
        );
        assert_eq!(from_edn("#inc 41", &handlers).expect("parse"), Value::Int(42));
    }

    #[test]
    fn metadata_roundtrip() {
        let v = parse("^{:source \"x\"} [1 2]");
        assert_eq!(
            v,
            Value::with_meta(
                Value::Vector(vec![Value::Int(1), Value::Int(2)]),
                Value::Map(vec![(Value::keyword("source"), Value::string("x"))])
            )
        );
        let printed = to_edn(&v, &Handlers::new()).expect("print");
        assert_eq!(from_edn(&printed, &Handlers::new()).expect("reparse"), v);
    }

    #[test]
    fn print_then_parse_roundtrips() {
        let values = [
            Value::Nil,
            Value::Int(-3),
            Value::Float(2.5),
            Value::string("say \"hi\"\n"),
            Value::keyword("status"),
            Value::symbol("pod.test-pod/add-one"),
            Value::List(vec![Value::Int(1), Value::string("two")]),
            Value::Vector(vec![Value::Bool(false), Value::Nil]),
            Value::Set(vec![Value::keyword("a")]),
            Value::Map(vec![
                (Value::keyword("k"), Value::Vector(vec![Value::Int(9)])),
                (Value::Int(1), Value::string("int key")),
            ]),
            Value::tagged("person", Value::Map(vec![(Value::keyword("age"), Value::Int(30))])),
        ];
        for v in values {
            let text = to_edn(&v, &Handlers::new()).expect("print");
            assert_eq!(from_edn(&text, &Handlers::new()).expect(&text), v, "{text}");
        }
    }

    #[test]
    fn malformed_inputs() {
        for bad in ["{:a}", "[1 2", "\"open", "#", "99999999999999999999", "1 2"] {
            assert!(
                from_edn(bad, &Handlers::new()).is_err(),
                "{bad:?} should fail"
            );
        }
    }
}
