//! TinyG wire codec
//!
//! TinyG speaks a relaxed JSON dialect: object keys may be bare identifiers
//! (`{sr:n}`) and `true`/`false`/`null` may be shortened to `t`/`f`/`n`.
//! The decoder accepts both forms and produces ordinary [`serde_json::Value`]s.
//! The encoder writes bare keys where legal and rounds numbers to a fixed
//! number of decimals to keep lines short.

use serde_json::{Map, Number, Value};
use std::fmt::Write as _;
use tinylink_core::ProtocolError;

/// Deepest object/array nesting accepted when decoding
const MAX_DEPTH: usize = 128;

/// Default number of decimal digits used when encoding numbers
pub const DEFAULT_PRECISION: usize = 5;

/// Encoder/decoder for TinyG wire values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    precision: usize,
    abbreviate_literals: bool,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}

impl WireCodec {
    /// Create a codec that encodes numbers with `precision` decimals
    pub fn new(precision: usize) -> Self {
        Self {
            precision,
            abbreviate_literals: false,
        }
    }

    /// Emit `t`/`f`/`n` instead of the full literals
    pub fn with_abbreviated_literals(mut self, abbreviate: bool) -> Self {
        self.abbreviate_literals = abbreviate;
        self
    }

    /// Number of decimals used for numbers
    pub fn precision(&self) -> usize {
        self.precision
    }

    /// Encode a value to wire text
    pub fn encode(&self, value: &Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, value);
        out
    }

    /// Encode an object from `(key, value)` pairs, omitting `None` values.
    ///
    /// Keys are written in the order given.
    pub fn encode_fields<'a, I>(&self, fields: I) -> String
    where
        I: IntoIterator<Item = (&'a str, Option<Value>)>,
    {
        let mut out = String::from("{");
        let mut first = true;
        for (key, value) in fields {
            let Some(value) = value else { continue };
            if !first {
                out.push(',');
            }
            first = false;
            self.write_key(&mut out, key);
            self.write_value(&mut out, &value);
        }
        out.push('}');
        out
    }

    /// Format a number with this codec's precision, trimming trailing zeros
    pub fn format_number(&self, n: f64) -> String {
        if !n.is_finite() {
            return "null".to_string();
        }
        let mut s = format!("{:.*}", self.precision, n);
        if s.contains('.') {
            let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
            s.truncate(trimmed);
        }
        if s == "-0" {
            s = "0".to_string();
        }
        s
    }

    /// Decode wire text to a value
    pub fn decode(&self, text: &str) -> Result<Value, ProtocolError> {
        let mut parser = Parser {
            input: text.as_bytes(),
            text,
            pos: 0,
            depth: 0,
        };
        parser.skip_ws();
        let value = parser.parse_value()?;
        parser.skip_ws();
        if parser.pos != parser.input.len() {
            return Err(parser.error("trailing characters after value"));
        }
        Ok(value)
    }

    fn write_value(&self, out: &mut String, value: &Value) {
        match value {
            Value::Null => out.push_str(if self.abbreviate_literals { "n" } else { "null" }),
            Value::Bool(true) => out.push_str(if self.abbreviate_literals { "t" } else { "true" }),
            Value::Bool(false) => {
                out.push_str(if self.abbreviate_literals { "f" } else { "false" })
            }
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    let _ = write!(out, "{}", i);
                } else if let Some(u) = n.as_u64() {
                    let _ = write!(out, "{}", u);
                } else {
                    out.push_str(&self.format_number(n.as_f64().unwrap_or(f64::NAN)));
                }
            }
            Value::String(s) => write_string(out, s),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_value(out, item);
                }
                out.push(']');
            }
            Value::Object(map) => {
                out.push('{');
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_key(out, key);
                    self.write_value(out, item);
                }
                out.push('}');
            }
        }
    }

    fn write_key(&self, out: &mut String, key: &str) {
        if is_bare_key(key) {
            out.push_str(key);
        } else {
            write_string(out, key);
        }
        out.push(':');
    }
}

/// Encode with the default codec
pub fn encode(value: &Value) -> String {
    WireCodec::default().encode(value)
}

/// Decode with the default codec
pub fn decode(text: &str) -> Result<Value, ProtocolError> {
    WireCodec::default().decode(text)
}

/// True if `key` may be written without quotes: `[A-Za-z][A-Za-z0-9_]*`
pub fn is_bare_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

struct Parser<'a> {
    input: &'a [u8],
    text: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> ProtocolError {
        ProtocolError::malformed(self.pos, reason)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn expect_more(&self) -> Result<u8, ProtocolError> {
        self.peek()
            .ok_or_else(|| self.error("unexpected end of input"))
    }

    fn parse_value(&mut self) -> Result<Value, ProtocolError> {
        match self.expect_more()? {
            b'{' => self.nested(Self::parse_object),
            b'[' => self.nested(Self::parse_array),
            b'"' => self.parse_string().map(Value::String),
            b't' => self.parse_literal("true", Value::Bool(true)),
            b'f' => self.parse_literal("false", Value::Bool(false)),
            b'n' => self.parse_literal("null", Value::Null),
            b'-' | b'0'..=b'9' => self.parse_number(),
            _ => Err(self.error("unexpected character")),
        }
    }

    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<Value, ProtocolError>,
    ) -> Result<Value, ProtocolError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    /// Accepts the full literal or its first letter alone.
    fn parse_literal(&mut self, word: &str, value: Value) -> Result<Value, ProtocolError> {
        let rest = &self.input[self.pos..];
        if rest.starts_with(word.as_bytes()) {
            self.pos += word.len();
        } else {
            self.pos += 1;
        }
        match self.peek() {
            None | Some(b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n') => Ok(value),
            Some(_) => Err(self.error("invalid literal")),
        }
    }

    fn parse_number(&mut self) -> Result<Value, ProtocolError> {
        let start = self.pos;
        let mut is_float = false;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(self.error("expected digits"));
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            let frac_start = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
            if self.pos == frac_start {
                return Err(self.error("expected digits after decimal point"));
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            let exp_start = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
            if self.pos == exp_start {
                return Err(self.error("expected exponent digits"));
            }
        }

        let slice = &self.text[start..self.pos];
        if !is_float {
            if let Ok(i) = slice.parse::<i64>() {
                return Ok(Value::Number(i.into()));
            }
            if let Ok(u) = slice.parse::<u64>() {
                return Ok(Value::Number(u.into()));
            }
        }
        slice
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| ProtocolError::malformed(start, "number out of range"))
    }

    fn parse_string(&mut self) -> Result<String, ProtocolError> {
        // opening quote
        self.pos += 1;
        let mut out = String::new();
        loop {
            let start = self.pos;
            while let Some(b) = self.peek() {
                if b == b'"' || b == b'\\' || b < 0x20 {
                    break;
                }
                self.pos += 1;
            }
            out.push_str(&self.text[start..self.pos]);

            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let c = self.parse_escape()?;
                    out.push(c);
                }
                Some(_) => return Err(self.error("control character in string")),
            }
        }
    }

    fn parse_escape(&mut self) -> Result<char, ProtocolError> {
        let b = self
            .peek()
            .ok_or_else(|| self.error("unterminated string"))?;
        self.pos += 1;
        Ok(match b {
            b'"' => '"',
            b'\\' => '\\',
            b'/' => '/',
            b'b' => '\u{08}',
            b'f' => '\u{0c}',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'u' => {
                let hi = self.parse_hex4()?;
                if (0xD800..0xDC00).contains(&hi) {
                    if self.input[self.pos..].starts_with(b"\\u") {
                        self.pos += 2;
                        let lo = self.parse_hex4()?;
                        if !(0xDC00..0xE000).contains(&lo) {
                            return Err(self.error("invalid low surrogate"));
                        }
                        let code = 0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00);
                        char::from_u32(code).ok_or_else(|| self.error("invalid code point"))?
                    } else {
                        return Err(self.error("unpaired surrogate"));
                    }
                } else {
                    char::from_u32(hi).ok_or_else(|| self.error("invalid code point"))?
                }
            }
            _ => {
                self.pos -= 1;
                return Err(self.error("unknown escape sequence"));
            }
        })
    }

    fn parse_hex4(&mut self) -> Result<u32, ProtocolError> {
        if self.pos + 4 > self.input.len() {
            return Err(self.error("truncated unicode escape"));
        }
        let code = std::str::from_utf8(&self.input[self.pos..self.pos + 4])
            .ok()
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .ok_or_else(|| self.error("invalid unicode escape"))?;
        self.pos += 4;
        Ok(code)
    }

    fn parse_key(&mut self) -> Result<String, ProtocolError> {
        match self.expect_more()? {
            b'"' => self.parse_string(),
            b'A'..=b'Z' | b'a'..=b'z' => {
                let start = self.pos;
                while matches!(
                    self.peek(),
                    Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_')
                ) {
                    self.pos += 1;
                }
                Ok(self.text[start..self.pos].to_string())
            }
            _ => Err(self.error("expected object key")),
        }
    }

    fn parse_object(&mut self) -> Result<Value, ProtocolError> {
        self.pos += 1;
        let mut map = Map::new();
        self.skip_ws();
        if self.expect_more()? == b'}' {
            self.pos += 1;
            return Ok(Value::Object(map));
        }
        loop {
            self.skip_ws();
            let key = self.parse_key()?;
            self.skip_ws();
            if self.expect_more()? != b':' {
                return Err(self.error("expected ':' after key"));
            }
            self.pos += 1;
            self.skip_ws();
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.expect_more()? {
                b',' => self.pos += 1,
                b'}' => {
                    self.pos += 1;
                    return Ok(Value::Object(map));
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<Value, ProtocolError> {
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_ws();
        if self.expect_more()? == b']' {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        loop {
            self.skip_ws();
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.expect_more()? {
                b',' => self.pos += 1,
                b']' => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_relaxed_form() {
        let value = decode(r#"{r:{sr:n,ok:t,busy:f},f:[1,0,4]}"#).unwrap();
        assert_eq!(
            value,
            json!({"r": {"sr": null, "ok": true, "busy": false}, "f": [1, 0, 4]})
        );
    }

    #[test]
    fn test_decode_standard_json() {
        let value = decode(r#" {"qr": 28, "qi": 1, "qo": 0} "#).unwrap();
        assert_eq!(value, json!({"qr": 28, "qi": 1, "qo": 0}));
    }

    #[test]
    fn test_encode_bare_keys_and_precision() {
        let codec = WireCodec::new(3);
        let text = codec.encode(&json!({"posx": 1.23456, "a b": "x", "n": null}));
        assert_eq!(text, r#"{"a b":"x",n:null,posx:1.235}"#);
    }

    #[test]
    fn test_abbreviated_literals() {
        let codec = WireCodec::default().with_abbreviated_literals(true);
        assert_eq!(codec.encode(&json!({"sr": null, "x": true})), "{sr:n,x:t}");
    }

    #[test]
    fn test_encode_fields_omits_missing() {
        let text = WireCodec::default().encode_fields([
            ("gc", Some(json!("G0 X1"))),
            ("skipped", None),
            ("n", Some(json!(3))),
        ]);
        assert_eq!(text, r#"{gc:"G0 X1",n:3}"#);
    }

    #[test]
    fn test_number_formatting() {
        let codec = WireCodec::default();
        assert_eq!(codec.format_number(1.0), "1");
        assert_eq!(codec.format_number(-0.000001), "0");
        assert_eq!(codec.format_number(2.5), "2.5");
        assert_eq!(codec.format_number(1.234567), "1.23457");
    }

    #[test]
    fn test_string_escapes() {
        let value = decode(r#"{"msg":"a\"b\\c\né😀"}"#).unwrap();
        assert_eq!(value["msg"], json!("a\"b\\c\né😀"));
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            r#"{"msg":"open"#,
            r#"{"a":1"#,
            r#"[1,2"#,
            r#"{"a":"\q"}"#,
            r#"{"a":}"#,
            r#"{"a":1}x"#,
            r#"{1a:2}"#,
            r#"{"a":tru}"#,
            "",
            "-",
        ] {
            assert!(decode(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_error_offset() {
        match decode(r#"{"a":"\q"}"#) {
            Err(ProtocolError::MalformedWireData { offset, reason }) => {
                assert_eq!(offset, 7);
                assert!(reason.contains("escape"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nesting_limit() {
        let deep = "[".repeat(4096);
        match decode(&deep) {
            Err(ProtocolError::MalformedWireData { offset, reason }) => {
                assert_eq!(offset, MAX_DEPTH);
                assert!(reason.contains("nesting"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let ok = format!("{}{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert!(decode(&ok).is_ok());
    }

    #[test]
    fn test_bare_key_rule() {
        assert!(is_bare_key("posx"));
        assert!(is_bare_key("g54"));
        assert!(!is_bare_key("1ma"));
        assert!(!is_bare_key(""));
        assert!(!is_bare_key("a-b"));
    }
}
