//! Value Codec
//!
//! Author-entered test parameters and expected outputs arrive as text fields
//! that may hold either a bare string or a structured literal. Everything that
//! is compared during grading (parameters, expected outputs, actual outputs)
//! is normalized into [`Value`] through [`convert`], so comparisons are
//! structural rather than textual.
//!
//! **Accepted literal syntax:**
//! - JSON literals (`5`, `-2.5`, `"text"`, `[1, 2]`, `{"a": 1}`, `true`, `null`)
//! - Python spellings (`True`, `False`, `None`, `'single quoted'`, tuples,
//!   sets, trailing commas, `1_000` digit groups)
//!
//! Anything else stays the original string, including literals nested deeper
//! than [`MAX_NESTING`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deepest container nesting read as a literal; matches serde_json's limit
pub const MAX_NESTING: usize = 128;

/// Native comparable value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Parse a literal, falling back to the original text
    pub fn parse(raw: &str) -> Value {
        LiteralParser::new(raw)
            .parse_document()
            .unwrap_or_else(|| Value::String(raw.to_string()))
    }

    /// Render as a literal that [`Value::parse`] reads back
    pub fn to_literal(&self) -> String {
        serde_json::Value::from(self.clone()).to_string()
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Normalize a value before storing or comparing it.
///
/// Strings are re-read as literals; every other variant is already native.
pub fn convert(value: Value) -> Value {
    match value {
        Value::String(raw) => Value::parse(&raw),
        other => other,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) | (Value::Float(_), Value::Float(_)) => {
                self.as_number() == other.as_number()
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_literal())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            // Non-finite floats have no JSON form
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::List(items) => serde_json::Value::Array(items.into_iter().map(Into::into).collect()),
            Value::Map(map) => serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

/// Recursive-descent reader for a single literal
struct LiteralParser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
    depth: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
            depth: 0,
        }
    }

    fn parse_document(mut self) -> Option<Value> {
        let value = self.parse_value()?;
        self.skip_ws();
        match self.chars.peek() {
            None => Some(value),
            Some(_) => None,
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    /// Run `parse` one container level deeper, refusing past `MAX_NESTING`
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        if self.depth >= MAX_NESTING {
            return None;
        }
        self.chars.next();
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '"' | '\'' => self.parse_string().map(Value::String),
            '[' => self
                .nested(|p| p.parse_sequence(']'))
                .map(|(items, _)| Value::List(items)),
            '(' => {
                let (mut items, trailing_comma) = self.nested(|p| p.parse_sequence(')'))?;
                // `(x)` is just a parenthesized x; `(x,)` and `()` are tuples
                if items.len() == 1 && !trailing_comma {
                    items.pop()
                } else {
                    Some(Value::List(items))
                }
            }
            '{' => self.nested(Self::parse_mapping),
            c if c == '-' || c == '+' || c.is_ascii_digit() || c == '.' => self.parse_number(),
            c if c.is_ascii_alphabetic() => self.parse_keyword(),
            _ => None,
        }
    }

    /// Items up to `close`; reports whether the last item had a trailing comma
    fn parse_sequence(&mut self, close: char) -> Option<(Vec<Value>, bool)> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Some((items, trailing_comma));
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            if self.eat(',') {
                trailing_comma = true;
                continue;
            }
            self.skip_ws();
            return if self.eat(close) { Some((items, false)) } else { None };
        }
    }

    fn parse_mapping(&mut self) -> Option<Value> {
        let mut map = BTreeMap::new();
        let mut set_items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                break;
            }
            let key = self.parse_value()?;
            self.skip_ws();
            if self.eat(':') {
                if !set_items.is_empty() {
                    return None;
                }
                let value = self.parse_value()?;
                let key = match key {
                    Value::String(s) => s,
                    other => other.to_literal(),
                };
                map.insert(key, value);
            } else {
                // `{1, 2}` set literal
                if !map.is_empty() {
                    return None;
                }
                set_items.push(key);
            }
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            self.skip_ws();
            if self.eat('}') {
                break;
            }
            return None;
        }
        if set_items.is_empty() {
            Some(Value::Map(map))
        } else {
            Some(Value::List(set_items))
        }
    }

    fn parse_keyword(&mut self) -> Option<Value> {
        let start = self.chars.peek()?.0;
        let mut end = start;
        while let Some((idx, c)) = self.chars.peek().copied() {
            if c.is_ascii_alphanumeric() || c == '_' {
                end = idx + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        match &self.src[start..end] {
            "True" | "true" => Some(Value::Bool(true)),
            "False" | "false" => Some(Value::Bool(false)),
            "None" | "null" => Some(Value::Null),
            _ => None,
        }
    }

    fn parse_number(&mut self) -> Option<Value> {
        let start = self.chars.peek()?.0;
        let mut end = start;
        let mut is_float = false;
        while let Some((idx, c)) = self.chars.peek().copied() {
            let accept = match c {
                '0'..='9' | '_' => true,
                '.' => {
                    is_float = true;
                    true
                }
                'e' | 'E' => {
                    is_float = true;
                    true
                }
                // Sign only at the start or right after an exponent marker
                '-' | '+' => idx == start || matches!(self.src[..idx].chars().last(), Some('e' | 'E')),
                _ => false,
            };
            if !accept {
                break;
            }
            end = idx + c.len_utf8();
            self.chars.next();
        }

        let raw = &self.src[start..end];
        if raw.contains('_') && !underscores_between_digits(raw) {
            return None;
        }
        let text = raw.replace('_', "");
        let text = text.as_str();
        let digits = text.trim_start_matches(['-', '+']);
        if digits.is_empty() || !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return None;
        }

        if is_float {
            return text.parse::<f64>().ok().filter(|f| f.is_finite()).map(Value::Float);
        }
        // Leading zeros are not a valid integer literal
        if digits.len() > 1 && digits.starts_with('0') {
            return None;
        }
        match text.parse::<i64>() {
            Ok(n) => Some(Value::Int(n)),
            Err(_) => text.parse::<f64>().ok().map(Value::Float),
        }
    }

    fn parse_string(&mut self) -> Option<String> {
        let (_, quote) = self.chars.next()?;
        let mut out = String::new();
        loop {
            let (_, c) = self.chars.next()?;
            if c == quote {
                return Some(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let (_, escaped) = self.chars.next()?;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                '\\' | '\'' | '"' | '/' => out.push(escaped),
                'u' => {
                    let mut code = String::with_capacity(4);
                    for _ in 0..4 {
                        code.push(self.chars.next()?.1);
                    }
                    let scalar = u32::from_str_radix(&code, 16).ok()?;
                    out.push(char::from_u32(scalar)?);
                }
                _ => return None,
            }
        }
    }
}

/// `1_000` is fine; `_1`, `1_`, `1__0` and `1_.5` are not
fn underscores_between_digits(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().all(|(i, b)| {
        *b != b'_'
            || (i > 0
                && bytes[i - 1].is_ascii_digit()
                && bytes.get(i + 1).is_some_and(|next| next.is_ascii_digit()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(Value::parse("5"), Value::Int(5));
        assert_eq!(Value::parse("-12"), Value::Int(-12));
        assert_eq!(Value::parse("2.5"), Value::Float(2.5));
        assert_eq!(Value::parse("1e3"), Value::Float(1000.0));
        assert_eq!(Value::parse("True"), Value::Bool(true));
        assert_eq!(Value::parse("false"), Value::Bool(false));
        assert_eq!(Value::parse("None"), Value::Null);
        assert_eq!(Value::parse("null"), Value::Null);
    }

    #[test]
    fn test_parse_strings() {
        assert_eq!(Value::parse("'hello'"), Value::String("hello".to_string()));
        assert_eq!(Value::parse("\"a\\nb\""), Value::String("a\nb".to_string()));
        assert_eq!(Value::parse("'it\\'s'"), Value::String("it's".to_string()));
    }

    #[test]
    fn test_parse_falls_back_to_original_text() {
        assert_eq!(Value::parse("hello world"), Value::String("hello world".to_string()));
        assert_eq!(Value::parse("007"), Value::String("007".to_string()));
        assert_eq!(Value::parse("[1, 2"), Value::String("[1, 2".to_string()));
        assert_eq!(Value::parse(""), Value::String(String::new()));
        assert_eq!(Value::parse("Truely"), Value::String("Truely".to_string()));
        assert_eq!(Value::parse("1 2"), Value::String("1 2".to_string()));
    }

    #[test]
    fn test_parse_collections() {
        assert_eq!(
            Value::parse("[1, 2, 3]"),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            Value::parse("[[1], ['a', None],]"),
            Value::List(vec![
                Value::List(vec![Value::Int(1)]),
                Value::List(vec![Value::String("a".to_string()), Value::Null]),
            ])
        );
        assert_eq!(Value::parse("(1, 2)"), Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(Value::parse("(7)"), Value::Int(7));
        assert_eq!(Value::parse("(7,)"), Value::List(vec![Value::Int(7)]));

        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), Value::Int(1));
        expected.insert("2".to_string(), Value::Bool(true));
        assert_eq!(Value::parse("{'a': 1, 2: True}"), Value::Map(expected));
    }

    #[test]
    fn test_parse_digit_groups() {
        assert_eq!(Value::parse("1_000"), Value::Int(1000));
        assert_eq!(Value::parse("-1_000_000"), Value::Int(-1_000_000));
        assert_eq!(Value::parse("1_000.5"), Value::Float(1000.5));
        assert_eq!(Value::parse("[10_0, 2]"), Value::List(vec![Value::Int(100), Value::Int(2)]));
        assert_eq!(Value::parse("1__0"), Value::String("1__0".to_string()));
        assert_eq!(Value::parse("1_"), Value::String("1_".to_string()));
        assert_eq!(Value::parse("1_.5"), Value::String("1_.5".to_string()));
    }

    #[test]
    fn test_deep_nesting_stays_a_string() {
        let unclosed = "[".repeat(200_000);
        assert_eq!(convert(Value::String(unclosed.clone())), Value::String(unclosed));

        let too_deep = format!("{}{}", "[".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        assert_eq!(Value::parse(&too_deep), Value::String(too_deep.clone()));

        let deepest = format!("{}1{}", "(".repeat(MAX_NESTING), ",)".repeat(MAX_NESTING));
        assert!(matches!(Value::parse(&deepest), Value::List(_)));
    }

    #[test]
    fn test_numeric_cross_compare() {
        assert_eq!(Value::Int(5), Value::Float(5.0));
        assert_ne!(Value::Int(5), Value::Float(5.5));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_ne!(Value::String("5".to_string()), Value::Int(5));
    }

    #[test]
    fn test_convert_makes_yielded_and_stored_lists_equal() {
        let yielded = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let stored = Value::String("[1, 2]".to_string());
        assert_eq!(convert(yielded), convert(stored));
    }

    #[test]
    fn test_convert_leaves_native_values_alone() {
        let list = Value::List(vec![Value::String("[1]".to_string())]);
        assert_eq!(convert(list.clone()), list);
    }

    #[test]
    fn test_literal_round_trip() {
        let samples = vec![
            Value::Int(42),
            Value::Float(-3.25),
            Value::Bool(true),
            Value::String("quote \" and 'apostrophe'".to_string()),
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::String("x".to_string())]),
            Value::List(vec![
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                Value::List(vec![]),
            ]),
        ];

        for value in samples {
            let literal = value.to_literal();
            assert_eq!(convert(Value::String(literal.clone())), value, "literal: {}", literal);
        }
    }

    #[test]
    fn test_serde_uses_natural_json_form() {
        let value = Value::parse("[1, 'two', {'k': None}]");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"[1,"two",{"k":null}]"#);

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
