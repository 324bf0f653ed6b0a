//! Permissive JSON parser.
//!
//! Accepts the dialects LLMs actually produce and normalizes them into a
//! [`Value`]:
//!
//! - single-quoted strings and keys
//! - unquoted (bare) keys and scalar tokens
//! - trailing commas and missing commas
//! - unterminated strings and unclosed containers at end of input
//! - a dangling `key:` with no value (becomes `null`)
//!
//! The repairer never guesses beyond the text it was given; input without a
//! recognizable JSON value is an error, not an empty object.

use serde_json::{Map, Number, Value};

use crate::JsonRepairError;

/// Parse `input` permissively. Returns the first JSON value found.
pub fn repair_json(input: &str) -> Result<Value, JsonRepairError> {
    let chars: Vec<char> = input.chars().collect();
    let mut parser = Repairer { chars, pos: 0 };
    parser.skip_noise();
    if parser.at_end() {
        return Err(JsonRepairError::Unrepairable(
            "empty input".to_string(),
        ));
    }
    parser.parse_value()
}

struct Repairer {
    chars: Vec<char>,
    pos: usize,
}

impl Repairer {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    /// Skip whitespace, BOMs and stray control characters.
    fn skip_noise(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || ch == '\u{FEFF}' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, JsonRepairError> {
        self.skip_noise();
        match self.peek() {
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('"') | Some('\'') => Ok(Value::String(self.parse_string())),
            Some(ch) if ch == '-' || ch == '+' || ch.is_ascii_digit() => Ok(self.parse_number()),
            Some(_) => Ok(self.parse_bare_token()),
            None => Ok(Value::Null),
        }
    }

    fn parse_object(&mut self) -> Result<Value, JsonRepairError> {
        self.bump(); // '{'
        let mut map = Map::new();

        loop {
            self.skip_noise();
            match self.peek() {
                None => break, // unclosed object at EOF: close implicitly
                Some('}') => {
                    self.bump();
                    break;
                }
                Some(',') => {
                    self.bump();
                    continue;
                }
                _ => {}
            }

            let pos_before_key = self.pos;
            let key = self.parse_key();
            self.skip_noise();

            let value = match self.peek() {
                Some(':') => {
                    self.bump();
                    self.skip_noise();
                    match self.peek() {
                        // `"key":}` or `"key":,` or `"key":<EOF>` -> null
                        Some('}') | Some(',') | None => Value::Null,
                        _ => self.parse_value()?,
                    }
                }
                // No colon at all: tolerate and bind the key to null.
                _ => Value::Null,
            };

            if !key.is_empty() {
                map.insert(key, value);
            } else if self.pos == pos_before_key {
                // Garbage that neither forms a key nor a value: step over it
                // so the loop always makes progress.
                self.bump();
            }
        }

        Ok(Value::Object(map))
    }

    fn parse_array(&mut self) -> Result<Value, JsonRepairError> {
        self.bump(); // '['
        let mut items = Vec::new();

        loop {
            self.skip_noise();
            match self.peek() {
                None => break,
                Some(']') => {
                    self.bump();
                    break;
                }
                Some(',') => {
                    self.bump();
                    continue;
                }
                _ => items.push(self.parse_value()?),
            }
        }

        Ok(Value::Array(items))
    }

    fn parse_key(&mut self) -> String {
        self.skip_noise();
        match self.peek() {
            Some('"') | Some('\'') => self.parse_string(),
            _ => {
                // Bare key: read up to the colon or a structural character.
                let mut key = String::new();
                while let Some(ch) = self.peek() {
                    if ch == ':' || ch == ',' || ch == '}' || ch == '{' || ch.is_whitespace() {
                        break;
                    }
                    key.push(ch);
                    self.pos += 1;
                }
                key
            }
        }
    }

    /// Parse a quoted string. The opening quote determines the closing quote;
    /// an unterminated string runs to end of input.
    fn parse_string(&mut self) -> String {
        let quote = self.bump().unwrap_or('"');
        let mut out = String::new();

        while let Some(ch) = self.bump() {
            if ch == quote {
                return out;
            }
            if ch == '\\' {
                match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('u') => {
                        let mut code = String::new();
                        for _ in 0..4 {
                            match self.peek() {
                                Some(h) if h.is_ascii_hexdigit() => {
                                    code.push(h);
                                    self.pos += 1;
                                }
                                _ => break,
                            }
                        }
                        if let Some(parsed) =
                            u32::from_str_radix(&code, 16).ok().and_then(char::from_u32)
                        {
                            out.push(parsed);
                        }
                    }
                    Some(other) => out.push(other),
                    None => break,
                }
                continue;
            }
            out.push(ch);
        }
        // Unterminated string near EOF: keep what we have.
        out
    }

    fn parse_number(&mut self) -> Value {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '-' | '+') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let text = text.trim_start_matches('+');

        if let Ok(int) = text.parse::<i64>() {
            return Value::Number(Number::from(int));
        }
        if let Ok(float) = text.parse::<f64>() {
            if let Some(number) = Number::from_f64(float) {
                return Value::Number(number);
            }
        }
        Value::String(text.to_string())
    }

    /// Bare token: `true`/`false`/`null` (any case) or an unquoted string.
    fn parse_bare_token(&mut self) -> Value {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if matches!(ch, ',' | '}' | ']' | ':' | '\n' | '\r') {
                break;
            }
            self.pos += 1;
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        let trimmed = token.trim();

        match trimmed.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" | "none" => Value::Null,
            "" => Value::Null,
            _ => Value::String(trimmed.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_json_parses_identically() {
        let value = repair_json(r#"{"a": [1, 2.5, "x"], "b": {"c": null}}"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2.5, "x"], "b": {"c": null}}));
    }

    #[test]
    fn test_single_quotes() {
        let value = repair_json(r#"{'name': 'test', 'count': 3}"#).unwrap();
        assert_eq!(value, json!({"name": "test", "count": 3}));
    }

    #[test]
    fn test_trailing_comma() {
        assert_eq!(repair_json(r#"[1, 2, 3,]"#).unwrap(), json!([1, 2, 3]));
        assert_eq!(repair_json(r#"{"a": 1,}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_unquoted_keys() {
        let value = repair_json(r#"{name: "x", count: 2}"#).unwrap();
        assert_eq!(value, json!({"name": "x", "count": 2}));
    }

    #[test]
    fn test_unterminated_string_at_eof() {
        let value = repair_json(r#"{"message": "cut off mid strea"#).unwrap();
        assert_eq!(value, json!({"message": "cut off mid strea"}));
    }

    #[test]
    fn test_unclosed_containers() {
        let value = repair_json(r#"{"a": [1, 2"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_dangling_colon_becomes_null() {
        let value = repair_json(r#"{"a": 1, "b":"#).unwrap();
        assert_eq!(value, json!({"a": 1, "b": null}));
    }

    #[test]
    fn test_escapes_preserved() {
        let value = repair_json(r#"{"s": "line\nbreak \"quoted\" A"}"#).unwrap();
        assert_eq!(value, json!({"s": "line\nbreak \"quoted\" A"}));
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(repair_json("").is_err());
        assert!(repair_json("   \n ").is_err());
    }

    #[test]
    fn test_bare_literals() {
        assert_eq!(repair_json("true").unwrap(), json!(true));
        assert_eq!(repair_json("False").unwrap(), json!(false));
        assert_eq!(repair_json("null").unwrap(), json!(null));
    }
}
