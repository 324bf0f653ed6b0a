//! Balanced-brace scanning over text that may contain JSON with string
//! escapes. Hand-written so nested arguments never trigger regex
//! backtracking.

/// Find the `{` that opens the object containing the byte at `key_idx`,
/// scanning backwards.
pub fn find_object_start_before(text: &str, key_idx: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = key_idx;
    loop {
        if bytes[i] == b'{' {
            return Some(i);
        }
        if i == 0 {
            return None;
        }
        i -= 1;
    }
}

/// Given `text[start] == '{'`, find the index of the matching closing brace.
/// Tracks string state with standard escape handling; braces inside strings
/// are ignored. Returns `None` when the object is not closed within `text`.
pub fn find_balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Length of the longest non-empty suffix of `buffer` that is a proper
/// prefix of `token`. Used during streaming to hold back text that might be
/// the start of a trigger split across chunks.
pub fn partial_token_suffix(buffer: &str, token: &str) -> usize {
    let max = token.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        if !buffer.is_char_boundary(buffer.len() - len) {
            continue;
        }
        if token.starts_with(&buffer[buffer.len() - len..]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_end_simple() {
        let text = r#"{"a": 1}"#;
        assert_eq!(find_balanced_object_end(text, 0), Some(text.len() - 1));
    }

    #[test]
    fn test_balanced_end_braces_in_strings() {
        let text = r#"{"a": "{not a brace}", "b": {"c": 2}} trailing"#;
        let end = find_balanced_object_end(text, 0).unwrap();
        assert_eq!(&text[..=end], r#"{"a": "{not a brace}", "b": {"c": 2}}"#);
    }

    #[test]
    fn test_balanced_end_escaped_quote() {
        let text = r#"{"a": "say \"hi\" {ok}"}"#;
        assert_eq!(find_balanced_object_end(text, 0), Some(text.len() - 1));
    }

    #[test]
    fn test_unclosed_returns_none() {
        assert_eq!(find_balanced_object_end(r#"{"a": {"b": 1}"#, 0), None);
    }

    #[test]
    fn test_object_start_before_key() {
        let text = r#"prefix {"function_call": {"name": "x"}}"#;
        let key = text.find("\"function_call\"").unwrap();
        assert_eq!(find_object_start_before(text, key), Some(7));
    }

    #[test]
    fn test_partial_token_suffix() {
        assert_eq!(partial_token_suffix("some text TOOL C", "TOOL CALL"), 6);
        assert_eq!(partial_token_suffix("nothing here", "TOOL CALL"), 0);
        assert_eq!(partial_token_suffix("ends with ``", "```"), 2);
        // A complete token is not a partial.
        assert_eq!(partial_token_suffix("TOOL CALL", "TOOL CALL"), 0);
    }
}
