//! Tokenizer for the compact request/response spec language.
//!
//! A spec is a list of `:`-separated tokens. Values are single-quoted and
//! may contain `:`; inside quotes a backslash escapes the next character.
//!
//! ```text
//! 200:b'hello':h'X-Test'='1'
//! get:'/p/200':h'Host'='example.test'
//! ```

/// Split a spec on `:` outside quotes.
pub(crate) fn split(spec: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;

    for c in spec.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => {
                current.push(c);
                escaped = true;
            }
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            ':' if !in_quote => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_quote {
        return Err(format!("unterminated quote in '{spec}'"));
    }
    tokens.push(current);
    Ok(tokens)
}

/// Read one quoted value from the start of `s`, returning it and the rest.
fn take_quoted(s: &str) -> Result<(String, &str), String> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, '\'')) => {}
        _ => return Err(format!("expected quoted value, got '{s}'")),
    }

    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '\'' {
            return Ok((value, &s[i + 1..]));
        } else {
            value.push(c);
        }
    }
    Err(format!("unterminated quote in '{s}'"))
}

/// Parse a token that is exactly one quoted value.
pub(crate) fn unquote(token: &str) -> Result<String, String> {
    let (value, rest) = take_quoted(token)?;
    if !rest.is_empty() {
        return Err(format!("unexpected trailing characters '{rest}'"));
    }
    Ok(value)
}

/// Parse `'name'='value'`.
pub(crate) fn header(token: &str) -> Result<(String, String), String> {
    let (name, rest) = take_quoted(token)?;
    let rest = rest
        .strip_prefix('=')
        .ok_or_else(|| format!("expected '=' after header name in '{token}'"))?;
    let value = unquote(rest)?;
    if name.is_empty() {
        return Err("empty header name".to_string());
    }
    Ok((name, value))
}

/// Quote `value`, escaping quotes and backslashes.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Percent-encode the characters of `spec` that may not appear in a path.
pub(crate) fn encode_path(spec: &str) -> String {
    let mut out = String::with_capacity(spec.len());
    let mut buf = [0u8; 4];
    for c in spec.chars() {
        if c.is_ascii_alphanumeric() || "-._~!$&'()*+,;=:@/".contains(c) {
            out.push(c);
        } else {
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
        }
    }
    out
}
