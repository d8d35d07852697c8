//! Request specs: `<method>:'<target>'[:h'<name>'='<value>']...[:b'<body>']`.

use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;
use crate::language;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub method: String,
    /// Request target written verbatim: `/path` or `http://host:port/path`.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RequestSpec {
    pub fn new(method: &str, target: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            target: target.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn is_absolute(&self) -> bool {
        self.target.contains("://")
    }
}

impl FromStr for RequestSpec {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| HarnessError::InvalidSpec(format!("'{s}': {reason}"));
        let tokens = language::split(s).map_err(invalid)?;
        if tokens.len() < 2 {
            return Err(invalid("expected <method>:'<target>'".to_string()));
        }

        let method = &tokens[0];
        if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid(format!("invalid method '{method}'")));
        }
        let target = language::unquote(&tokens[1]).map_err(invalid)?;
        let mut spec = RequestSpec::new(method, target);

        for token in &tokens[2..] {
            if let Some(pair) = token.strip_prefix('h') {
                let (name, value) = language::header(pair).map_err(invalid)?;
                spec.headers.push((name, value));
            } else if let Some(quoted) = token.strip_prefix('b') {
                spec.body = language::unquote(quoted).map_err(invalid)?;
            } else {
                return Err(invalid(format!("unknown component '{token}'")));
            }
        }
        Ok(spec)
    }
}

impl fmt::Display for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method.to_ascii_lowercase(), language::quote(&self.target))?;
        for (name, value) in &self.headers {
            write!(f, ":h{}={}", language::quote(name), language::quote(value))?;
        }
        if !self.body.is_empty() {
            write!(f, ":b{}", language::quote(&self.body))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let spec: RequestSpec = "get:'/p/200'".parse().unwrap();
        assert_eq!(spec.method, "GET");
        assert_eq!(spec.target, "/p/200");
        assert!(!spec.is_absolute());
    }

    #[test]
    fn test_parse_absolute_with_headers_and_body() {
        let spec: RequestSpec = "post:'http://127.0.0.1:9000/p/200':h'Host'='127.0.0.1:9000':b'payload'"
            .parse()
            .unwrap();
        assert_eq!(spec.method, "POST");
        assert!(spec.is_absolute());
        assert!(spec.has_header("host"));
        assert_eq!(spec.body, "payload");
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["get", "g3t:'/'", "get:/", "get:'/':x'1'", ":'/'"] {
            assert!(matches!(
                bad.parse::<RequestSpec>(),
                Err(HarnessError::InvalidSpec(_))
            ), "{bad}");
        }
    }

    #[test]
    fn test_display_parses_back() {
        let spec = RequestSpec::get("/p/200").header("X-A", "1").body("x:y");
        assert_eq!(spec.to_string(), "get:'/p/200':h'X-A'='1':b'x:y'");
        assert_eq!(spec.to_string().parse::<RequestSpec>().unwrap(), spec);
    }
}
