//! Response specs answered by backend fixtures.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::HarnessError;
use crate::language;

/// Largest generated body (`b@<n>`).
pub const MAX_GENERATED_BODY: usize = 16 * 1024 * 1024;

/// `<status>[:b'<body>'][:b@<n>][:h'<name>'='<value>']...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSpec {
    pub status: u16,
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
    /// Set when the body came from `b@<n>`.
    generated: Option<usize>,
}

impl ResponseSpec {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: Bytes::new(),
            headers: Vec::new(),
            generated: None,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self.generated = None;
        self
    }

    /// A body of `n` generated bytes.
    pub fn body_size(mut self, n: usize) -> Self {
        self.body = Bytes::from(vec![b'x'; n]);
        self.generated = Some(n);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

impl FromStr for ResponseSpec {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| HarnessError::InvalidSpec(format!("'{s}': {reason}"));
        let tokens = language::split(s).map_err(invalid)?;
        let mut tokens = tokens.into_iter();

        let status_token = tokens.next().unwrap_or_default();
        let status: u16 = status_token
            .parse()
            .map_err(|_| invalid(format!("invalid status '{status_token}'")))?;
        if !(100..=599).contains(&status) {
            return Err(invalid(format!("status {status} out of range")));
        }

        let mut spec = ResponseSpec::new(status);
        for token in tokens {
            if let Some(size) = token.strip_prefix("b@") {
                let n: usize = size
                    .parse()
                    .map_err(|_| invalid(format!("invalid body size '{size}'")))?;
                if n > MAX_GENERATED_BODY {
                    return Err(invalid(format!("body size {n} exceeds {MAX_GENERATED_BODY}")));
                }
                spec = spec.body_size(n);
            } else if let Some(quoted) = token.strip_prefix('b') {
                spec = spec.body(language::unquote(quoted).map_err(invalid)?);
            } else if let Some(pair) = token.strip_prefix('h') {
                let (name, value) = language::header(pair).map_err(invalid)?;
                spec.headers.push((name, value));
            } else {
                return Err(invalid(format!("unknown component '{token}'")));
            }
        }
        Ok(spec)
    }
}

impl fmt::Display for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        match self.generated {
            Some(n) => write!(f, ":b@{n}")?,
            None if !self.body.is_empty() => {
                write!(f, ":b{}", language::quote(&String::from_utf8_lossy(&self.body)))?
            }
            None => {}
        }
        for (name, value) in &self.headers {
            write!(f, ":h{}={}", language::quote(name), language::quote(value))?;
        }
        Ok(())
    }
}
