//! Proxy authentication.

use base64::Engine;
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};

/// Credential check applied to proxy-addressed requests.
pub trait Authenticator: Send + Sync {
    /// Whether the request headers carry acceptable credentials.
    fn authenticate(&self, headers: &HeaderMap) -> bool;

    /// Remove credentials before the request is forwarded.
    fn clean(&self, headers: &mut HeaderMap) {
        headers.remove(PROXY_AUTHORIZATION);
    }

    /// Headers sent with the 407 challenge.
    fn challenge_headers(&self) -> HeaderMap;
}

/// HTTP Basic proxy authentication against a single user.
#[derive(Debug, Clone)]
pub struct BasicProxyAuth {
    username: String,
    password: String,
    realm: String,
}

impl BasicProxyAuth {
    pub fn new(username: &str, password: &str, realm: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm.to_string(),
        }
    }

    /// `Proxy-Authorization` value for the given credentials.
    pub fn header_value(username: &str, password: &str) -> String {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        format!("Basic {token}")
    }

    fn parse(value: &str) -> Option<(String, String)> {
        let (scheme, token) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

impl Authenticator for BasicProxyAuth {
    fn authenticate(&self, headers: &HeaderMap) -> bool {
        headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
            .map(|(user, pass)| user == self.username && pass == self.password)
            .unwrap_or(false)
    }

    fn challenge_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", self.realm)) {
            headers.insert(PROXY_AUTHENTICATE, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_accepts_valid_credentials() {
        let auth = BasicProxyAuth::new("alice", "secret", "tandem");
        let headers = headers_with(&BasicProxyAuth::header_value("alice", "secret"));
        assert!(auth.authenticate(&headers));
    }

    #[test]
    fn test_rejects_wrong_password_and_missing_header() {
        let auth = BasicProxyAuth::new("alice", "secret", "tandem");
        assert!(!auth.authenticate(&headers_with(&BasicProxyAuth::header_value("alice", "nope"))));
        assert!(!auth.authenticate(&HeaderMap::new()));
        assert!(!auth.authenticate(&headers_with("Bearer abc")));
        assert!(!auth.authenticate(&headers_with("Basic !!!notbase64")));
    }

    #[test]
    fn test_password_may_contain_colon() {
        let auth = BasicProxyAuth::new("alice", "se:cret", "tandem");
        assert!(auth.authenticate(&headers_with(&BasicProxyAuth::header_value("alice", "se:cret"))));
    }

    #[test]
    fn test_clean_strips_credentials() {
        let auth = BasicProxyAuth::new("alice", "secret", "tandem");
        let mut headers = headers_with(&BasicProxyAuth::header_value("alice", "secret"));
        auth.clean(&mut headers);
        assert!(headers.get(PROXY_AUTHORIZATION).is_none());
    }

    #[test]
    fn test_challenge_names_realm() {
        let auth = BasicProxyAuth::new("alice", "secret", "lab");
        let headers = auth.challenge_headers();
        assert_eq!(headers.get(PROXY_AUTHENTICATE).unwrap(), "Basic realm=\"lab\"");
    }
}
