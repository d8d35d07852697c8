//! Header names and helpers used by the engine.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE};
use hyper::Response;

/// Marks a response produced by an embedded application.
pub static X_TANDEM_APP: HeaderName = HeaderName::from_static("x-tandem-app");
/// Set on responses the proxy generated itself (rejections, errors).
pub static X_TANDEM_ERROR: HeaderName = HeaderName::from_static("x-tandem-error");
pub static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
pub static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

pub static VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

/// Remove connection-scoped headers before a request leaves the proxy.
///
/// `Proxy-Authorization` is deliberately left alone: only the hop that
/// authenticates strips it.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(&PROXY_CONNECTION);
    headers.remove(&KEEP_ALIVE);
    headers.remove(CONNECTION);
    headers.remove(PROXY_AUTHENTICATE);
}

/// Extension trait for setting headers on responses.
pub trait HeadersExt {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);

    /// Returns false if `value` is not a valid header value.
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool;
}

impl<B> HeadersExt for Response<B> {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers_mut().insert(name.clone(), value.clone());
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                self.headers_mut().insert(name.clone(), header_value);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::PROXY_AUTHORIZATION;

    #[test]
    fn test_strip_hop_headers_keeps_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(&PROXY_CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert("x-custom", HeaderValue::from_static("1"));

        strip_hop_headers(&mut headers);

        assert!(headers.get(&PROXY_CONNECTION).is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get(PROXY_AUTHORIZATION).is_some());
        assert_eq!(headers.get("x-custom").unwrap(), "1");
    }

    #[test]
    fn test_set_header_value() {
        let mut response = Response::new(Full::new(Bytes::new()));
        assert!(response.set_header_value(&X_TANDEM_APP, "testapp"));
        assert_eq!(response.headers().get(&X_TANDEM_APP).unwrap(), "testapp");
        assert!(!response.set_header_value(&X_TANDEM_APP, "bad\nvalue"));

        response.set_header(&X_TANDEM_ERROR, &VALUE_TRUE);
        assert_eq!(response.headers().get(&X_TANDEM_ERROR).unwrap(), "true");
    }
}
