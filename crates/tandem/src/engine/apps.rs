//! Embedded applications served by the proxy itself.
//!
//! Requests whose destination matches a registered `(host, port)` never
//! leave the proxy. The harness registers `testapp` and `errapp` for
//! exercising the success and error paths, plus the onboarding app that
//! hands out the proxy certificate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};

use crate::config::{APP_HOST, APP_PORT};

pub const TESTAPP_HOST: &str = "testapp";
pub const ERRAPP_HOST: &str = "errapp";

#[derive(Debug, Clone)]
pub struct AppRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl AppResponse {
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn html(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/html; charset=utf-8",
            body: body.into(),
        }
    }
}

/// Failure inside an application. The proxy answers with a 500.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct AppError(pub String);

pub trait App: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, req: &AppRequest) -> Result<AppResponse, AppError>;
}

/// Applications keyed by virtual `(host, port)`.
#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: Arc<HashMap<(String, u16), Arc<dyn App>>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `testapp` and `errapp` on port 80.
    pub fn with_test_apps() -> Self {
        Self::new()
            .add(TESTAPP_HOST, 80, Arc::new(TestApp))
            .add(ERRAPP_HOST, 80, Arc::new(ErrApp))
    }

    pub fn add(mut self, host: &str, port: u16, app: Arc<dyn App>) -> Self {
        Arc::make_mut(&mut self.apps).insert((host.to_ascii_lowercase(), port), app);
        self
    }

    /// Register the onboarding app at `APP_HOST:APP_PORT`.
    pub fn with_onboarding(self, cert_pem: String) -> Self {
        self.add(APP_HOST, APP_PORT, Arc::new(OnboardingApp::new(cert_pem)))
    }

    pub fn find(&self, host: &str, port: u16) -> Option<&Arc<dyn App>> {
        self.apps.get(&(host.to_ascii_lowercase(), port))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .apps
            .iter()
            .map(|((host, port), app)| format!("{}@{}:{}", app.name(), host, port))
            .collect();
        names.sort();
        f.debug_list().entries(names).finish()
    }
}

/// Answers `/` with `testapp`; `/error` fails.
pub struct TestApp;

impl App for TestApp {
    fn name(&self) -> &str {
        TESTAPP_HOST
    }

    fn call(&self, req: &AppRequest) -> Result<AppResponse, AppError> {
        match req.path.as_str() {
            "/" => Ok(AppResponse::text(StatusCode::OK, "testapp")),
            "/error" => Err(AppError("testapp error".to_string())),
            _ => Ok(AppResponse::text(StatusCode::NOT_FOUND, "not found")),
        }
    }
}

/// Fails every request.
pub struct ErrApp;

impl App for ErrApp {
    fn name(&self) -> &str {
        ERRAPP_HOST
    }

    fn call(&self, _req: &AppRequest) -> Result<AppResponse, AppError> {
        Err(AppError("errapp always fails".to_string()))
    }
}

/// Certificate onboarding: an index page and the proxy certificate.
pub struct OnboardingApp {
    cert_pem: String,
}

impl OnboardingApp {
    pub fn new(cert_pem: String) -> Self {
        Self { cert_pem }
    }
}

impl App for OnboardingApp {
    fn name(&self) -> &str {
        "onboarding"
    }

    fn call(&self, req: &AppRequest) -> Result<AppResponse, AppError> {
        match req.path.as_str() {
            "/" => Ok(AppResponse::html(format!(
                "<html><head><title>{APP_HOST}</title></head><body>\
                 <h1>Install the proxy certificate</h1>\
                 <a href=\"/cert/pem\">PEM</a></body></html>"
            ))),
            "/cert/pem" => Ok(AppResponse {
                status: StatusCode::OK,
                content_type: "application/x-x509-ca-cert",
                body: Bytes::from(self.cert_pem.clone()),
            }),
            _ => Ok(AppResponse::text(StatusCode::NOT_FOUND, "not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> AppRequest {
        AppRequest {
            method: Method::GET,
            path: path.to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let apps = AppRegistry::with_test_apps();
        assert_eq!(apps.len(), 2);
        assert!(apps.find("testapp", 80).is_some());
        assert!(apps.find("TESTAPP", 80).is_some());
        assert!(apps.find("testapp", 8080).is_none());
        assert!(AppRegistry::default().is_empty());
    }

    #[test]
    fn test_add_does_not_affect_clones() {
        let base = AppRegistry::with_test_apps();
        let extended = base.clone().with_onboarding("PEM".to_string());
        assert_eq!(base.len(), 2);
        assert_eq!(extended.len(), 3);
        assert!(extended.find(APP_HOST, APP_PORT).is_some());
    }

    #[test]
    fn test_testapp_pages() {
        let resp = TestApp.call(&get("/")).unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, Bytes::from_static(b"testapp"));
        assert!(TestApp.call(&get("/error")).is_err());
        assert_eq!(TestApp.call(&get("/nope")).unwrap().status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_errapp_fails() {
        assert_eq!(
            ErrApp.call(&get("/")).unwrap_err(),
            AppError("errapp always fails".to_string())
        );
    }

    #[test]
    fn test_onboarding_serves_cert() {
        let app = OnboardingApp::new("-----BEGIN CERTIFICATE-----".to_string());
        let resp = app.call(&get("/cert/pem")).unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"-----BEGIN CERTIFICATE-----"));
        let index = app.call(&get("/")).unwrap();
        assert!(String::from_utf8_lossy(&index.body).contains("/cert/pem"));
    }

    #[test]
    fn test_debug_lists_apps() {
        let debug = format!("{:?}", AppRegistry::with_test_apps());
        assert!(debug.contains("testapp@testapp:80"));
        assert!(debug.contains("errapp@errapp:80"));
    }
}
