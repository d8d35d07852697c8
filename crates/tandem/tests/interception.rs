//! Proxy behavior visible to tests: authentication, embedded apps, request
//! form enforcement, client certificates and third-party clients.

use std::fs;
use std::sync::Arc;

use tandem::engine::{
    tls, Flow, InterceptHandler, LogEntry, Reply, X_TANDEM_APP, X_TANDEM_ERROR,
};
use tandem::{
    logging, Harness, HarnessConfig, HarnessError, RequestSpec, TestClient, TopologyClient,
    TopologyKind,
};

fn setup(config: HarnessConfig) -> Harness {
    logging::init();
    Harness::setup(config).expect("harness setup")
}

#[tokio::test]
async fn test_basic_auth_rejects_then_forwards() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Explicit).with_auth("alice", "secret"));
    harness.reset();

    let anonymous = TopologyClient::new(
        harness.kind(),
        false,
        harness.proxy().addr(),
        harness.server().addr(),
    );
    let response = anonymous.pathod("200", None).await.unwrap();
    assert_eq!(response.status, 407);
    assert_eq!(
        response.header("proxy-authenticate"),
        Some("Basic realm=\"tandem\"")
    );
    assert!(harness.server().log().is_empty());
    assert_eq!(harness.proxy().log().len(), 1);
    assert!(harness.proxy().log()[0].contains("-> 407"));

    let client = harness.case();
    let response = client.pathod("200:b'welcome'", None).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "welcome");

    let recorded = harness.server().last_request().unwrap();
    assert_eq!(recorded.header("proxy-authorization"), None);
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_basic_auth_guards_connect() {
    let mut harness = setup(
        HarnessConfig::new(TopologyKind::Explicit)
            .with_tls(true)
            .with_auth("alice", "secret"),
    );
    harness.reset();

    let err = TestClient::new(harness.proxy().addr())
        .tunnel(harness.server().addr().to_string())
        .tls(None)
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Protocol(ref msg) if msg.contains("407")), "{err}");

    let client = harness.case();
    let response = client.pathod("200", None).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(harness.server().last_request().unwrap().tls);
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_chain_forwards_credentials_to_last_hop() {
    for tls in [false, true] {
        let mut harness = setup(
            HarnessConfig::new(TopologyKind::Chain)
                .with_tls(tls)
                .with_chain_length(2)
                .with_auth("alice", "secret"),
        );
        let client = harness.case();
        let response = client.pathod("200", None).await.unwrap();
        assert_eq!(response.status, 200, "tls={tls}");

        let recorded = harness.server().last_request().unwrap();
        assert_eq!(recorded.header("proxy-authorization"), None, "tls={tls}");
        harness.teardown().unwrap();
    }
}

#[tokio::test]
async fn test_onboarding_app_in_every_topology() {
    for kind in TopologyKind::ALL {
        for tls in [false, true] {
            let mut harness = setup(HarnessConfig::new(kind).with_tls(tls));
            let client = harness.case();

            let response = client.app("/").await.unwrap();
            assert_eq!(response.status, 200, "{kind} tls={tls}");
            assert!(response.text().contains("proxy certificate"), "{kind} tls={tls}");
            assert_eq!(response.header(X_TANDEM_APP.as_str()), Some("onboarding"));

            let response = client.app("/cert/pem").await.unwrap();
            let expected = fs::read_to_string(harness.confdir().join(tls::CERT_FILE)).unwrap();
            assert_eq!(response.text(), expected, "{kind} tls={tls}");

            assert!(harness.server().log().is_empty(), "{kind} tls={tls}");
            assert_eq!(harness.proxy().log().len(), 2, "{kind} tls={tls}");
            harness.teardown().unwrap();
        }
    }
}

#[tokio::test]
async fn test_app_errors_become_500() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Explicit));
    let client = harness.case();
    let mut conn = client.connect(None).await.unwrap();

    let response = conn
        .request(&RequestSpec::get("http://testapp/"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "testapp");

    let response = conn
        .request(&RequestSpec::get("http://testapp/error"))
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.header(X_TANDEM_ERROR.as_str()), Some("true"));
    assert!(response.text().contains("Error in application testapp"));

    let response = conn
        .request(&RequestSpec::get("http://errapp/anything"))
        .await
        .unwrap();
    assert_eq!(response.status, 500);

    let log = harness.proxy().log();
    assert_eq!(log.len(), 3);
    assert!(log[1].contains("-> 500 Error in application testapp"), "{}", log[1]);
    assert!(log[2].contains("errapp"), "{}", log[2]);
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_app_disabled() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Reverse).with_apps(false));
    let client = harness.case();
    assert!(matches!(
        client.app("/").await,
        Err(HarnessError::AppsDisabled)
    ));
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_test_apps_survive_disabling_onboarding() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Explicit).with_apps(false));
    let client = harness.case();
    let mut conn = client.connect(None).await.unwrap();

    let response = conn
        .request(&RequestSpec::get("http://testapp/"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "testapp");

    let response = conn
        .request(&RequestSpec::get("http://errapp/"))
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert!(harness.server().log().is_empty());
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_relative_form_rejected_by_explicit_proxy() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Explicit));
    harness.reset();

    let mut conn = TestClient::new(harness.proxy().addr()).connect().await.unwrap();
    let request = RequestSpec::get("/p/200").header("Host", harness.server().addr().to_string());
    let response = conn.request(&request).await.unwrap();
    assert_eq!(response.status, 400);
    assert!(response
        .text()
        .contains("expected absolute form, got relative form"));

    let log = harness.proxy().log();
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("-> 400"), "{}", log[0]);
    assert!(harness.server().log().is_empty());
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_absolute_form_rejected_by_reverse_proxy() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Reverse));
    harness.reset();

    let mut conn = TestClient::new(harness.proxy().addr()).connect().await.unwrap();
    let target = format!("{}/p/200", harness.server().urlbase());
    let response = conn.request(&RequestSpec::get(target)).await.unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(harness.proxy().log().len(), 1);
    assert!(harness.server().log().is_empty());
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_client_certificate_reaches_backend() {
    let certs = tempfile::tempdir().unwrap();
    let (cert, key) = tls::generate_pem(&[]).unwrap();
    fs::write(certs.path().join("127.0.0.1.pem"), format!("{cert}{key}")).unwrap();

    for kind in [TopologyKind::Explicit, TopologyKind::Reverse] {
        let mut harness = setup(
            HarnessConfig::new(kind)
                .with_tls(true)
                .with_client_certs(certs.path()),
        );
        let client = harness.case();
        let response = client.pathod("200", None).await.unwrap();
        assert_eq!(response.status, 200, "{kind}");

        let recorded = harness.server().last_request().unwrap();
        assert!(recorded.tls, "{kind}");
        assert!(recorded.client_cert, "{kind}");
        harness.teardown().unwrap();
    }
}

#[tokio::test]
async fn test_no_client_certificate_without_matching_file() {
    let certs = tempfile::tempdir().unwrap();
    let mut harness = setup(
        HarnessConfig::new(TopologyKind::Explicit)
            .with_tls(true)
            .with_client_certs(certs.path()),
    );
    let client = harness.case();
    client.pathod("200", None).await.unwrap();
    assert!(!harness.server().last_request().unwrap().client_cert);
    harness.teardown().unwrap();
}

#[tokio::test]
async fn test_reqwest_through_explicit_proxy() {
    let mut harness = setup(HarnessConfig::new(TopologyKind::Explicit));
    harness.reset();

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(harness.proxies()).unwrap())
        .build()
        .unwrap();
    let response = client
        .get(format!("{}/p/200:b'reqwest'", harness.server().urlbase()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "reqwest");

    assert_eq!(harness.server().log().len(), 1);
    let log = harness.proxy().log();
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("GET http://127.0.0.1:"), "{}", log[0]);
    harness.teardown().unwrap();
}

/// Kills every flow at one hook.
struct Killer {
    on_request: bool,
}

impl InterceptHandler for Killer {
    fn request(&self, _flow: &Flow) -> Reply {
        if self.on_request {
            Reply::Kill
        } else {
            Reply::Continue
        }
    }

    fn response(&self, _flow: &Flow) -> Reply {
        if self.on_request {
            Reply::Continue
        } else {
            Reply::Kill
        }
    }

    fn log(&self, _entry: &LogEntry) -> Reply {
        Reply::Continue
    }
}

#[tokio::test]
async fn test_killed_request_never_reaches_backend() {
    for kind in [TopologyKind::Explicit, TopologyKind::Chain] {
        logging::init();
        let mut harness = Harness::setup_with_handler(
            HarnessConfig::new(kind),
            Arc::new(Killer { on_request: true }),
        )
        .unwrap();
        let client = harness.case();

        let response = client.pathod("200", None).await.unwrap();
        assert_eq!(response.status, 502, "{kind}");
        assert!(response.text().contains("Flow killed"), "{kind}");
        assert!(harness.server().log().is_empty(), "{kind}");

        let log = harness.proxy().log();
        assert_eq!(log.len(), 1, "{kind}: {log:?}");
        assert!(log[0].contains("-> 502"), "{kind}: {}", log[0]);
        harness.teardown().unwrap();
    }
}

#[tokio::test]
async fn test_killed_response_replaced_with_502() {
    logging::init();
    let mut harness = Harness::setup_with_handler(
        HarnessConfig::new(TopologyKind::Reverse),
        Arc::new(Killer { on_request: false }),
    )
    .unwrap();
    let client = harness.case();

    let response = client.pathod("200:b'hidden'", None).await.unwrap();
    assert_eq!(response.status, 502);
    assert_ne!(response.text(), "hidden");
    assert_eq!(harness.server().log().len(), 1);

    let log = harness.proxy().log();
    assert_eq!(log.len(), 1, "{log:?}");
    assert!(log[0].contains("-> 502 Flow killed"), "{}", log[0]);
    assert_eq!(harness.proxy().flows().len(), 1);
    harness.teardown().unwrap();
}
