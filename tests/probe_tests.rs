//! Version prober behavior against mocked backends.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use odoo_mcp::VersionProber;
use odoo_mcp::rpc::Protocol;
use odoo_mcp::version::Edition;

fn prober(uri: &str) -> VersionProber {
    VersionProber::new(uri, "prod", "svc", "secret").with_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn all_probes_failing_assumes_14_with_xmlrpc() {
    // A server that answers nothing useful.
    let server = MockServer::start().await;
    let (version, protocol) = prober(&server.uri()).probe().await;
    assert_eq!(version.major, 14);
    assert_eq!(protocol, Protocol::LegacyXml);
}

#[tokio::test]
async fn xmlrpc_version_probe_selects_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/xmlrpc/2/common"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                "<?xml version=\"1.0\"?><methodResponse><params><param><value><struct>",
                "<member><name>server_version</name><value><string>15.0</string></value></member>",
                "</struct></value></param></params></methodResponse>",
            ),
            "text/xml",
        ))
        .mount(&server)
        .await;

    let (version, protocol) = prober(&server.uri()).probe().await;
    assert_eq!(version.major, 15);
    assert_eq!(protocol, Protocol::LegacyXml);
}

#[tokio::test]
async fn jsonrpc_session_probe_reads_server_version() {
    let server = MockServer::start().await;
    // First probe (XML-RPC) gets nothing useful; second succeeds.
    Mock::given(method("POST"))
        .and(path("/web/session/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "uid": 2,
                "server_version": "18.0+e",
                "server_version_info": [18, 0, 0, "final", 0, "e"],
            },
        })))
        .mount(&server)
        .await;

    let (version, protocol) = prober(&server.uri()).probe().await;
    assert_eq!(version.major, 18);
    assert_eq!(version.edition, Edition::Enterprise);
    assert_eq!(protocol, Protocol::LegacyJson);
}

#[tokio::test]
async fn login_page_generator_meta_is_last_resort() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/web/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><head><meta name=\"generator\" content=\"Odoo 19.0\"/></head><body/></html>",
        ))
        .mount(&server)
        .await;

    let (version, protocol) = prober(&server.uri()).probe().await;
    assert_eq!(version.major, 19);
    assert_eq!(protocol, Protocol::ModernRest);
}
