//! HTTP client construction, response checks and SSRF protection.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::{Client, Response};
use url::Url;

use leadharvest_shared::{HarvestError, Result};

/// Build the shared HTTP client. `cookies` keeps a session jar (needed for
/// form postback sessions).
pub fn build_client(user_agent: &str, timeout: Duration, cookies: bool) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .cookie_store(cookies)
        .build()
        .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))
}

/// Map a transport error to [`HarvestError::Network`].
pub fn network_error(url: &str, err: reqwest::Error) -> HarvestError {
    HarvestError::Network(format!("{url}: {err}"))
}

/// Fail on non-success statuses, then read the body.
pub async fn read_body(url: &str, response: Response) -> Result<String> {
    let status = response.status();
    if !status.is_success() {
        return Err(HarvestError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    response
        .text()
        .await
        .map_err(|e| HarvestError::Network(format!("{url}: body read failed: {e}")))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssrf_blocks_non_http_schemes() {
        let url = Url::parse("file:///etc/passwd").unwrap();
        assert!(is_ssrf_target(&url));
    }

    #[test]
    fn ssrf_blocks_private_ips() {
        for u in [
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://[::1]/",
            "http://100.64.0.7/",
        ] {
            let url = Url::parse(u).unwrap();
            assert!(is_ssrf_target(&url), "{u} should be blocked");
        }
    }

    #[test]
    fn ssrf_blocks_local_hostnames() {
        let url = Url::parse("http://localhost:3000/api").unwrap();
        assert!(is_ssrf_target(&url));
        let url = Url::parse("https://printer.local/").unwrap();
        assert!(is_ssrf_target(&url));
    }

    #[test]
    fn ssrf_allows_public_hosts() {
        let url = Url::parse("https://remax.ca/contact").unwrap();
        assert!(!is_ssrf_target(&url));
    }

    #[tokio::test]
    async fn read_body_maps_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/gone"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = build_client("test", Duration::from_secs(5), false).unwrap();
        let url = format!("{}/gone", server.uri());
        let resp = client.get(&url).send().await.unwrap();
        let err = read_body(&url, resp).await.unwrap_err();
        assert!(matches!(err, HarvestError::Http { status: 503, .. }));
        assert!(err.is_transient());
    }
}
