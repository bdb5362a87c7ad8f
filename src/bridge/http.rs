use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use super::CapabilityError;

/// Outbound (or, for HTTP triggers, inbound) HTTP request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Performs the requests scripts make through `api.http.fetch`.
#[async_trait]
pub trait HttpEgress: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError>;
}

/// Host names that always resolve to cloud metadata services.
const METADATA_HOSTS: &[&str] = &[
    "metadata",
    "metadata.google.internal",
    "metadata.azure.internal",
    "instance-data",
];

/// Decides which URLs scripts may reach.
///
/// Loopback, link-local, unspecified and metadata-service destinations are
/// always denied; private ranges are denied unless `allow_private` is set.
/// Only literal addresses are checked, names are not resolved.
#[derive(Clone, Debug, Default)]
pub struct EgressPolicy {
    pub allow_private: bool,
    pub denied_hosts: Vec<String>,
}

impl EgressPolicy {
    pub fn deny_host(mut self, host: impl Into<String>) -> Self {
        self.denied_hosts.push(host.into().to_ascii_lowercase());
        self
    }

    pub fn check(&self, raw: &str) -> Result<Url, CapabilityError> {
        let url = Url::parse(raw)
            .map_err(|e| CapabilityError::InvalidArgument(format!("invalid URL '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CapabilityError::Denied(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }

        let denied = match url.host() {
            None => true,
            Some(Host::Domain(domain)) => self.domain_denied(domain),
            Some(Host::Ipv4(ip)) => self.ip_denied(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => self.ip_denied(IpAddr::V6(ip)),
        };

        if denied {
            return Err(CapabilityError::Denied(format!(
                "destination '{}' is not reachable from scripts",
                url.host_str().unwrap_or_default()
            )));
        }
        Ok(url)
    }

    fn domain_denied(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        domain == "localhost"
            || domain.ends_with(".localhost")
            || METADATA_HOSTS.contains(&domain.as_str())
            || self.denied_hosts.iter().any(|h| *h == domain)
    }

    fn ip_denied(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.ipv4_denied(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.ipv4_denied(v4),
                None => self.ipv6_denied(v6),
            },
        }
    }

    fn ipv4_denied(&self, ip: Ipv4Addr) -> bool {
        if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast() {
            return true;
        }
        // Alibaba Cloud metadata
        if ip == Ipv4Addr::new(100, 100, 100, 200) {
            return true;
        }
        !self.allow_private && ip.is_private()
    }

    fn ipv6_denied(&self, ip: Ipv6Addr) -> bool {
        let first = ip.segments()[0];
        let link_local = first & 0xffc0 == 0xfe80;
        let unique_local = first & 0xfe00 == 0xfc00;
        // AWS metadata over IPv6
        if ip == Ipv6Addr::new(0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254) {
            return true;
        }
        if ip.is_loopback() || ip.is_unspecified() || link_local {
            return true;
        }
        !self.allow_private && unique_local
    }
}

/// [`HttpEgress`] backed by a shared `reqwest::Client`.
///
/// Redirects are not followed, so a permitted host cannot bounce a script
/// to a denied one.
#[derive(Clone, Debug)]
pub struct ReqwestEgress {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl ReqwestEgress {
    pub fn new(timeout: Duration) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("tenant-runtime-quickjs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CapabilityError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_body_bytes: 1024 * 1024,
        })
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}

#[async_trait]
impl HttpEgress for ReqwestEgress {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| {
                CapabilityError::InvalidArgument(format!("invalid method '{}'", request.method))
            })?;

        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(Bytes::from(body));
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| CapabilityError::Backend(format!("fetch failed: {e}")))?;

        let status = response.status();
        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.to_string(), v.to_string());
            }
        }

        let too_large = |len: u64| {
            CapabilityError::Backend(format!(
                "response body of {len} bytes exceeds {} bytes",
                self.max_body_bytes
            ))
        };
        if let Some(len) = response.content_length() {
            if len > self.max_body_bytes as u64 {
                return Err(too_large(len));
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CapabilityError::Backend(format!("failed to read response body: {e}")))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("OK").to_string(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
