//! SSRF checks for tool request URLs.
//!
//! Tool URLs are tenant-authored templates, so the final URL is only known
//! after argument substitution. [`validate_tool_url`] runs on that final URL
//! and rejects anything that could reach the caller's own network:
//! - schemes other than http/https
//! - literal private, loopback, link-local or otherwise reserved IPs
//! - `localhost`-style and internal-only hostnames
//!
//! [`check_resolved_host`] additionally resolves a hostname and rejects it if
//! any address is private. It is used by direct egress, where this process
//! opens the connection itself; the returned addresses are the only ones the
//! connection may use.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme '{0}' is not allowed")]
    SchemeNotAllowed(String),

    #[error("URL must have a host")]
    MissingHost,

    #[error("URL must not carry credentials")]
    EmbeddedCredentials,

    #[error("URL targets private/internal IP address: {0}")]
    PrivateIpDetected(IpAddr),

    #[error("URL targets internal hostname: {0}")]
    InternalHostname(String),

    #[error("Failed to resolve hostname: {0}")]
    DnsResolutionFailed(String),
}

/// What a tool URL may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlPolicy {
    /// Permit plain `http`
    pub allow_http: bool,
    /// Skip private-address and internal-hostname checks (local development only)
    pub allow_private: bool,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allow_http: true,
            allow_private: false,
        }
    }
}

/// True for IPv4 ranges a tool must never reach.
///
/// Covers loopback, RFC 1918, link-local, broadcast, unspecified,
/// TEST-NET documentation ranges, CGNAT (100.64.0.0/10) and the
/// benchmarking block (198.18.0.0/15).
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        || (a == 100 && (b & 0xC0) == 64)
        || (a == 198 && (b == 18 || b == 19))
        // "this network" 0.0.0.0/8
        || a == 0
}

/// True for IPv6 ranges a tool must never reach, including IPv4-mapped
/// forms of private IPv4 addresses.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = embedded_ipv4(ip) {
        return is_private_ipv4(&v4);
    }
    let first = ip.segments()[0];
    let second = ip.segments()[1];
    ip.is_loopback()
        || ip.is_unspecified()
        // fe80::/10
        || (first & 0xFFC0) == 0xFE80
        // fc00::/7
        || (first & 0xFE00) == 0xFC00
        // 2001:db8::/32
        || (first == 0x2001 && second == 0x0DB8)
}

/// IPv4 address carried inside an IPv6 one: IPv4-mapped (`::ffff:a.b.c.d`),
/// IPv4-compatible (`::a.b.c.d`) or NAT64 well-known prefix (`64:ff9b::/96`).
fn embedded_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let s = ip.segments();
    let tail = Ipv4Addr::new(
        (s[6] >> 8) as u8,
        s[6] as u8,
        (s[7] >> 8) as u8,
        s[7] as u8,
    );
    match s {
        [0, 0, 0, 0, 0, 0, _, _] => Some(tail),
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(tail),
        _ => None,
    }
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Hostnames that name the local machine or an internal-only zone.
pub fn is_internal_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    matches!(
        host.as_str(),
        "localhost" | "localhost.localdomain" | "ip6-localhost" | "ip6-loopback" | "metadata"
    ) || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}

/// Validate a fully-resolved tool URL without touching the network.
///
/// Returns the parsed URL on success.
///
/// # Example
/// ```
/// use waav_realtime::utils::url_validation::{UrlPolicy, validate_tool_url};
///
/// assert!(validate_tool_url("https://api.example.com/quote", &UrlPolicy::default()).is_ok());
/// assert!(validate_tool_url("http://127.0.0.1/admin", &UrlPolicy::default()).is_err());
/// assert!(validate_tool_url("file:///etc/passwd", &UrlPolicy::default()).is_err());
/// ```
pub fn validate_tool_url(url: &str, policy: &UrlPolicy) -> Result<Url, UrlValidationError> {
    let parsed = Url::parse(url.trim())?;

    match parsed.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        other => return Err(UrlValidationError::SchemeNotAllowed(other.to_string())),
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(UrlValidationError::EmbeddedCredentials);
    }

    let host = parsed.host().ok_or(UrlValidationError::MissingHost)?;
    if policy.allow_private {
        return Ok(parsed.clone());
    }

    match host {
        Host::Ipv4(ip) if is_private_ipv4(&ip) => {
            warn!(ip = %ip, "Tool URL targets private IPv4 address");
            Err(UrlValidationError::PrivateIpDetected(IpAddr::V4(ip)))
        }
        Host::Ipv6(ip) if is_private_ipv6(&ip) => {
            warn!(ip = %ip, "Tool URL targets private IPv6 address");
            Err(UrlValidationError::PrivateIpDetected(IpAddr::V6(ip)))
        }
        Host::Domain(name) if is_internal_hostname(name) => {
            warn!(host = %name, "Tool URL targets internal hostname");
            Err(UrlValidationError::InternalHostname(name.to_string()))
        }
        _ => Ok(parsed.clone()),
    }
}

/// Name resolution used before a direct tool call.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolves through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Resolve the URL's hostname and reject it if any address is private.
///
/// Returns the vetted addresses so the caller can pin its connection to
/// them. Literal IP hosts are checked without a lookup and return an empty
/// list. With `allow_private` the hostname is still resolved but not checked.
pub async fn check_resolved_host(
    url: &Url,
    policy: &UrlPolicy,
    resolver: &dyn HostResolver,
) -> Result<Vec<SocketAddr>, UrlValidationError> {
    let domain = match url.host() {
        Some(Host::Domain(d)) => d.to_string(),
        Some(Host::Ipv4(ip)) => {
            if !policy.allow_private {
                check_addr(IpAddr::V4(ip), &ip.to_string())?;
            }
            return Ok(Vec::new());
        }
        Some(Host::Ipv6(ip)) => {
            if !policy.allow_private {
                check_addr(IpAddr::V6(ip), &ip.to_string())?;
            }
            return Ok(Vec::new());
        }
        None => return Err(UrlValidationError::MissingHost),
    };

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = resolver
        .lookup(&domain, port)
        .await
        .map_err(|e| UrlValidationError::DnsResolutionFailed(format!("{}: {}", domain, e)))?;

    if addrs.is_empty() {
        return Err(UrlValidationError::DnsResolutionFailed(format!(
            "No addresses found for {}",
            domain
        )));
    }

    if !policy.allow_private {
        for addr in &addrs {
            check_addr(addr.ip(), &domain)?;
        }
    }
    Ok(addrs)
}

fn check_addr(ip: IpAddr, host: &str) -> Result<(), UrlValidationError> {
    if is_private_ip(&ip) {
        warn!(
            host = %host,
            resolved_ip = %ip,
            "Tool host resolves to private IP address (SSRF protection)"
        );
        return Err(UrlValidationError::PrivateIpDetected(ip));
    }
    Ok(())
}
