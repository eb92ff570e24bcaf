//! Chat server resolution: server override parsing and SRV record lookup.
//!
//! Converts the configured server (explicit `tls://host:port`, `tcp://host:port`,
//! `host:port`) or the bare chat domain into candidate [`Endpoint`]s, sorted
//! per RFC 2782 so the caller can fall through on connection failure.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Standard client port (plain TCP, STARTTLS capable).
pub const DEFAULT_CLIENT_PORT: u16 = 5222;
/// Conventional direct TLS port.
pub const DIRECT_TLS_PORT: u16 = 5223;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP; the server may require a STARTTLS upgrade.
    Tcp,
    /// TLS from the first byte.
    DirectTls,
}

/// A dialable server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// Chat domain for TLS SNI when `host` is an SRV target or an explicit override.
    pub domain: Option<String>,
}

impl Endpoint {
    /// Name used for TLS SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedServer {
    /// Explicit endpoint, no SRV lookup.
    Direct(Endpoint),
    /// Domain only, resolve through SRV.
    Domain(String),
}

/// Split an optional `?domain=` parameter off a `host[:port]` string.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    if let Some((host_port, query)) = input.split_once('?') {
        let domain = query.strip_prefix("domain=").map(|d| d.to_string());
        (host_port, domain)
    } else {
        (input, None)
    }
}

fn direct(host_port: &str, default_port: u16, mode: ConnectionMode, domain: Option<String>) -> ParsedServer {
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (host_port, default_port),
        },
        None => (host_port, default_port),
    };
    ParsedServer::Direct(Endpoint {
        host: host.to_string(),
        port,
        mode,
        domain,
    })
}

/// Parse a server override.
///
/// - `tls://host[:port][?domain=d]` direct TLS, port 5223 by default
/// - `tcp://host[:port][?domain=d]` plain TCP, port 5222 by default
/// - `host:port` direct; port 5223 means TLS
/// - anything else is a domain for SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        let (host_port, domain) = split_domain_param(rest);
        return direct(host_port, DIRECT_TLS_PORT, ConnectionMode::DirectTls, domain);
    }

    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        let (host_port, domain) = split_domain_param(rest);
        return direct(host_port, DEFAULT_CLIENT_PORT, ConnectionMode::Tcp, domain);
    }

    if let Some((host, port_str)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            let mode = if port == DIRECT_TLS_PORT {
                ConnectionMode::DirectTls
            } else {
                ConnectionMode::Tcp
            };
            return ParsedServer::Direct(Endpoint {
                host: host.to_string(),
                port,
                mode,
                domain: None,
            });
        }
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// One SRV answer, reduced to what ordering needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Order SRV answers into endpoints: priority ascending, weight descending,
/// `.` targets dropped.
pub fn endpoints_from_srv(domain: &str, mut records: Vec<SrvRecord>) -> Vec<Endpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter_map(|r| {
            let target = r.target.trim_end_matches('.').to_string();
            if target.is_empty() {
                info!(domain, "SRV record with '.' target (service not available), skipping");
                return None;
            }
            Some(Endpoint {
                host: target,
                port: r.port,
                mode: ConnectionMode::Tcp,
                domain: Some(domain.to_string()),
            })
        })
        .collect()
}

/// Resolve `_xmpp-client._tcp.{domain}`, falling back to `domain:5222`.
pub async fn resolve_domain(domain: &str) -> Vec<Endpoint> {
    let resolve_started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, falling back to default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-client._tcp.{}", domain);
    let endpoints = match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => {
            let records = lookup
                .iter()
                .map(|r| SrvRecord {
                    priority: r.priority(),
                    weight: r.weight(),
                    target: r.target().to_string(),
                    port: r.port(),
                })
                .collect();
            endpoints_from_srv(domain, records)
        }
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(resolve_started), error = %e, "SRV lookup failed");
            Vec::new()
        }
    };

    if endpoints.is_empty() {
        warn!(
            domain,
            resolve_total_ms = elapsed_ms(resolve_started),
            "No SRV records found, using fallback: {}:{}",
            domain,
            DEFAULT_CLIENT_PORT
        );
        return vec![Endpoint {
            host: domain.to_string(),
            port: DEFAULT_CLIENT_PORT,
            mode: ConnectionMode::Tcp,
            domain: None,
        }];
    }

    info!(
        domain,
        total = endpoints.len(),
        resolve_total_ms = elapsed_ms(resolve_started),
        "SRV resolution complete"
    );
    endpoints
}

/// Candidate endpoints for a session: the explicit override when set, else SRV for `host`.
pub async fn resolve_endpoints(server: Option<&str>, host: &str) -> Vec<Endpoint> {
    match parse_server_input(server.unwrap_or(host)) {
        ParsedServer::Direct(endpoint) => {
            info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, "Using explicit endpoint");
            vec![endpoint]
        }
        ParsedServer::Domain(domain) => resolve_domain(&domain).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16, mode: ConnectionMode, domain: Option<&str>) -> ParsedServer {
        ParsedServer::Direct(Endpoint {
            host: host.to_string(),
            port,
            mode,
            domain: domain.map(str::to_string),
        })
    }

    // --- parse_server_input tests ---

    #[test]
    fn test_parse_tls_uri_with_port() {
        assert_eq!(
            parse_server_input("tls://chat.example.com:5270"),
            ep("chat.example.com", 5270, ConnectionMode::DirectTls, None)
        );
    }

    #[test]
    fn test_parse_tls_uri_no_port() {
        assert_eq!(
            parse_server_input("tls://chat.example.com"),
            ep("chat.example.com", 5223, ConnectionMode::DirectTls, None)
        );
    }

    #[test]
    fn test_parse_tcp_uri_with_and_without_port() {
        assert_eq!(
            parse_server_input("tcp://127.0.0.1:40000"),
            ep("127.0.0.1", 40000, ConnectionMode::Tcp, None)
        );
        assert_eq!(
            parse_server_input("tcp://chat.example.com"),
            ep("chat.example.com", 5222, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_host_port_infers_mode() {
        assert_eq!(
            parse_server_input("chat.example.com:5223"),
            ep("chat.example.com", 5223, ConnectionMode::DirectTls, None)
        );
        assert_eq!(
            parse_server_input("chat.example.com:5222"),
            ep("chat.example.com", 5222, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_bare_domain_with_whitespace() {
        assert_eq!(
            parse_server_input("  chat.hipchat.com  "),
            ParsedServer::Domain("chat.hipchat.com".to_string())
        );
    }

    #[test]
    fn test_parse_uri_with_domain_param() {
        assert_eq!(
            parse_server_input("tls://10.0.0.5:5223?domain=chat.example.com"),
            ep("10.0.0.5", 5223, ConnectionMode::DirectTls, Some("chat.example.com"))
        );
        assert_eq!(
            parse_server_input("tcp://10.0.0.5?domain=chat.example.com"),
            ep("10.0.0.5", 5222, ConnectionMode::Tcp, Some("chat.example.com"))
        );
    }

    #[test]
    fn test_split_domain_param_unknown_param() {
        let (host_port, domain) = split_domain_param("host:5223?other=value");
        assert_eq!(host_port, "host:5223");
        assert_eq!(domain, None);
    }

    // --- Endpoint tests ---

    #[test]
    fn test_endpoint_tls_name() {
        let mut endpoint = Endpoint {
            host: "xmpp1.example.com".to_string(),
            port: 5222,
            mode: ConnectionMode::Tcp,
            domain: Some("example.com".to_string()),
        };
        assert_eq!(endpoint.tls_name(), "example.com");
        endpoint.domain = None;
        assert_eq!(endpoint.tls_name(), "xmpp1.example.com");
        assert_eq!(endpoint.address(), "xmpp1.example.com:5222");
    }

    // --- SRV ordering tests ---

    #[test]
    fn test_srv_ordering_priority_then_weight() {
        let records = vec![
            SrvRecord { priority: 20, weight: 0, target: "c.example.com.".into(), port: 5222 },
            SrvRecord { priority: 10, weight: 5, target: "b.example.com.".into(), port: 5222 },
            SrvRecord { priority: 10, weight: 50, target: "a.example.com.".into(), port: 5223 },
        ];
        let endpoints = endpoints_from_srv("example.com", records);
        let hosts: Vec<&str> = endpoints.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com", "c.example.com"]);
        assert_eq!(endpoints[0].port, 5223);
        assert!(endpoints.iter().all(|e| e.tls_name() == "example.com"));
    }

    #[test]
    fn test_srv_dot_target_is_skipped() {
        let records = vec![SrvRecord { priority: 0, weight: 0, target: ".".into(), port: 0 }];
        assert!(endpoints_from_srv("example.com", records).is_empty());
    }

    // --- resolve_endpoints tests ---

    #[tokio::test]
    async fn test_resolve_explicit_override_skips_srv() {
        let endpoints = resolve_endpoints(Some("tcp://127.0.0.1:5999"), "chat.example.com").await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address(), "127.0.0.1:5999");
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_returns_fallback() {
        let endpoints = resolve_domain("this-domain-definitely-does-not-exist-xmpp-test.example").await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, DEFAULT_CLIENT_PORT);
        assert_eq!(endpoints[0].mode, ConnectionMode::Tcp);
        assert_eq!(endpoints[0].domain, None);
    }
}
