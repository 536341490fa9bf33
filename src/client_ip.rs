//! Client IP candidate resolution behind trusted proxies.
//!
//! Forwarded headers are spoofable, so they are only consulted when the
//! immediate peer is one of the configured trusted proxies. Candidates are
//! returned in configured-header order, most trustworthy first, with the
//! peer address itself appended last.

use cidr::IpCidr;
use hyper::HeaderMap;
use smallvec::SmallVec;
use std::net::IpAddr;
use thiserror::Error;

/// Header whose value is a comma-separated chain rather than one address.
const MULTI_VALUE_HEADER: &str = "x-forwarded-for";

pub type CandidateVec = SmallVec<[String; 4]>;

#[derive(Error, Debug)]
pub enum TrustedProxyError {
    #[error(r#"trusted proxy entry "{0}" is neither "*", a CIDR range nor an IP address"#)]
    InvalidEntry(String),
}

/// Set of peers allowed to supply client-identifying headers.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    trust_any: bool,
    networks: Vec<IpCidr>,
}

impl TrustedProxies {
    /// Parse proxy specifications: exact addresses, CIDR ranges, or the
    /// `"*"` wildcard meaning every peer is trusted.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, TrustedProxyError> {
        let mut trust_any = false;
        let mut networks = Vec::with_capacity(specs.len());
        for spec in specs {
            let spec = spec.as_ref().trim();
            if spec.is_empty() {
                continue;
            }
            if spec == "*" {
                trust_any = true;
                continue;
            }
            let network = if spec.contains('/') {
                spec.parse::<IpCidr>()
                    .map_err(|_| TrustedProxyError::InvalidEntry(spec.to_owned()))?
            } else {
                let address: IpAddr = spec
                    .parse()
                    .map_err(|_| TrustedProxyError::InvalidEntry(spec.to_owned()))?;
                IpCidr::new_host(address)
            };
            networks.push(network);
        }
        Ok(Self { trust_any, networks })
    }

    /// An empty proxy set trusts nobody; the wildcard trusts everybody.
    pub fn is_trusted(&self, address: &str) -> bool {
        if self.trust_any {
            return true;
        }
        let Ok(address) = address.parse::<IpAddr>() else {
            return false;
        };
        self.networks.iter().any(|network| network.contains(&address))
    }
}

pub struct ClientIpResolver {
    trusted_proxies: TrustedProxies,
    forwarded_headers: Vec<String>,
}

impl ClientIpResolver {
    pub fn new(trusted_proxies: TrustedProxies, forwarded_headers: Vec<String>) -> Self {
        let forwarded_headers = if forwarded_headers.is_empty() {
            Self::default_forwarded_headers()
        } else {
            forwarded_headers
        };
        Self {
            trusted_proxies,
            forwarded_headers,
        }
    }

    pub fn default_forwarded_headers() -> Vec<String> {
        ["CF-Connecting-IP", "True-Client-IP", "X-Forwarded-For", "X-Real-IP"]
            .map(String::from)
            .to_vec()
    }

    /// Produce the ordered list of client address candidates for a request.
    ///
    /// Header values are not validated as addresses here; the lookup layer
    /// tolerates malformed input. Pure function over its inputs.
    pub fn resolve_candidates(&self, peer_address: &str, headers: &HeaderMap) -> CandidateVec {
        let mut candidates = CandidateVec::new();
        let peer_address = peer_address.trim();

        if !peer_address.is_empty() && self.trusted_proxies.is_trusted(peer_address) {
            for header_name in &self.forwarded_headers {
                let Some(value) = headers.get(header_name.as_str()) else {
                    continue;
                };
                let Ok(value) = value.to_str() else {
                    continue;
                };
                if value.trim().is_empty() {
                    continue;
                }
                if header_name.eq_ignore_ascii_case(MULTI_VALUE_HEADER) {
                    for part in value.split(',') {
                        let part = part.trim();
                        if !part.is_empty() {
                            push_unique(&mut candidates, part);
                        }
                    }
                } else {
                    push_unique(&mut candidates, value.trim());
                }
            }
        }

        if !peer_address.is_empty() {
            push_unique(&mut candidates, peer_address);
        }

        candidates
    }
}

fn push_unique(candidates: &mut CandidateVec, candidate: &str) {
    if !candidates.iter().any(|existing| existing == candidate) {
        candidates.push(candidate.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(proxies: &[&str], headers: &[&str]) -> ClientIpResolver {
        ClientIpResolver::new(
            TrustedProxies::from_specs(proxies).unwrap(),
            headers.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn uses_forwarded_headers_only_for_trusted_proxy() {
        let resolver = resolver(
            &["10.0.0.0/8"],
            &["CF-Connecting-IP", "True-Client-IP", "X-Forwarded-For", "X-Real-IP"],
        );
        let headers = header_map(&[
            ("CF-Connecting-IP", "3.3.3.3"),
            ("True-Client-IP", "4.4.4.4"),
            ("X-Forwarded-For", "1.1.1.1, 2.2.2.2"),
            ("X-Real-IP", "5.5.5.5"),
        ]);

        let candidates = resolver.resolve_candidates("10.0.0.1", &headers);
        assert_eq!(
            candidates.as_slice(),
            ["3.3.3.3", "4.4.4.4", "1.1.1.1", "2.2.2.2", "5.5.5.5", "10.0.0.1"]
        );
    }

    #[test]
    fn configured_header_order_is_priority_order() {
        let resolver = resolver(&["10.0.0.0/8"], &["CF-Connecting-IP", "X-Forwarded-For"]);
        let headers = header_map(&[
            ("CF-Connecting-IP", "3.3.3.3"),
            ("X-Forwarded-For", "1.1.1.1, 2.2.2.2"),
        ]);

        let candidates = resolver.resolve_candidates("10.0.0.1", &headers);
        assert_eq!(
            candidates.as_slice(),
            ["3.3.3.3", "1.1.1.1", "2.2.2.2", "10.0.0.1"]
        );
    }

    #[test]
    fn ignores_headers_for_untrusted_peer() {
        let resolver = resolver(&["10.0.0.0/8"], &["X-Forwarded-For"]);
        let headers = header_map(&[("X-Forwarded-For", "1.1.1.1, 2.2.2.2")]);

        let candidates = resolver.resolve_candidates("203.0.113.10", &headers);
        assert_eq!(candidates.as_slice(), ["203.0.113.10"]);
    }

    #[test]
    fn wildcard_trusts_every_peer() {
        let resolver = resolver(&["*"], &["X-Forwarded-For"]);
        let headers = header_map(&[("X-Forwarded-For", "1.1.1.1")]);

        let candidates = resolver.resolve_candidates("203.0.113.10", &headers);
        assert_eq!(candidates.as_slice(), ["1.1.1.1", "203.0.113.10"]);
    }

    #[test]
    fn empty_proxy_set_trusts_nobody() {
        let resolver = resolver(&[], &["X-Forwarded-For"]);
        let headers = header_map(&[("X-Forwarded-For", "1.1.1.1")]);

        let candidates = resolver.resolve_candidates("10.0.0.1", &headers);
        assert_eq!(candidates.as_slice(), ["10.0.0.1"]);
    }

    #[test]
    fn exact_proxy_entry_matches_single_address() {
        let resolver = resolver(&["192.0.2.7"], &["X-Real-IP"]);
        let headers = header_map(&[("X-Real-IP", "5.5.5.5")]);

        assert_eq!(
            resolver.resolve_candidates("192.0.2.7", &headers).as_slice(),
            ["5.5.5.5", "192.0.2.7"]
        );
        assert_eq!(
            resolver.resolve_candidates("192.0.2.8", &headers).as_slice(),
            ["192.0.2.8"]
        );
    }

    #[test]
    fn empty_peer_yields_no_candidates() {
        let resolver = resolver(&["*"], &["X-Forwarded-For"]);
        let headers = header_map(&[("X-Forwarded-For", "1.1.1.1")]);

        assert!(resolver.resolve_candidates("", &headers).is_empty());
    }

    #[test]
    fn deduplicates_preserving_first_occurrence() {
        let resolver = resolver(&["10.0.0.0/8"], &["X-Forwarded-For", "X-Real-IP"]);
        let headers = header_map(&[
            ("X-Forwarded-For", "1.1.1.1, 2.2.2.2, 1.1.1.1"),
            ("X-Real-IP", "2.2.2.2"),
        ]);

        let candidates = resolver.resolve_candidates("10.0.0.1", &headers);
        assert_eq!(candidates.as_slice(), ["1.1.1.1", "2.2.2.2", "10.0.0.1"]);
    }

    #[test]
    fn skips_blank_header_values_and_parts() {
        let resolver = resolver(&["10.0.0.0/8"], &["True-Client-IP", "X-Forwarded-For"]);
        let headers = header_map(&[
            ("True-Client-IP", "  "),
            ("X-Forwarded-For", "1.1.1.1, , 2.2.2.2,"),
        ]);

        let candidates = resolver.resolve_candidates("10.0.0.1", &headers);
        assert_eq!(candidates.as_slice(), ["1.1.1.1", "2.2.2.2", "10.0.0.1"]);
    }

    #[test]
    fn default_headers_used_when_none_configured() {
        let resolver = ClientIpResolver::new(
            TrustedProxies::from_specs(&["10.0.0.0/8"]).unwrap(),
            Vec::new(),
        );
        let headers = header_map(&[("True-Client-IP", "4.4.4.4")]);

        let candidates = resolver.resolve_candidates("10.0.0.1", &headers);
        assert_eq!(candidates.as_slice(), ["4.4.4.4", "10.0.0.1"]);
    }

    #[test]
    fn rejects_invalid_proxy_specs() {
        assert!(TrustedProxies::from_specs(&["not-a-network"]).is_err());
        assert!(TrustedProxies::from_specs(&["10.0.0.0/33"]).is_err());
    }
}
