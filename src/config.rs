//! Read-only configuration surface.
//!
//! This crate never reads a config file (that's explicitly out of
//! scope); callers hand in something that implements [`ConfigView`].
//! [`StaticConfig`] is an in-memory implementation useful for tests
//! and the example binary.

use hickory_resolver::proto::rr::rdata::tlsa::TLSA;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;

/// The kind of traffic a domain is configured to carry, per spec.md
/// §4.7's `transport_type() → {S2S, C2S, …}`. `Dialback::result` in
/// `examples/original_source/src/dialback.cc` rejects a `from` domain
/// outright if it isn't `S2S` ("Nice try.") — a component or C2S-only
/// domain has no business originating a server dialback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Ordinary federated server-to-server domain (the default for any
    /// domain this view has no opinion about).
    S2S,
    /// A client-only domain; cannot originate S2S dialback.
    C2S,
    /// An internal component address; cannot originate S2S dialback.
    Component,
}

/// A read-only view onto server policy, keyed by local domain.
pub trait ConfigView {
    /// Whether `domain` is one this server is authoritative for.
    fn is_local_domain(&self, domain: &str) -> bool;

    /// Whether TLS is required before dialback/auth may proceed for
    /// this local domain.
    fn requires_tls(&self, local_domain: &str) -> bool;

    /// Whether dialback authentication is permitted for `domain`
    /// (spec.md §4.4 step 6: "If the remote's configuration disallows
    /// dialback, reject with host-unknown.").
    fn auth_dialback(&self, domain: &str) -> bool;

    /// The transport class a domain is configured for; domains this
    /// view has no record of default to `S2S` (ordinary, unconfigured
    /// federation peers).
    fn transport_type(&self, domain: &str) -> TransportType;

    /// Static TLSA overrides for `domain`, consulted by `Route` when
    /// no DNS-discovered TLSA record exists yet (spec.md §4.7).
    fn tlsa(&self, domain: &str) -> Vec<TLSA>;

    /// Derive the dialback key for `(stream_id, to, from)`, per
    /// XEP-0220 §3.2: `HMAC-SHA1(secret, to + " " + from + " " + id)`
    /// hex-encoded. `secret` is the local domain's dialback secret.
    fn dialback_key(&self, stream_id: &str, to: &str, from: &str) -> String;
}

/// An in-memory `ConfigView`: one dialback secret per local domain.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    domains: HashMap<String, DomainConfig>,
}

/// Per-domain policy knobs.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Shared secret used to derive outgoing/verify dialback keys.
    pub dialback_secret: String,
    /// Require a secured (TLS) `NetSession` before authorizing a pair.
    pub require_tls: bool,
    /// Whether this domain will perform dialback at all.
    pub auth_dialback: bool,
    /// Transport class (defaults to `S2S` via `Default`).
    pub transport_type: TransportType,
    /// Statically configured TLSA overrides.
    pub tlsa: Vec<TLSA>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            dialback_secret: String::new(),
            require_tls: false,
            auth_dialback: true,
            transport_type: TransportType::S2S,
            tlsa: Vec::new(),
        }
    }
}

impl StaticConfig {
    /// An empty configuration with no local domains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local domain this server is authoritative for.
    pub fn with_domain(mut self, domain: impl Into<String>, config: DomainConfig) -> Self {
        self.domains.insert(domain.into(), config);
        self
    }
}

impl ConfigView for StaticConfig {
    fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    fn requires_tls(&self, local_domain: &str) -> bool {
        self.domains
            .get(local_domain)
            .map(|c| c.require_tls)
            .unwrap_or(false)
    }

    fn auth_dialback(&self, domain: &str) -> bool {
        self.domains
            .get(domain)
            .map(|c| c.auth_dialback)
            .unwrap_or(true)
    }

    fn transport_type(&self, domain: &str) -> TransportType {
        self.domains
            .get(domain)
            .map(|c| c.transport_type)
            .unwrap_or(TransportType::S2S)
    }

    fn tlsa(&self, domain: &str) -> Vec<TLSA> {
        self.domains
            .get(domain)
            .map(|c| c.tlsa.clone())
            .unwrap_or_default()
    }

    fn dialback_key(&self, stream_id: &str, to: &str, from: &str) -> String {
        let secret = self
            .domains
            .get(to)
            .map(|c| c.dialback_secret.as_str())
            .unwrap_or("");
        let mut mac =
            Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(to.as_bytes());
        mac.update(b" ");
        mac.update(from.as_bytes());
        mac.update(b" ");
        mac.update(stream_id.as_bytes());
        let bytes = mac.finalize().into_bytes();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialback_key_is_deterministic_and_domain_scoped() {
        let config = StaticConfig::new().with_domain(
            "example.com",
            DomainConfig {
                dialback_secret: "s3cr3t".into(),
                ..DomainConfig::default()
            },
        );
        let k1 = config.dialback_key("abc123", "example.com", "peer.example.net");
        let k2 = config.dialback_key("abc123", "example.com", "peer.example.net");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 40); // hex-encoded SHA-1

        let k3 = config.dialback_key("abc123", "other.example.com", "peer.example.net");
        assert_ne!(k1, k3);
    }
}
