//! DNS resolver facade: SRV targets, addresses, and TLSA (DANE)
//! records, collated with a DNSSEC-validity flag.
//!
//! Grounded on `tokio-xmpp`'s `connect::dns` module, generalized from
//! "connect a socket" to "hand `Route` everything it needs to decide
//! whether to trust what DNS said" — the DNSSEC/TLSA collation itself
//! stays `Route`'s job (see `src/route.rs`), per the Non-goals this
//! facade only resolves and reports.

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::proto::rr::rdata::tlsa::TLSA;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;

/// One SRV target, sorted by the usual priority/weight ordering
/// `srv_lookup` already applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// Target hostname, e.g. `xmpp1.example.com.`.
    pub host: String,
    /// Target port, usually 5269 for `_xmpp-server._tcp`.
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Result of an SRV lookup: the ordered target list plus whether the
/// answer was DNSSEC-validated.
#[derive(Debug, Clone, Default)]
pub struct SrvResult {
    pub targets: Vec<SrvTarget>,
    pub dnssec_valid: bool,
}

/// Result of a TLSA lookup for one `_port._tcp.host` name.
#[derive(Debug, Clone, Default)]
pub struct TlsaResult {
    pub records: Vec<TLSA>,
    pub dnssec_valid: bool,
}

/// A resolved address set for a hostname.
#[derive(Debug, Clone, Default)]
pub struct AddrResult {
    pub addrs: Vec<IpAddr>,
    pub dnssec_valid: bool,
}

/// Thin async wrapper over a `hickory_resolver::TokioAsyncResolver`.
pub struct Resolver {
    inner: TokioAsyncResolver,
    /// Whether this resolver was built with `ResolverOpts::validate`
    /// set, i.e. whether it runs DNSSEC validation at all.
    ///
    /// This is a resolver-level config echo, not a per-answer
    /// validity bit: `hickory_resolver::Lookup` (what `srv_lookup`/
    /// `lookup_ip`/`tlsa_lookup` return) carries only the query, its
    /// records, and a TTL deadline — no `authentic_data`/`ad` flag from
    /// the underlying `DnsResponse` is surfaced through that type in
    /// hickory-resolver/hickory-proto 0.24. With a validating resolver,
    /// a lookup failing DNSSEC validation does surface as a
    /// `ResolveError` rather than succeeding silently, but a domain
    /// with no DNSSEC signing at all ("insecure", not "bogus") still
    /// succeeds here and is reported `dnssec_valid: true` — a known,
    /// scoped approximation of the real per-response bit, not the thing
    /// itself.
    validating: bool,
}

impl Resolver {
    /// Build a resolver from the system's `/etc/resolv.conf`, with
    /// DNSSEC validation enabled.
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Resolver {
            inner,
            validating: false,
        })
    }

    /// Build a resolver against explicit servers, with DNSSEC
    /// validation toggled on or off.
    pub fn new(config: ResolverConfig, mut opts: ResolverOpts, validate: bool) -> Self {
        opts.validate = validate;
        let inner = TokioAsyncResolver::tokio(config, opts);
        Resolver {
            inner,
            validating: validate,
        }
    }

    /// `_xmpp-server._tcp.<domain>` SRV lookup (RFC 6120 §3.2.1).
    pub async fn lookup_srv(&self, domain: &str) -> Result<SrvResult, ResolveError> {
        let name = format!("_xmpp-server._tcp.{}", domain.trim_end_matches('.'));
        let lookup = self.inner.srv_lookup(name).await?;
        let mut targets: Vec<SrvTarget> = lookup
            .iter()
            .map(|srv| SrvTarget {
                host: srv.target().to_string(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect();
        targets.sort_by_key(|t| (t.priority, std::cmp::Reverse(t.weight)));
        Ok(SrvResult {
            targets,
            dnssec_valid: self.validating,
        })
    }

    /// A/AAAA lookup for a single hostname (SRV target or the bare
    /// domain when no SRV record exists).
    pub async fn lookup_addrs(&self, host: &str) -> Result<AddrResult, ResolveError> {
        let lookup = self.inner.lookup_ip(host).await?;
        Ok(AddrResult {
            addrs: lookup.iter().collect(),
            dnssec_valid: self.validating,
        })
    }

    /// TLSA lookup for `_<port>._tcp.<host>`, used to DANE-pin a
    /// connection target discovered via SRV.
    pub async fn lookup_tlsa(&self, host: &str, port: u16) -> Result<TlsaResult, ResolveError> {
        let name = format!("_{}._tcp.{}", port, host.trim_end_matches('.'));
        let lookup = self.inner.tlsa_lookup(name).await?;
        Ok(TlsaResult {
            records: lookup.iter().cloned().collect(),
            dnssec_valid: self.validating,
        })
    }
}
