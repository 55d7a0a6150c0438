//! Federated XMPP server-to-server routing and dialback core.
//!
//! This crate implements the routing/authentication substrate of an
//! XMPP S2S listener: DNS-driven peer discovery (SRV/TLSA/DNSSEC),
//! session bookkeeping, XML stream negotiation, XEP-0220 server
//! dialback, and the per-domain-pair `Route` state machine that
//! decides whether a stanza may be delivered. It does not parse XML
//! from scratch (that's `rxml`/`minidom`/`xso`'s job), terminate TLS,
//! or implement SASL/C2S — see `SPEC_FULL.md` for the full boundary.
//!
//! Everything here is designed to run on a single
//! `tokio::task::LocalSet`: shared state is `Rc<RefCell<_>>`, not
//! `Arc<Mutex<_>>`, because ordering between routing decisions is
//! provided by the cooperative scheduler, not by locks.

pub mod config;
pub mod dialback;
pub mod dns;
pub mod error;
pub mod event;
pub mod ns;
pub mod registry;
pub mod route;
pub mod route_table;
pub mod session;
pub mod stanza;
pub mod xmlstream;

pub use error::Error;
