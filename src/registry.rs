//! Session registry: tracks every live `NetSession`, indexed three
//! ways, exactly as `Router::session_by_stream_id` /
//! `session_by_domain` / `session_by_address` do in
//! `examples/original_source/src/router.cc`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::rc::Rc;

use minidom::Element;

use crate::session::{Direction, NetSession};
use crate::xmlstream::{self, StreamHeader, Timeouts};

/// `(host, port)` key for sessions indexed by where we connected (or
/// who connected to us).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

type Dispatch = Rc<dyn Fn(NetSession, Element)>;

/// Shared registry of live `NetSession`s.
#[derive(Default)]
pub struct SessionRegistry {
    by_address: RefCell<HashMap<Address, NetSession>>,
    by_stream_id: RefCell<HashMap<String, NetSession>>,
    by_domain: RefCell<HashMap<String, NetSession>>,
    /// How a freshly connected/accepted session's inbound elements get
    /// routed to feature handlers (dialback, in this crate). Set once
    /// via [`Self::set_dispatch`] by whatever wires the server
    /// together; `connect`/`accept` are the only things that read it.
    dispatch: RefCell<Option<Dispatch>>,
}

impl SessionRegistry {
    /// An empty registry with no inbound-element dispatcher set yet.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register the callback that `connect`/`accept`-created sessions
    /// hand every inbound top-level element to. Mirrors the
    /// "registered feature handlers keyed by XML namespace"
    /// dispatch spec.md §4.3 describes for `XMLStream`; this crate has
    /// exactly one feature (dialback), so the dispatcher itself does
    /// the namespace check (see `dialback::handle_element`).
    pub fn set_dispatch(&self, f: impl Fn(NetSession, Element) + 'static) {
        *self.dispatch.borrow_mut() = Some(Rc::new(f));
    }

    fn dispatch_element(&self, session: NetSession, element: Element) {
        let dispatch = self.dispatch.borrow().clone();
        match dispatch {
            Some(f) => f(session, element),
            None => log::warn!("dropping inbound <{}/>: no dispatcher registered", element.name()),
        }
    }

    /// Open a new outbound `NetSession` to `(host, addr, port)`,
    /// negotiate stream headers, and register it by address. Grounded
    /// on `Router::connect` in
    /// `examples/original_source/src/router.cc`, which `Route::AddressResult`
    /// calls once DNS resolution picks a target.
    pub async fn connect(
        self: &Rc<Self>,
        local_domain: String,
        remote_domain: String,
        host: String,
        addr: IpAddr,
        port: u16,
    ) -> io::Result<NetSession> {
        let tcp = tokio::net::TcpStream::connect((addr, port)).await?;
        let io = tokio::io::BufReader::new(tcp);
        let (peer_header, stream) = xmlstream::initiate_stream(
            io,
            crate::ns::JABBER_SERVER,
            Timeouts::default(),
            StreamHeader {
                from: Some(local_domain),
                to: Some(remote_domain),
                id: None,
            },
        )
        .await
        .map_err(|e| io::Error::other(format!("stream negotiation failed: {e:?}")))?;

        let stream_id = peer_header.id.clone().unwrap_or_default();
        let registry = self.clone();
        let dispatch_registry = self.clone();
        let session = crate::session::spawn(stream_id, Direction::Outbound, stream, registry, move |session, element| {
            dispatch_registry.dispatch_element(session, element);
        });
        self.insert(Address { host, port }, session.clone());
        Ok(session)
    }

    /// Accept an inbound `NetSession` over an already-connected socket
    /// whose peer connected from `peer_addr`, negotiate stream headers
    /// (responder side), and register it by that address. `local_domain`
    /// is used to pick our `from` in the stream header reply; the
    /// peer's declared `from` becomes the session's eventual remote
    /// domain once dialback identifies it.
    pub async fn accept<Io>(
        self: &Rc<Self>,
        io: Io,
        local_domain: String,
        peer_addr: std::net::SocketAddr,
    ) -> io::Result<NetSession>
    where
        Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + 'static,
    {
        let buffered = tokio::io::BufReader::new(io);
        let stream_id = {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
                .collect::<String>()
        };
        let sid = stream_id.clone();
        let (peer_header, stream) = xmlstream::accept_stream(
            buffered,
            crate::ns::JABBER_SERVER,
            Timeouts::default(),
            move |peer| StreamHeader {
                from: Some(local_domain.clone()),
                to: peer.from.clone(),
                id: Some(sid.clone()),
            },
        )
        .await
        .map_err(|e| io::Error::other(format!("stream negotiation failed: {e:?}")))?;
        let _ = peer_header;

        let registry = self.clone();
        let dispatch_registry = self.clone();
        let session = crate::session::spawn(stream_id, Direction::Inbound, stream, registry, move |session, element| {
            dispatch_registry.dispatch_element(session, element);
        });
        self.insert(
            Address {
                host: peer_addr.ip().to_string(),
                port: peer_addr.port(),
            },
            session.clone(),
        );
        Ok(session)
    }

    /// Register a freshly connected/accepted session under its
    /// address and stream id. Domain indexing happens later, once the
    /// peer's identity is known (`index_by_domain`), matching the
    /// original's "learn the domain from dialback" ordering.
    pub fn insert(&self, address: Address, session: NetSession) {
        self.by_stream_id
            .borrow_mut()
            .insert(session.stream_id().to_string(), session.clone());
        self.by_address.borrow_mut().insert(address, session);
    }

    /// Index an already-registered session under a remote domain,
    /// once a `Route` has confirmed which domain it serves.
    pub fn index_by_domain(&self, domain: impl Into<String>, session: NetSession) {
        self.by_domain.borrow_mut().insert(domain.into(), session);
    }

    pub fn by_address(&self, address: &Address) -> Option<NetSession> {
        self.by_address.borrow().get(address).cloned()
    }

    pub fn by_stream_id(&self, stream_id: &str) -> Option<NetSession> {
        self.by_stream_id.borrow().get(stream_id).cloned()
    }

    pub fn by_domain(&self, domain: &str) -> Option<NetSession> {
        self.by_domain.borrow().get(domain).cloned()
    }

    /// Remove a closed session from every index it appears in.
    pub fn remove(&self, session: &NetSession) {
        self.by_address.borrow_mut().retain(|_, s| s != session);
        self.by_stream_id.borrow_mut().retain(|_, s| s != session);
        self.by_domain.borrow_mut().retain(|_, s| s != session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::dummy_session;

    #[test]
    fn indexes_and_looks_up_by_each_key() {
        let registry = SessionRegistry::new();
        let session = dummy_session("stream-1");
        registry.insert(
            Address {
                host: "peer.example".into(),
                port: 5269,
            },
            session.clone(),
        );
        registry.index_by_domain("peer.example", session.clone());

        assert!(registry
            .by_address(&Address {
                host: "peer.example".into(),
                port: 5269
            })
            .is_some());
        assert!(registry.by_stream_id("stream-1").is_some());
        assert!(registry.by_domain("peer.example").is_some());

        registry.remove(&session);
        assert!(registry.by_stream_id("stream-1").is_none());
        assert!(registry.by_domain("peer.example").is_none());
    }
}
