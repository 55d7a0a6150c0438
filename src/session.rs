//! `NetSession`: one TCP connection carrying one `XMLStream`.
//!
//! Grounded on the `Connection`/worker-task split in
//! `tokio-xmpp/src/stanzastream/worker.rs`: the transport (`XmlStream<Io,
//! Element>`) is owned exclusively by the task that reads from it; every
//! other place in this crate (`Route`, `Dialback`, `SessionRegistry`) only
//! ever holds a cheap, `Clone`-able `NetSession` handle that can enqueue
//! outgoing elements over an unbounded channel. This is what lets
//! `Route`/`Dialback` code stay synchronous (see `src/event.rs`) even
//! though the actual socket write is an async operation happening on a
//! different task on the same `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::event::EventEmitter;
use crate::xmlstream::XmlStream;

/// Which side opened the underlying TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We connected out to the peer (used to deliver outbound stanzas).
    Outbound,
    /// The peer connected to us.
    Inbound,
}

/// Authorization state of one `(local_domain, remote_domain)` pair
/// multiplexed on a `NetSession`, mirroring the states XEP-0220 walks
/// a dialback pair through. Ordered so callers can write `>=
/// AuthState::Requested`, matching `s2s_auth_pair(...) >=
/// XMLStream::REQUESTED` checks in
/// `examples/original_source/src/dialback.cc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthState {
    /// No dialback has been attempted yet.
    None,
    /// A `db:result` was sent (OUTBOUND) or a verify round-trip is in
    /// flight (INBOUND).
    Requested,
    /// The pair is authorized to exchange stanzas.
    Authorized,
}

struct NetSessionInner {
    stream_id: String,
    direction: Direction,
    secured: Cell<bool>,
    auth_ready: Cell<bool>,
    /// Domain the peer's TLS certificate was already verified against,
    /// if any; set by the (external) TLS layer once its chain/identity
    /// check completes. Backs `tls_auth_ok`, spec.md §4.3's "TLS
    /// verification decision is external; the hook returns its
    /// boolean" contract.
    tls_verified_domain: RefCell<Option<String>>,
    s2s_auth: RefCell<HashMap<(String, String, Direction), AuthState>>,
    on_auth_ready: EventEmitter<NetSession>,
    on_authenticated: EventEmitter<(NetSession, String, String, Direction)>,
    /// Dialback keys currently between "we started name collation" and
    /// "we sent/received the matching verify", kept alive here so the
    /// async continuation that needs them always finds them owned
    /// somewhere — the Rust-idiomatic answer to the `m_keys` quirk
    /// noted in `examples/original_source/src/dialback.cc`.
    pending_dialback_keys: RefCell<std::collections::HashSet<String>>,
    tx: RefCell<Option<mpsc::UnboundedSender<Element>>>,
}

/// A cheap, `Clone`-able handle to a `NetSession`. Sending is
/// fire-and-forget into an unbounded channel drained by the task that
/// owns the actual transport (see [`spawn`]).
#[derive(Clone)]
pub struct NetSession(Rc<NetSessionInner>);

impl fmt::Debug for NetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetSession")
            .field("stream_id", &self.0.stream_id)
            .field("direction", &self.0.direction)
            .field("secured", &self.0.secured.get())
            .finish()
    }
}

impl PartialEq for NetSession {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for NetSession {}

impl NetSession {
    fn new(stream_id: impl Into<String>, direction: Direction, tx: mpsc::UnboundedSender<Element>) -> Self {
        NetSession(Rc::new(NetSessionInner {
            stream_id: stream_id.into(),
            direction,
            secured: Cell::new(false),
            auth_ready: Cell::new(false),
            tls_verified_domain: RefCell::new(None),
            s2s_auth: RefCell::new(HashMap::new()),
            on_auth_ready: EventEmitter::new(),
            on_authenticated: EventEmitter::new(),
            pending_dialback_keys: RefCell::new(std::collections::HashSet::new()),
            tx: RefCell::new(Some(tx)),
        }))
    }

    /// A weak handle that does not keep this session alive, for
    /// `Route` to hold per spec.md §3's "`to_session` and
    /// `verify_session` are weak" invariant.
    pub fn downgrade(&self) -> WeakNetSession {
        WeakNetSession(Rc::downgrade(&self.0))
    }

    pub fn stream_id(&self) -> &str {
        &self.0.stream_id
    }

    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    pub fn secured(&self) -> bool {
        self.0.secured.get()
    }

    pub fn set_secured(&self, secured: bool) {
        self.0.secured.set(secured);
    }

    /// Whether this session is past TLS negotiation and ready to
    /// begin dialback (`Dialback::negotiate` / `check_to` in the
    /// original only proceed once this is true).
    pub fn auth_ready(&self) -> bool {
        self.0.auth_ready.get()
    }

    /// Mark the session ready to authenticate, firing `on_auth_ready`
    /// for anyone already waiting.
    pub fn set_auth_ready(&self) {
        if self.0.auth_ready.replace(true) {
            return;
        }
        self.0.on_auth_ready.emit(self.clone());
    }

    /// Run `f` now if the session is already auth-ready, or as soon as
    /// it becomes so. Mirrors the `if (stream.auth_ready()) { ... }
    /// else { connect(onAuthReady, ...) }` pattern throughout
    /// `examples/original_source/src/router.cc`.
    pub fn on_auth_ready_or_now(&self, mut f: impl FnMut(NetSession) + 'static) {
        if self.auth_ready() {
            f(self.clone());
        } else {
            self.0.on_auth_ready.subscribe(f);
        }
    }

    /// Current authorization state of a `(local, remote, direction)`
    /// triple.
    pub fn auth_pair(&self, local: &str, remote: &str, direction: Direction) -> AuthState {
        self.0
            .s2s_auth
            .borrow()
            .get(&(local.to_string(), remote.to_string(), direction))
            .copied()
            .unwrap_or(AuthState::None)
    }

    /// Update a `(local, remote, direction)` triple's authorization
    /// state, firing `on_authenticated` exactly when it newly reaches
    /// `Authorized`. Downgrades are a programming error (spec.md §3:
    /// "AuthState transitions are monotonic") and panic rather than
    /// silently corrupting the state machine.
    pub fn set_auth_pair(&self, local: &str, remote: &str, direction: Direction, state: AuthState) {
        let key = (local.to_string(), remote.to_string(), direction);
        let previous = self
            .0
            .s2s_auth
            .borrow()
            .get(&key)
            .copied()
            .unwrap_or(AuthState::None);
        assert!(
            state >= previous,
            "auth state for ({local}, {remote}, {direction:?}) would regress from {previous:?} to {state:?}"
        );
        let became_authorized = state == AuthState::Authorized && previous != AuthState::Authorized;
        self.0.s2s_auth.borrow_mut().insert(key, state);
        if became_authorized {
            self.0.on_authenticated.emit((
                self.clone(),
                local.to_string(),
                remote.to_string(),
                direction,
            ));
        }
    }

    /// Record that the peer's TLS certificate was already verified to
    /// cover `domain`, letting dialback short-circuit via
    /// `tls_auth_ok` (spec.md §4.3/§4.4 step 5a). Left unset by
    /// everything in this crate — wiring an actual certificate check
    /// in is the surrounding TLS layer's job.
    pub fn set_tls_verified_domain(&self, domain: impl Into<String>) {
        *self.0.tls_verified_domain.borrow_mut() = Some(domain.into());
    }

    /// Whether this session's peer has already proven, via TLS
    /// certificate identity, that it controls `domain`.
    pub fn tls_auth_ok(&self, domain: &str) -> bool {
        self.0.tls_verified_domain.borrow().as_deref() == Some(domain)
    }

    /// Remember a dialback key between issuing collation and
    /// transmitting the matching verify — see `pending_dialback_keys`
    /// above for why this exists at all.
    pub fn hold_dialback_key(&self, key: impl Into<String>) {
        self.0.pending_dialback_keys.borrow_mut().insert(key.into());
    }

    /// Release a held dialback key once its verify round-trip
    /// completes.
    pub fn release_dialback_key(&self, key: &str) {
        self.0.pending_dialback_keys.borrow_mut().remove(key);
    }

    /// Force a `(local, remote, direction)` pair back to `AuthState::None`
    /// after a dialback rejection — the one legitimate downgrade, used
    /// instead of [`set_auth_pair`](Self::set_auth_pair) so it doesn't
    /// trip the monotonic-transition assert. spec.md §7:
    /// "Authentication-fatal per pair" failures set a terminal state for
    /// that pair without touching the rest of the session.
    pub fn reject_pair(&self, local: &str, remote: &str, direction: Direction) {
        let key = (local.to_string(), remote.to_string(), direction);
        self.0.s2s_auth.borrow_mut().insert(key, AuthState::None);
    }

    /// Close this session's write side after reporting a stream-fatal
    /// error to the peer. Per spec.md §7: "errors raised during
    /// incoming element handling are caught at the XMLStream boundary
    /// and converted into a stream error." Dropping the sender here
    /// makes the owning task's `rx.recv()` return `None`, so it goes on
    /// to close the transport and exit (see [`spawn`]).
    pub fn fail(&self, err: impl Into<crate::error::Error>) {
        let err = err.into();
        log::warn!("session {} failing: {}", self.stream_id(), err);
        self.0.tx.borrow_mut().take();
    }

    /// Subscribe to the next `(local, remote, direction)` triple
    /// becoming authorized.
    pub fn on_authenticated(&self, f: impl FnMut((NetSession, String, String, Direction)) + 'static) {
        self.0.on_authenticated.subscribe(f);
    }

    /// Enqueue `element` for delivery. Ordering of calls from a single
    /// caller is preserved by the channel; this never blocks or
    /// suspends (see `SPEC_FULL.md` §4's "Network session" note on
    /// why `Route`/`Dialback` code can stay synchronous).
    pub fn send(&self, element: Element) -> Result<(), crate::error::Error> {
        self.0
            .tx
            .borrow()
            .as_ref()
            .ok_or(crate::error::Error::Stream(crate::error::StreamError::StreamClosed))?
            .send(element)
            .map_err(|_| crate::error::Error::Stream(crate::error::StreamError::StreamClosed))
    }
}

/// Drive one `XmlStream`, dispatching inbound elements to `on_element`
/// and draining outbound elements sent via the returned [`NetSession`]
/// handle. Runs until the stream closes or errors; must be spawned on
/// a `tokio::task::LocalSet` (the `XmlStream` is `!Send`).
///
/// `registry` is removed from on exit (spec.md §5: "Closing a
/// NetSession removes it from all three indexes and invalidates every
/// weak reference") so `Route`'s `WeakNetSession::upgrade()` actually
/// fails once the transport is gone, instead of keeping a sender-less
/// zombie session reachable forever.
pub fn spawn<Io>(
    stream_id: impl Into<String>,
    direction: Direction,
    mut stream: XmlStream<Io, Element>,
    registry: Rc<crate::registry::SessionRegistry>,
    mut on_element: impl FnMut(NetSession, Element) + 'static,
) -> NetSession
where
    Io: AsyncRead + tokio::io::AsyncBufRead + AsyncWrite + Unpin + 'static,
{
    use futures::{SinkExt, StreamExt};

    let (tx, mut rx) = mpsc::unbounded_channel::<Element>();
    let session = NetSession::new(stream_id, direction, tx);
    let task_session = session.clone();

    tokio::task::spawn_local(async move {
        loop {
            tokio::select! {
                biased;
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(element) => {
                            if Pin::new(&mut stream).send(&element).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(element)) => on_element(task_session.clone(), element),
                        _ => break,
                    }
                }
            }
        }
        match Pin::new(&mut stream).close().await {
            Ok(()) => log::debug!("session {} closed cleanly", task_session.stream_id()),
            Err(e) => log::debug!("session {} close error: {}", task_session.stream_id(), e),
        }
        registry.remove(&task_session);
    });

    session
}

/// A weak handle to a [`NetSession`] that does not keep its transport
/// alive. `Route` holds these (per spec.md §3); a handle whose session
/// has already closed fails to upgrade, which is exactly the "falls
/// back to re-resolution" signal `Route::transmit` relies on.
#[derive(Clone)]
pub struct WeakNetSession(Weak<NetSessionInner>);

impl WeakNetSession {
    /// An always-empty weak handle, for a `Route`'s initial state.
    pub fn empty() -> Self {
        WeakNetSession(Weak::new())
    }

    /// Recover a strong [`NetSession`] handle if the session is still
    /// alive.
    pub fn upgrade(&self) -> Option<NetSession> {
        self.0.upgrade().map(NetSession)
    }
}

impl Default for WeakNetSession {
    fn default() -> Self {
        Self::empty()
    }
}

/// Test/demo helpers: a `NetSession` handle with no backing transport,
/// for registry and route tests (and the example binary) that only
/// need identity/equality/auth-state bookkeeping.
pub mod test_support {
    use super::*;

    pub fn dummy_session(stream_id: &str) -> NetSession {
        let (tx, rx) = mpsc::unbounded_channel();
        // Leak the receiver so `NetSession::send` succeeds the way it
        // would against a live worker task; nothing in these tests
        // needs to observe what was sent.
        std::mem::forget(rx);
        NetSession::new(stream_id, Direction::Inbound, tx)
    }

    /// Like [`dummy_session`], but keeps the receiving half so a test
    /// can assert on what was sent.
    pub fn dummy_session_with_outbox(
        stream_id: &str,
        direction: Direction,
    ) -> (NetSession, mpsc::UnboundedReceiver<Element>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NetSession::new(stream_id, direction, tx), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::dummy_session;
    use super::*;

    #[test]
    fn auth_ready_fires_subscribers_once() {
        let session = dummy_session("s1");
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        session.on_auth_ready_or_now(move |_| fired2.set(fired2.get() + 1));
        assert_eq!(fired.get(), 0);
        session.set_auth_ready();
        assert_eq!(fired.get(), 1);
        // A second subscription after the fact runs immediately.
        let fired3 = fired.clone();
        session.on_auth_ready_or_now(move |_| fired3.set(fired3.get() + 1));
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn auth_pair_transitions_fire_authenticated_once() {
        let session = dummy_session("s1");
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        session.on_authenticated(move |_| count2.set(count2.get() + 1));

        assert_eq!(
            session.auth_pair("a.example", "b.example", Direction::Outbound),
            AuthState::None
        );
        session.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Requested);
        assert_eq!(count.get(), 0);
        session.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Authorized);
        assert_eq!(count.get(), 1);
    }

    #[test]
    #[should_panic(expected = "would regress")]
    fn auth_pair_downgrade_panics() {
        let session = dummy_session("s1");
        session.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Authorized);
        session.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Requested);
    }

    #[test]
    fn weak_handle_fails_to_upgrade_once_session_drops() {
        let weak = {
            let session = dummy_session("s1");
            session.downgrade()
        };
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn fail_closes_the_session_for_further_sends() {
        let session = dummy_session("s1");
        let elem: Element = "<message xmlns='jabber:server'/>".parse().unwrap();
        assert!(session.send(elem.clone()).is_ok());

        session.fail(crate::error::Error::Stream(crate::error::StreamError::StreamClosed));

        assert!(session.send(elem).is_err());
    }
}
