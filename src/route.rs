//! `Route`: the per-`(local_domain, remote_domain)` state holder that
//! drives DNS-based peer discovery, session selection, and ordered
//! stanza/verify delivery.
//!
//! Ported from the `Route` class in
//! `examples/original_source/src/router.cc`; `transmit`/`collateNames`/
//! `SrvResult`/`AddressResult`/`TlsaResult`/`SessionDialback`/
//! `SessionAuthenticated` all have a same-named method below doing the
//! same job, generalized from `sigslot` signals + raw `shared_ptr`s to
//! `EventEmitter` + `Weak<NetSessionInner>` (see `src/session.rs`'s
//! `WeakNetSession`).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::Rc;

use hickory_resolver::error::ResolveError;
use hickory_resolver::proto::rr::rdata::tlsa::TLSA;
use minidom::Element;

use crate::config::ConfigView;
use crate::dns::{AddrResult, Resolver, SrvResult, SrvTarget, TlsaResult};
use crate::ns;
use crate::registry::{Address, SessionRegistry};
use crate::session::{AuthState, Direction, NetSession, WeakNetSession};
use crate::stanza::{Stanza, Verify};

/// `(port, hostname)` key used to replace a stale TLSA entry when a
/// fresh lookup for the same target comes back (spec.md §4.5's "TLSA
/// result handler").
type TlsaKey = (u16, String);

type NamesCollatedCallbacks = RefCell<Vec<Box<dyn FnOnce(Rc<Route>)>>>;

/// One `(local_domain, remote_domain)` route: pending work plus the
/// weak session handles and DNS cursors that decide how to deliver it.
pub struct Route {
    local_domain: String,
    remote_domain: String,

    config: Rc<dyn ConfigView>,
    registry: Rc<SessionRegistry>,
    resolver: Rc<Resolver>,

    pending_stanzas: RefCell<VecDeque<Stanza>>,
    pending_dialback: RefCell<VecDeque<Verify>>,

    to_session: RefCell<WeakNetSession>,
    verify_session: RefCell<WeakNetSession>,

    srv: RefCell<Option<SrvResult>>,
    srv_cursor: Cell<usize>,
    srv_in_flight: Cell<bool>,
    addr_cursor: Cell<usize>,
    tlsa: RefCell<Vec<(TlsaKey, TlsaResult)>>,

    names_collated: Cell<bool>,
    on_names_collated: NamesCollatedCallbacks,
}

impl Route {
    pub(crate) fn new(
        local_domain: String,
        remote_domain: String,
        config: Rc<dyn ConfigView>,
        registry: Rc<SessionRegistry>,
        resolver: Rc<Resolver>,
    ) -> Rc<Route> {
        Rc::new(Route {
            local_domain,
            remote_domain,
            config,
            registry,
            resolver,
            pending_stanzas: RefCell::new(VecDeque::new()),
            pending_dialback: RefCell::new(VecDeque::new()),
            to_session: RefCell::new(WeakNetSession::empty()),
            verify_session: RefCell::new(WeakNetSession::empty()),
            srv: RefCell::new(None),
            srv_cursor: Cell::new(0),
            srv_in_flight: Cell::new(false),
            addr_cursor: Cell::new(0),
            tlsa: RefCell::new(Vec::new()),
            names_collated: Cell::new(false),
            on_names_collated: RefCell::new(Vec::new()),
        })
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    pub fn remote_domain(&self) -> &str {
        &self.remote_domain
    }

    /// Whether the remote domain is configured to allow dialback
    /// authentication at all (spec.md §4.4 step 6). Ports the
    /// `from_domain.auth_dialback()` check in `Dialback::result_step`.
    pub fn config_allows_dialback(&self) -> bool {
        self.config.auth_dialback(&self.remote_domain)
    }

    pub fn to_session(&self) -> Option<NetSession> {
        self.to_session.borrow().upgrade()
    }

    pub fn verify_session(&self) -> Option<NetSession> {
        self.verify_session.borrow().upgrade()
    }

    /// Outstanding stanzas, oldest first. Exposed for tests/inspection
    /// only; delivery always drains front-to-back.
    pub fn pending_stanza_count(&self) -> usize {
        self.pending_stanzas.borrow().len()
    }

    pub fn pending_dialback_count(&self) -> usize {
        self.pending_dialback.borrow().len()
    }

    /// Bounce every queued stanza after an auth-fatal dialback
    /// rejection of the OUTBOUND pair (spec.md §7): the pair is
    /// terminally unauthorized for this session, so nothing queued for
    /// it can be delivered. Logs how many were dropped; actually
    /// returning a delivery-failure to the stanza's originator is a
    /// collaborator outside this core (spec.md §7's "bouncing mechanism
    /// is a collaborator of the core").
    pub(crate) fn fail_pending_stanzas(&self, reason: &dyn std::fmt::Display) {
        let mut queue = self.pending_stanzas.borrow_mut();
        if !queue.is_empty() {
            log::warn!(
                "bouncing {} queued stanza(s) for {} => {}: {}",
                queue.len(),
                self.local_domain,
                self.remote_domain,
                reason
            );
        }
        queue.clear();
    }

    /// TLSA records collected for this route's SRV targets, falling
    /// back to the configured static override list (spec.md §4.5
    /// `tlsa() const`).
    pub fn tlsa_records(&self) -> Vec<TLSA> {
        let collected = self.tlsa.borrow();
        if collected.is_empty() {
            self.config.tlsa(&self.remote_domain)
        } else {
            collected.iter().flat_map(|(_, r)| r.records.clone()).collect()
        }
    }

    // ---- transmit(Stanza) — spec.md §4.5 -----------------------------

    pub fn transmit_stanza(self: &Rc<Self>, stanza: Stanza) {
        if let Some(to) = self.to_session() {
            self.drive_to_with(&to, stanza);
            return;
        }
        if let Some(vrfy) = self.verify_session() {
            *self.to_session.borrow_mut() = vrfy.downgrade();
            self.transmit_stanza(stanza);
            return;
        }
        if let Some(session) = self.registry.by_domain(&self.remote_domain) {
            *self.to_session.borrow_mut() = session.downgrade();
            self.transmit_stanza(stanza);
            return;
        }
        self.pending_stanzas.borrow_mut().push_back(stanza.freeze());
        log::debug!(
            "queued stanza (no session yet) for {} => {}",
            self.local_domain,
            self.remote_domain
        );
        self.begin_srv_lookup();
    }

    /// Try to deliver (or queue) `stanza` on an already-known
    /// `to_session`, driving its dialback state if needed.
    fn drive_to_with(self: &Rc<Self>, to: &NetSession, stanza: Stanza) {
        match to.auth_pair(&self.local_domain, &self.remote_domain, Direction::Outbound) {
            AuthState::Authorized => {
                let mut queue = self.pending_stanzas.borrow_mut();
                if queue.is_empty() {
                    drop(queue);
                    let _ = to.send(stanza.into_element());
                } else {
                    queue.push_back(stanza.freeze());
                }
            }
            AuthState::Requested => {
                self.pending_stanzas.borrow_mut().push_back(stanza.freeze());
                self.subscribe_authenticated(to);
            }
            AuthState::None => {
                self.pending_stanzas.borrow_mut().push_back(stanza.freeze());
                if to.auth_ready() {
                    self.send_db_result(to);
                    self.subscribe_authenticated(to);
                } else {
                    let route = self.clone();
                    to.on_auth_ready_or_now(move |s| route.session_dialback(s));
                }
            }
        }
    }

    fn send_db_result(&self, to: &NetSession) {
        let key = self
            .config
            .dialback_key(to.stream_id(), &self.local_domain, &self.remote_domain);
        let result = build_db_result(&self.local_domain, &self.remote_domain, None, Some(&key));
        if to.send(result).is_ok() {
            to.set_auth_pair(
                &self.local_domain,
                &self.remote_domain,
                Direction::Outbound,
                AuthState::Requested,
            );
        }
    }

    fn subscribe_authenticated(self: &Rc<Self>, to: &NetSession) {
        let route = self.clone();
        to.on_authenticated(move |(session, _local, _remote, direction)| {
            if direction == Direction::Outbound {
                route.session_authenticated(session);
            }
        });
    }

    // ---- transmit(Verify) — spec.md §4.5 -----------------------------

    pub fn transmit_verify(self: &Rc<Self>, verify: Verify) {
        if let Some(vrfy) = self.verify_session() {
            if vrfy.auth_ready() {
                let mut queue = self.pending_dialback.borrow_mut();
                if queue.is_empty() {
                    drop(queue);
                    let _ = vrfy.send(verify_to_element(&verify));
                } else {
                    queue.push_back(verify.freeze());
                }
                return;
            }
        }
        self.pending_dialback.borrow_mut().push_back(verify.freeze());
        self.begin_srv_lookup();
    }

    // ---- name collation — spec.md §4.5 "Name collation" --------------

    /// Run `on_collated` now if names are already collated for this
    /// route, or as soon as they become so. Per DESIGN.md's Open
    /// Question 3 decision, `names_collated` fires at most once; a
    /// caller arriving after that fact gets called back immediately.
    pub fn collate_names(self: &Rc<Self>, on_collated: impl FnOnce(Rc<Route>) + 'static) {
        if self.names_collated.get() {
            on_collated(self.clone());
            return;
        }
        self.on_names_collated.borrow_mut().push(Box::new(on_collated));
        if self.srv.borrow().is_none() {
            self.begin_srv_lookup();
        } else {
            self.maybe_fire_names_collated();
        }
    }

    fn maybe_fire_names_collated(self: &Rc<Self>) {
        if self.names_collated.get() {
            return;
        }
        let ready = match self.srv.borrow().as_ref() {
            None => false,
            Some(srv) if !srv.dnssec_valid => true,
            Some(srv) => self.tlsa.borrow().len() >= srv.targets.len(),
        };
        if ready {
            self.names_collated.set(true);
            for cb in self.on_names_collated.borrow_mut().drain(..) {
                cb(self.clone());
            }
        }
    }

    // ---- DNS-driven resolution ----------------------------------------

    fn begin_srv_lookup(self: &Rc<Self>) {
        if let Some(cached) = self.srv.borrow().clone() {
            self.handle_srv_result(Ok(cached));
            return;
        }
        if self.srv_in_flight.replace(true) {
            return;
        }
        let route = self.clone();
        let domain = self.remote_domain.clone();
        let resolver = self.resolver.clone();
        tokio::task::spawn_local(async move {
            let result = resolver.lookup_srv(&domain).await;
            route.srv_in_flight.set(false);
            route.handle_srv_result(result);
        });
    }

    fn handle_srv_result(self: &Rc<Self>, result: Result<SrvResult, ResolveError>) {
        let srv = match result {
            Ok(srv) => srv,
            Err(e) => {
                log::warn!("SRV lookup for {} failed: {}", self.remote_domain, e);
                return;
            }
        };
        if srv.targets.is_empty() {
            log::warn!("no SRV targets for {}", self.remote_domain);
            return;
        }
        *self.srv.borrow_mut() = Some(srv.clone());
        self.srv_cursor.set(0);

        if srv.dnssec_valid {
            for target in &srv.targets {
                self.begin_tlsa_lookup(target.clone());
            }
        } else {
            self.maybe_fire_names_collated();
        }

        if let Some(vrfy) = self.verify_session() {
            if self.to_session().is_none() {
                *self.to_session.borrow_mut() = vrfy.downgrade();
            }
            self.session_dialback(vrfy);
            return;
        }
        self.try_current_srv_target();
    }

    fn try_current_srv_target(self: &Rc<Self>) {
        let target = {
            let srv = self.srv.borrow();
            srv.as_ref().and_then(|s| s.targets.get(self.srv_cursor.get()).cloned())
        };
        let Some(target) = target else {
            log::warn!("exhausted all SRV targets for {}", self.remote_domain);
            return;
        };

        let address = Address {
            host: target.host.clone(),
            port: target.port,
        };
        if let Some(session) = self.registry.by_address(&address) {
            if self.verify_session().is_none() {
                *self.verify_session.borrow_mut() = session.downgrade();
            }
            let route = self.clone();
            session.on_auth_ready_or_now(move |s| route.session_dialback(s));
            if self.to_session().is_none() {
                *self.to_session.borrow_mut() = session.downgrade();
            }
            self.drive_to(&session);
            return;
        }
        self.begin_address_lookup(target);
    }

    fn begin_address_lookup(self: &Rc<Self>, target: SrvTarget) {
        self.addr_cursor.set(0);
        let route = self.clone();
        let resolver = self.resolver.clone();
        let host = target.host.clone();
        tokio::task::spawn_local(async move {
            let result = resolver.lookup_addrs(&host).await;
            route.handle_address_result(target, result);
        });
    }

    fn handle_address_result(self: &Rc<Self>, target: SrvTarget, result: Result<AddrResult, ResolveError>) {
        if self.verify_session().is_some() {
            // A verify/to session showed up while we were resolving
            // (e.g. the peer connected to us first); nothing left to do.
            return;
        }
        let addrs = match result {
            Ok(a) if !a.addrs.is_empty() => a.addrs,
            Ok(_) => {
                log::warn!("no addresses for SRV target {}", target.host);
                self.advance_srv_target();
                return;
            }
            Err(e) => {
                log::warn!("address lookup for {} failed: {}", target.host, e);
                self.advance_srv_target();
                return;
            }
        };
        let addr = addrs[0];
        self.begin_connect(target, addr);
    }

    fn begin_connect(self: &Rc<Self>, target: SrvTarget, addr: IpAddr) {
        let route = self.clone();
        let registry = self.registry.clone();
        let local_domain = self.local_domain.clone();
        let remote_domain = self.remote_domain.clone();
        tokio::task::spawn_local(async move {
            match registry
                .connect(local_domain, remote_domain, target.host.clone(), addr, target.port)
                .await
            {
                Ok(session) => route.on_connected(session),
                Err(e) => {
                    log::warn!("connect to {}:{} failed: {}", target.host, target.port, e);
                    route.advance_srv_target();
                }
            }
        });
    }

    fn advance_srv_target(self: &Rc<Self>) {
        let next = self.srv_cursor.get() + 1;
        self.srv_cursor.set(next);
        let has_more = self
            .srv
            .borrow()
            .as_ref()
            .map(|s| next < s.targets.len())
            .unwrap_or(false);
        if has_more {
            self.try_current_srv_target();
        } else {
            log::warn!("exhausted all SRV targets for {}", self.remote_domain);
        }
    }

    fn on_connected(self: &Rc<Self>, session: NetSession) {
        let route = self.clone();
        session.on_auth_ready_or_now(move |s| route.session_dialback(s));
        *self.verify_session.borrow_mut() = session.downgrade();
        if self.to_session().is_none() {
            *self.to_session.borrow_mut() = session.downgrade();
            self.drive_to(&session);
        }
    }

    fn begin_tlsa_lookup(self: &Rc<Self>, target: SrvTarget) {
        let route = self.clone();
        let resolver = self.resolver.clone();
        tokio::task::spawn_local(async move {
            let result = resolver.lookup_tlsa(&target.host, target.port).await;
            route.handle_tlsa_result(target.port, target.host, result);
        });
    }

    fn handle_tlsa_result(self: &Rc<Self>, port: u16, host: String, result: Result<TlsaResult, ResolveError>) {
        let tlsa = result.unwrap_or_else(|e| {
            log::warn!("TLSA lookup for {}:{} failed: {}", host, port, e);
            TlsaResult::default()
        });
        let key: TlsaKey = (port, host);
        {
            let mut records = self.tlsa.borrow_mut();
            records.retain(|(k, _)| k != &key);
            records.push((key, tlsa));
        }
        self.maybe_fire_names_collated();
    }

    // ---- session event handlers — spec.md §4.5 ------------------------

    /// Fired (directly, or via `on_auth_ready_or_now`) when a session
    /// this Route cares about reaches `auth_ready`.
    fn session_dialback(self: &Rc<Self>, session: NetSession) {
        if let Some(vrfy) = self.verify_session() {
            if session == vrfy {
                self.flush_dialback(&vrfy);
                if self.to_session().is_none() {
                    *self.to_session.borrow_mut() = vrfy.downgrade();
                    self.drive_to(&vrfy);
                    return;
                }
            }
        }
        if let Some(to) = self.to_session() {
            if session == to {
                self.drive_to(&to);
            }
        }
    }

    fn flush_dialback(&self, vrfy: &NetSession) {
        let mut queue = self.pending_dialback.borrow_mut();
        for verify in queue.drain(..) {
            let _ = vrfy.send(verify_to_element(&verify));
        }
    }

    /// Drive `to`'s `(local, remote, OUTBOUND)` pair forward one step:
    /// send a fresh `db:result` if nothing has been attempted yet,
    /// subscribe to the next authentication if one is in flight, or
    /// flush queued stanzas if it's already authorized.
    fn drive_to(self: &Rc<Self>, to: &NetSession) {
        match to.auth_pair(&self.local_domain, &self.remote_domain, Direction::Outbound) {
            AuthState::Authorized => self.session_authenticated(to.clone()),
            AuthState::None => {
                if to.auth_ready() {
                    self.send_db_result(to);
                }
                self.subscribe_authenticated(to);
            }
            AuthState::Requested => self.subscribe_authenticated(to),
        }
    }

    /// Fired when some `(local, remote, OUTBOUND)` pair on a session
    /// this Route cares about transitions to `AUTHORIZED`.
    fn session_authenticated(self: &Rc<Self>, session: NetSession) {
        let Some(to) = self.to_session() else { return };
        if session != to {
            return;
        }
        if session.auth_pair(&self.local_domain, &self.remote_domain, Direction::Outbound) != AuthState::Authorized
        {
            return;
        }
        let mut queue = self.pending_stanzas.borrow_mut();
        for stanza in queue.drain(..) {
            let _ = to.send(stanza.into_element());
        }
    }
}

/// Build a `<db:result from to [type] [key-text]/>` element.
pub(crate) fn build_db_result(from: &str, to: &str, type_: Option<&str>, key: Option<&str>) -> Element {
    let mut builder = Element::builder("result", ns::DIALBACK)
        .attr("from", from)
        .attr("to", to);
    if let Some(type_) = type_ {
        builder = builder.attr("type", type_);
    }
    if let Some(key) = key {
        builder = builder.append(key);
    }
    builder.build()
}

/// Build a `<db:verify from to id [type] [key-text]/>` element.
pub(crate) fn verify_to_element(verify: &Verify) -> Element {
    Element::builder("verify", ns::DIALBACK)
        .attr("from", verify.from.as_str())
        .attr("to", verify.to.as_str())
        .attr("id", verify.id.as_str())
        .append(verify.key.as_str())
        .build()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A route whose name collation has already completed with no SRV
    /// targets, for tests (`dialback`'s in particular) that only care
    /// what happens once collation is done.
    pub fn collated_route(
        local: &str,
        remote: &str,
        config: Rc<dyn ConfigView>,
        registry: Rc<SessionRegistry>,
        resolver: Rc<Resolver>,
    ) -> Rc<Route> {
        let route = Route::new(local.to_string(), remote.to_string(), config, registry, resolver);
        route.names_collated.set(true);
        route
    }

    /// Like [`collated_route`], with `verify_session` already set to
    /// `session` — for tests driving `transmit_verify` without
    /// exercising DNS/connect.
    pub fn collated_route_with_verify_session(
        local: &str,
        remote: &str,
        config: Rc<dyn ConfigView>,
        registry: Rc<SessionRegistry>,
        resolver: Rc<Resolver>,
        session: &NetSession,
    ) -> Rc<Route> {
        let route = collated_route(local, remote, config, registry, resolver);
        *route.verify_session.borrow_mut() = session.downgrade();
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::dns::Resolver;
    use crate::session::test_support::dummy_session;

    fn test_route(local: &str, remote: &str) -> Rc<Route> {
        let config: Rc<dyn ConfigView> = Rc::new(StaticConfig::new());
        let registry = SessionRegistry::new();
        // No lookups are exercised in these tests; a resolver that
        // would error on `/etc/resolv.conf`-less sandboxes is fine as
        // long as we never await one of its futures.
        let resolver = Rc::new(Resolver::new(
            Default::default(),
            Default::default(),
            false,
        ));
        Route::new(local.to_string(), remote.to_string(), config, registry, resolver)
    }

    #[test]
    fn transmit_stanza_queues_when_to_session_unauthorized() {
        let route = test_route("a.example", "b.example");
        let to = dummy_session("s1");
        *route.to_session.borrow_mut() = to.downgrade();

        route.transmit_stanza(Stanza::new("<message xmlns='jabber:server'/>".parse().unwrap()));
        assert_eq!(route.pending_stanza_count(), 1);
    }

    #[test]
    fn transmit_stanza_sends_immediately_once_authorized_and_queue_empty() {
        let route = test_route("a.example", "b.example");
        let to = dummy_session("s1");
        to.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Authorized);
        *route.to_session.borrow_mut() = to.downgrade();

        route.transmit_stanza(Stanza::new("<message xmlns='jabber:server'/>".parse().unwrap()));
        assert_eq!(route.pending_stanza_count(), 0);
    }

    #[test]
    fn session_authenticated_flushes_queued_stanzas_in_order() {
        let route = test_route("a.example", "b.example");
        let to = dummy_session("s1");
        *route.to_session.borrow_mut() = to.downgrade();

        route.transmit_stanza(Stanza::new(
            "<message xmlns='jabber:server' id='1'/>".parse().unwrap(),
        ));
        route.transmit_stanza(Stanza::new(
            "<message xmlns='jabber:server' id='2'/>".parse().unwrap(),
        ));
        assert_eq!(route.pending_stanza_count(), 2);

        to.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Authorized);
        route.session_authenticated(to.clone());
        assert_eq!(route.pending_stanza_count(), 0);
    }

    #[test]
    fn transmit_verify_promotes_verify_session_queue() {
        let route = test_route("b.example", "a.example");
        let vrfy = dummy_session("s1");
        vrfy.set_auth_ready();
        *route.verify_session.borrow_mut() = vrfy.downgrade();

        route.transmit_verify(Verify {
            id: "s1".into(),
            to: "a.example".into(),
            from: "b.example".into(),
            key: "KEY".into(),
        });
        // auth_ready + empty queue => sent immediately, nothing queued.
        assert_eq!(route.pending_dialback_count(), 0);
    }

    #[test]
    fn transmit_verify_queues_when_not_auth_ready() {
        // `transmit_verify` falls through to `begin_srv_lookup`, which
        // spawns a lookup task on the current `LocalSet` — needed here
        // even though the lookup itself never gets polled to completion.
        let local = tokio::task::LocalSet::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        local.block_on(&rt, async {
            let route = test_route("b.example", "a.example");
            let vrfy = dummy_session("s1");
            *route.verify_session.borrow_mut() = vrfy.downgrade();

            route.transmit_verify(Verify {
                id: "s1".into(),
                to: "a.example".into(),
                from: "b.example".into(),
                key: "KEY".into(),
            });
            assert_eq!(route.pending_dialback_count(), 1);
        });
    }

    #[test]
    fn names_collated_fires_once_for_non_dnssec_srv() {
        let route = test_route("a.example", "b.example");
        *route.srv.borrow_mut() = Some(SrvResult {
            targets: vec![SrvTarget {
                host: "b.example".into(),
                port: 5269,
                priority: 0,
                weight: 0,
            }],
            dnssec_valid: false,
        });

        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        route.collate_names(move |_| fired2.set(fired2.get() + 1));
        assert_eq!(fired.get(), 1);

        // A second registration after the flag is set fires immediately too.
        let fired3 = fired.clone();
        route.collate_names(move |_| fired3.set(fired3.get() + 1));
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn names_collated_waits_for_all_tlsa_lookups_under_dnssec() {
        let route = test_route("a.example", "b.example");
        *route.srv.borrow_mut() = Some(SrvResult {
            targets: vec![
                SrvTarget {
                    host: "xmpp1.b.example".into(),
                    port: 5269,
                    priority: 0,
                    weight: 0,
                },
                SrvTarget {
                    host: "xmpp2.b.example".into(),
                    port: 5269,
                    priority: 1,
                    weight: 0,
                },
            ],
            dnssec_valid: true,
        });

        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        route.collate_names(move |_| fired2.set(fired2.get() + 1));
        assert_eq!(fired.get(), 0);

        route.handle_tlsa_result(5269, "xmpp1.b.example".into(), Ok(TlsaResult::default()));
        assert_eq!(fired.get(), 0);

        // The second lookup errors — names_collated must still fire.
        route.handle_tlsa_result(
            5269,
            "xmpp2.b.example".into(),
            Err(ResolveError::from("simulated failure")),
        );
        assert_eq!(fired.get(), 1);
    }
}
