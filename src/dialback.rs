//! XEP-0220 Server Dialback: the `jabber:server:dialback` inbound
//! element dispatcher, and the `urn:xmpp:features:dialback` stream
//! feature advertisement.
//!
//! Ported from `NewDialback`/`Dialback` in
//! `examples/original_source/src/dialback.cc`. `handle_element` is the
//! same `handle()` dispatch-by-name-and-type switch; `handle_result`,
//! `handle_result_valid`, `handle_verify` and `handle_verify_response`
//! are `result`/`result_valid`/`verify`/`verify_valid` respectively.
//! `result_invalid`/`result_error`/`verify_invalid` are merged into one
//! `handle_result_rejected`/`handle_verify_rejected` pair (DESIGN.md
//! Open Question 1) instead of being left `Unimplemented`.

use std::rc::Rc;

use minidom::Element;

use crate::config::TransportType;
use crate::error::{AuthError, Error, StreamError};
use crate::ns;
use crate::registry::SessionRegistry;
use crate::route::build_db_result;
use crate::route_table::RouteTables;
use crate::session::{AuthState, Direction, NetSession};
use crate::stanza::Verify;

/// Build the `<dialback xmlns='urn:xmpp:features:dialback'><errors/></dialback>`
/// stream-feature offer, or `None` if TLS is required but not yet in
/// place. Mirrors `NewDialback::Description::offer`.
pub fn offer_feature(
    config: &dyn crate::config::ConfigView,
    local_domain: &str,
    remote_domain: &str,
    secured: bool,
) -> Option<Element> {
    if !secured && (config.requires_tls(local_domain) || config.requires_tls(remote_domain)) {
        return None;
    }
    let errors = Element::builder("errors", ns::DIALBACK_FEATURE).build();
    Some(
        Element::builder("dialback", ns::DIALBACK_FEATURE)
            .append(errors)
            .build(),
    )
}

/// Entry point registered with [`SessionRegistry::set_dispatch`]:
/// routes one inbound top-level element to the right handler by
/// namespace, element name, and `type` attribute, exactly as
/// `Dialback::handle` does.
pub fn handle_element(route_tables: &Rc<RouteTables>, registry: &Rc<SessionRegistry>, session: NetSession, element: Element) {
    if !element.has_ns(ns::DIALBACK) {
        log::warn!("dropping <{}/>: not in {}", element.name(), ns::DIALBACK);
        return;
    }
    let result = match (element.name(), element.attr("type")) {
        ("result", None) => handle_result(route_tables, session.clone(), element),
        ("result", Some("valid")) => handle_result_valid(&session, &element),
        ("result", Some("invalid")) | ("result", Some("error")) => {
            handle_result_rejected(route_tables, &session, &element)
        }
        ("result", Some(other)) => {
            log::warn!("unknown type '{}' on db:result", other);
            Err(Error::Stream(StreamError::UnsupportedStanzaType))
        }
        ("verify", None) => handle_verify(route_tables, &session, &element),
        ("verify", Some("valid")) | ("verify", Some("invalid")) => {
            handle_verify_response(&session, registry, &element)
        }
        (other, _) => {
            log::warn!("unknown dialback element <{}/>", other);
            Err(Error::Stream(StreamError::UnsupportedStanzaType))
        }
    };
    if let Err(e) = result {
        session.fail(e);
    }
}

fn required_attr<'a>(element: &'a Element, name: &str) -> Result<&'a str, Error> {
    element
        .attr(name)
        .filter(|v| !v.is_empty())
        .ok_or(Error::Stream(StreamError::UnsupportedStanzaType))
}

/// Inbound `<db:result from to>KEY</db:result>` with no `type`: a
/// request to authenticate `from` as the owner of the dialback key.
/// Ports `Dialback::result`.
fn handle_result(route_tables: &Rc<RouteTables>, session: NetSession, element: Element) -> Result<(), Error> {
    let key = element.text();
    if key.is_empty() {
        return Err(Error::Stream(StreamError::UnsupportedStanzaType));
    }
    let from = required_attr(&element, "from")?.to_string();
    let to = required_attr(&element, "to")?.to_string();

    let config = route_tables.config();
    if config.transport_type(&from) != TransportType::S2S {
        return Err(Error::Stream(StreamError::HostUnknown));
    }
    if !session.secured() && config.requires_tls(&to) {
        return Err(Error::Stream(StreamError::HostUnknown));
    }

    let route = route_tables.route(&to, &from);
    session.hold_dialback_key(key.clone());
    route.collate_names(move |route| {
        result_step(route, session, key);
    });
    Ok(())
}

/// Once name collation for `route` has completed: short-circuit via an
/// already-verified TLS identity, or queue a `db:verify` to the
/// originating server. Ports `Dialback::result_step`.
///
/// Divergence from the literal original: Metre's C++ falls through
/// from the TLS shortcut into the `auth_dialback`/verify-transmission
/// path regardless, an artifact of `result_step` never returning early.
/// Scenario S4 calls for replying immediately "without issuing a
/// db:verify" once TLS has already proven the identity, so this
/// returns right after the shortcut instead (DESIGN.md Open Question).
fn result_step(route: Rc<crate::route::Route>, session: NetSession, key: String) {
    if session.tls_auth_ok(route.remote_domain()) {
        let result = build_db_result(route.local_domain(), route.remote_domain(), Some("valid"), None);
        if session.send(result).is_ok() {
            session.set_auth_pair(
                route.local_domain(),
                route.remote_domain(),
                Direction::Inbound,
                AuthState::Authorized,
            );
        }
        session.release_dialback_key(&key);
        return;
    }

    let config_allows = route.config_allows_dialback();
    if !config_allows {
        session.release_dialback_key(&key);
        session.fail(Error::Stream(StreamError::HostUnknown));
        return;
    }

    session.set_auth_pair(
        route.local_domain(),
        route.remote_domain(),
        Direction::Inbound,
        AuthState::Requested,
    );
    route.transmit_verify(Verify {
        id: session.stream_id().to_string(),
        to: route.remote_domain().to_string(),
        from: route.local_domain().to_string(),
        key: key.clone(),
    });
    session.release_dialback_key(&key);
}

/// Inbound `<db:result type='valid' to from/>`: our outbound
/// `db:result` was accepted. Ports `Dialback::result_valid`.
fn handle_result_valid(session: &NetSession, element: &Element) -> Result<(), Error> {
    let to = required_attr(element, "to")?.to_string();
    let from = required_attr(element, "from")?.to_string();
    if session.auth_pair(&to, &from, Direction::Outbound) >= AuthState::Requested {
        session.set_auth_pair(&to, &from, Direction::Outbound, AuthState::Authorized);
    }
    Ok(())
}

/// Inbound `<db:result type='invalid'|'error' to from/>`: our outbound
/// `db:result` was rejected. Merges `result_invalid`/`result_error`
/// (both `Unimplemented` in the original) into one hard failure of the
/// pair (DESIGN.md Open Question 1): the OUTBOUND pair is dropped back
/// to unauthorized and its Route's queued stanzas are bounced, but the
/// session itself (other pairs may share it) is left running — this
/// never returns `Err`, so `handle_element` won't fail the session.
fn handle_result_rejected(route_tables: &Rc<RouteTables>, session: &NetSession, element: &Element) -> Result<(), Error> {
    let to = required_attr(element, "to")?.to_string();
    let from = required_attr(element, "from")?.to_string();
    log::warn!("dialback result for ({to}, {from}) rejected by peer");
    session.reject_pair(&to, &from, Direction::Outbound);
    route_tables.route(&to, &from).fail_pending_stanzas(&AuthError::Rejected);
    Ok(())
}

/// Inbound `<db:verify id to from>KEY</db:verify>`: someone is asking
/// us to confirm or deny a key we issued. Ports `Dialback::verify`.
fn handle_verify(route_tables: &Rc<RouteTables>, session: &NetSession, element: &Element) -> Result<(), Error> {
    let id = required_attr(element, "id")?.to_string();
    let to = required_attr(element, "to")?.to_string();
    let from = required_attr(element, "from")?.to_string();
    let presented = element.text();

    let expected = route_tables.config().dialback_key(&id, &to, &from);
    let validity = if presented == expected { "valid" } else { "invalid" };

    let verify = Element::builder("verify", ns::DIALBACK)
        .attr("from", to.as_str())
        .attr("to", from.as_str())
        .attr("id", id.as_str())
        .attr("type", validity)
        .build();
    session.send(verify).map_err(|_| Error::Stream(StreamError::StreamClosed))
}

/// Inbound `<db:verify type='valid'|'invalid' id to from/>`: the
/// response to a `db:verify` we sent earlier, delivered on the session
/// named by `id` (which may not be the session this arrived on). Ports
/// `Dialback::verify_valid`; `verify_invalid` (originally
/// `Unimplemented`) is folded in as the rejecting branch.
///
/// `arrived_on` is the stream this response came in on, which spec.md
/// §4.4/§8 requires to be OUTBOUND — Metre enforces the same check
/// (`examples/original_source/src/dialback.cc:174`,
/// `if (m_stream.direction() != OUTBOUND) throw unsupported_stanza_type`).
/// Missing `id`'s session is a programming error (spec.md §7) and stays
/// stream-fatal; a `type='invalid'` verdict is auth-fatal for just that
/// INBOUND pair and is handled here without failing either session.
fn handle_verify_response(arrived_on: &NetSession, registry: &Rc<SessionRegistry>, element: &Element) -> Result<(), Error> {
    if arrived_on.direction() != Direction::Outbound {
        return Err(Error::Stream(StreamError::UnsupportedStanzaType));
    }
    let id = required_attr(element, "id")?;
    let to = required_attr(element, "to")?.to_string();
    let from = required_attr(element, "from")?.to_string();
    let valid = element.attr("type") == Some("valid");

    let target = registry
        .by_stream_id(id)
        .ok_or(Error::Auth(AuthError::NoRoute(from.clone())))?;

    if !valid {
        log::warn!("db:verify for ({to}, {from}) came back invalid");
        target.reject_pair(&to, &from, Direction::Inbound);
        return Ok(());
    }
    if target.auth_pair(&to, &from, Direction::Inbound) >= AuthState::Requested {
        let result = build_db_result(&to, &from, Some("valid"), None);
        if target.send(result).is_ok() {
            target.set_auth_pair(&to, &from, Direction::Inbound, AuthState::Authorized);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, StaticConfig};
    use crate::dns::Resolver;
    use crate::route::test_support::{collated_route, collated_route_with_verify_session};
    use crate::session::test_support::{dummy_session, dummy_session_with_outbox};

    fn route_tables_with(local: &str, require_tls: bool) -> Rc<RouteTables> {
        let config: Rc<dyn crate::config::ConfigView> = Rc::new(StaticConfig::new().with_domain(
            local,
            DomainConfig {
                dialback_secret: "s3cr3t".into(),
                require_tls,
                ..DomainConfig::default()
            },
        ));
        let registry = SessionRegistry::new();
        let resolver = Rc::new(Resolver::new(Default::default(), Default::default(), false));
        RouteTables::new(config, registry, resolver)
    }

    #[test]
    fn offer_feature_suppressed_when_tls_required_and_absent() {
        let config = StaticConfig::new().with_domain(
            "a.example",
            DomainConfig {
                require_tls: true,
                ..DomainConfig::default()
            },
        );
        assert!(offer_feature(&config, "a.example", "b.example", false).is_none());
        assert!(offer_feature(&config, "a.example", "b.example", true).is_some());
    }

    #[test]
    fn offer_feature_present_when_tls_not_required() {
        let config = StaticConfig::new();
        assert!(offer_feature(&config, "a.example", "b.example", false).is_some());
    }

    #[test]
    fn handle_verify_replies_valid_for_a_matching_key() {
        let tables = route_tables_with("a.example", false);
        let session = dummy_session("stream-1");
        let key = tables.config().dialback_key("stream-1", "a.example", "b.example");
        let element: Element = format!(
            "<verify xmlns='jabber:server:dialback' id='stream-1' to='a.example' from='b.example'>{key}</verify>"
        )
        .parse()
        .unwrap();
        handle_verify(&tables, &session, &element).unwrap();
    }

    #[test]
    fn handle_result_valid_promotes_requested_pair_to_authorized() {
        let session = dummy_session("s1");
        session.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Requested);
        let element: Element =
            "<result xmlns='jabber:server:dialback' type='valid' to='a.example' from='b.example'/>"
                .parse()
                .unwrap();
        handle_result_valid(&session, &element).unwrap();
        assert_eq!(
            session.auth_pair("a.example", "b.example", Direction::Outbound),
            AuthState::Authorized
        );
    }

    #[test]
    fn handle_result_rejected_downgrades_pair_and_bounces_queue_without_failing_session() {
        // `transmit_stanza` falls through to `begin_srv_lookup` (spawns
        // on the current `LocalSet`) when the route has no session yet
        // to queue against directly — needed here purely to get a
        // stanza into the queue, never polled to completion.
        let local = tokio::task::LocalSet::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        local.block_on(&rt, async {
            let tables = route_tables_with("a.example", false);
            let session = dummy_session("s1");
            session.set_auth_pair("a.example", "b.example", Direction::Outbound, AuthState::Requested);
            let route = tables.route("a.example", "b.example");
            route.transmit_stanza(crate::stanza::Stanza::new(
                "<message xmlns='jabber:server'/>".parse().unwrap(),
            ));
            assert_eq!(route.pending_stanza_count(), 1);

            let element: Element =
                "<result xmlns='jabber:server:dialback' type='invalid' to='a.example' from='b.example'/>"
                    .parse()
                    .unwrap();
            assert!(handle_result_rejected(&tables, &session, &element).is_ok());

            assert_eq!(
                session.auth_pair("a.example", "b.example", Direction::Outbound),
                AuthState::None
            );
            assert_eq!(route.pending_stanza_count(), 0);
        });
    }

    #[test]
    fn handle_verify_response_rejects_invalid_type_without_failing_either_session() {
        let registry = SessionRegistry::new();
        let target = dummy_session("s1");
        target.set_auth_pair("a.example", "b.example", Direction::Inbound, AuthState::Requested);
        registry.insert(
            crate::registry::Address {
                host: "b.example".into(),
                port: 5269,
            },
            target.clone(),
        );
        let arrived_on = dummy_session_with_outbox("verify-conn", Direction::Outbound).0;
        let element: Element =
            "<verify xmlns='jabber:server:dialback' type='invalid' id='s1' to='a.example' from='b.example'/>"
                .parse()
                .unwrap();
        assert!(handle_verify_response(&arrived_on, &registry, &element).is_ok());
        assert_eq!(
            target.auth_pair("a.example", "b.example", Direction::Inbound),
            AuthState::None
        );
    }

    #[test]
    fn handle_verify_response_on_inbound_stream_is_a_stream_error() {
        let registry = SessionRegistry::new();
        let arrived_on = dummy_session("s1");
        assert_eq!(arrived_on.direction(), Direction::Inbound);
        let element: Element =
            "<verify xmlns='jabber:server:dialback' type='valid' id='s1' to='a.example' from='b.example'/>"
                .parse()
                .unwrap();
        assert!(matches!(
            handle_verify_response(&arrived_on, &registry, &element),
            Err(Error::Stream(StreamError::UnsupportedStanzaType))
        ));
    }

    fn resolver() -> Rc<Resolver> {
        Rc::new(Resolver::new(Default::default(), Default::default(), false))
    }

    /// S4 from spec.md §8: a peer whose TLS certificate already
    /// authenticates it gets an immediate `db:result type='valid'`
    /// reply and no `db:verify` is ever issued.
    #[test]
    fn s4_tls_shortcut_replies_valid_without_issuing_verify() {
        let config: Rc<dyn crate::config::ConfigView> = Rc::new(StaticConfig::new());
        let route = collated_route("a.example", "b.example", config, SessionRegistry::new(), resolver());

        let (session, mut outbox) = dummy_session_with_outbox("s1", Direction::Inbound);
        session.set_tls_verified_domain("b.example");

        result_step(route.clone(), session.clone(), "KEY".into());

        let sent = outbox.try_recv().expect("a db:result should have been sent");
        assert_eq!(sent.name(), "result");
        assert_eq!(sent.attr("type"), Some("valid"));
        assert!(outbox.try_recv().is_err(), "no db:verify should follow the shortcut");
        assert_eq!(
            session.auth_pair("a.example", "b.example", Direction::Inbound),
            AuthState::Authorized
        );
        assert_eq!(route.pending_dialback_count(), 0);
    }

    /// S5 from spec.md §8: the peer requires TLS per configuration but
    /// the incoming stream is not secured — a host-unknown stream error,
    /// no dialback key retained.
    #[test]
    fn s5_policy_rejection_when_tls_required_and_stream_unsecured() {
        let tables = route_tables_with("a.example", true);
        let session = dummy_session("s1");
        assert!(!session.secured());

        let element: Element =
            "<result xmlns='jabber:server:dialback' from='b.example' to='a.example'>KEY</result>"
                .parse()
                .unwrap();
        assert!(matches!(
            handle_result(&tables, session, element),
            Err(Error::Stream(StreamError::HostUnknown))
        ));
    }

    /// S1 from spec.md §8: happy dialback end to end — the db:result
    /// arrives inbound, a db:verify round-trips over the (separate)
    /// verify connection, and the original inbound session ends up
    /// `AUTHORIZED` with a `db:result type='valid'` reply.
    #[test]
    fn s1_happy_dialback_end_to_end() {
        let tables = route_tables_with("a.example", false);
        let (inbound, mut inbound_out) = dummy_session_with_outbox("s-inbound", Direction::Inbound);
        let (verify_conn, mut verify_out) = dummy_session_with_outbox("verify-conn", Direction::Outbound);
        verify_conn.set_auth_ready();

        let route = collated_route_with_verify_session(
            "a.example",
            "b.example",
            tables.config().clone(),
            SessionRegistry::new(),
            resolver(),
            &verify_conn,
        );
        let key = tables.config().dialback_key(inbound.stream_id(), "a.example", "b.example");

        result_step(route.clone(), inbound.clone(), key);
        assert_eq!(
            inbound.auth_pair("a.example", "b.example", Direction::Inbound),
            AuthState::Requested
        );

        let outgoing_verify = verify_out.try_recv().expect("db:verify should go out over the verify connection");
        assert_eq!(outgoing_verify.name(), "verify");
        assert_eq!(outgoing_verify.attr("id"), Some(inbound.stream_id()));
        assert_eq!(route.pending_dialback_count(), 0);

        // The authoritative server answers the verify with type='valid'.
        let verify_response: Element = format!(
            "<verify xmlns='jabber:server:dialback' type='valid' id='{}' to='a.example' from='b.example'/>",
            inbound.stream_id()
        )
        .parse()
        .unwrap();
        let registry = SessionRegistry::new();
        registry.insert(
            crate::registry::Address {
                host: "b.example".into(),
                port: 5269,
            },
            inbound.clone(),
        );
        handle_verify_response(&verify_conn, &registry, &verify_response).unwrap();

        assert_eq!(
            inbound.auth_pair("a.example", "b.example", Direction::Inbound),
            AuthState::Authorized
        );
        let final_reply = inbound_out.try_recv().expect("the valid db:result should have been sent");
        assert_eq!(final_reply.name(), "result");
        assert_eq!(final_reply.attr("type"), Some("valid"));
    }
}
