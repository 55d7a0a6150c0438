//! Minimal S2S listener wiring together `SessionRegistry`,
//! `RouteTables`, and the dialback dispatcher: accept a connection,
//! negotiate the stream, and let `dialback::handle_element` drive
//! everything from there. Not a complete XMPP server (no TLS
//! termination, no stanza delivery to local handlers) — it shows how
//! the pieces in this crate are meant to be assembled.
//!
//! Grounded on `tokio-xmpp/examples/echo_server.rs`'s accept-loop
//! shape, adapted to the `tokio::task::LocalSet` this crate's
//! `NetSession`/`Route` types require (`XmlStream` is `!Send`).

use std::rc::Rc;

use xmpp_s2s_core::config::{ConfigView, StaticConfig};
use xmpp_s2s_core::dialback;
use xmpp_s2s_core::dns::Resolver;
use xmpp_s2s_core::registry::SessionRegistry;
use xmpp_s2s_core::route_table::RouteTables;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let local_domain = std::env::args().nth(1).unwrap_or_else(|| "localhost".to_string());

    let config: Rc<dyn ConfigView> = Rc::new(StaticConfig::new());
    let registry = SessionRegistry::new();
    let resolver = Rc::new(
        Resolver::from_system_conf()
            .unwrap_or_else(|_| Resolver::new(Default::default(), Default::default(), false)),
    );
    let route_tables = RouteTables::new(config, registry.clone(), resolver);

    let dispatch_tables = route_tables.clone();
    let dispatch_registry = registry.clone();
    registry.set_dispatch(move |session, element| {
        dialback::handle_element(&dispatch_tables, &dispatch_registry, session, element);
    });

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", 5269)).await?;
            log::info!("listening on :5269 for {}", local_domain);
            loop {
                let (socket, peer_addr) = listener.accept().await?;
                let registry = registry.clone();
                let local_domain = local_domain.clone();
                tokio::task::spawn_local(async move {
                    if let Err(e) = registry.accept(socket, local_domain, peer_addr).await {
                        log::warn!("accept from {} failed: {}", peer_addr, e);
                    }
                });
            }
        })
        .await
}
