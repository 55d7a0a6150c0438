//! `RouteTable`/`RouteTables`: the per-local-domain and top-level
//! singleton registries of [`Route`]s.
//!
//! Grounded on `RouteTable::routeTable`/`RouteTable::route` in
//! `examples/original_source/src/router.cc`, which lazily creates
//! exactly one `Route` per `(local, remote)` pair the first time
//! anyone asks for it and hands back the same one thereafter.

use std::collections::HashMap;
use std::cell::RefCell;
use std::rc::Rc;

use crate::config::ConfigView;
use crate::dns::Resolver;
use crate::registry::SessionRegistry;
use crate::route::Route;

/// Every `Route` whose `local_domain()` is the same one this table was
/// constructed for, keyed by remote domain.
pub struct RouteTable {
    local_domain: String,
    config: Rc<dyn ConfigView>,
    registry: Rc<SessionRegistry>,
    resolver: Rc<Resolver>,
    routes: RefCell<HashMap<String, Rc<Route>>>,
}

impl RouteTable {
    fn new(
        local_domain: String,
        config: Rc<dyn ConfigView>,
        registry: Rc<SessionRegistry>,
        resolver: Rc<Resolver>,
    ) -> Rc<Self> {
        Rc::new(RouteTable {
            local_domain,
            config,
            registry,
            resolver,
            routes: RefCell::new(HashMap::new()),
        })
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    pub fn config(&self) -> &Rc<dyn ConfigView> {
        &self.config
    }

    /// The `Route` for `remote_domain`, creating it on first use.
    /// Subsequent calls with the same `remote_domain` return the same
    /// `Rc`, matching `RouteTable::route`'s `m_routes.emplace` pattern.
    pub fn route(self: &Rc<Self>, remote_domain: &str) -> Rc<Route> {
        if let Some(route) = self.routes.borrow().get(remote_domain) {
            return route.clone();
        }
        let route = Route::new(
            self.local_domain.clone(),
            remote_domain.to_string(),
            self.config.clone(),
            self.registry.clone(),
            self.resolver.clone(),
        );
        self.routes
            .borrow_mut()
            .insert(remote_domain.to_string(), route.clone());
        route
    }
}

/// Top-level singleton mapping local domain to its [`RouteTable`].
/// Grounded on the free functions `RouteTable::routeTable(domain)` in
/// `examples/original_source/src/router.cc`, which is itself keyed by
/// local domain over a process-wide map.
pub struct RouteTables {
    config: Rc<dyn ConfigView>,
    registry: Rc<SessionRegistry>,
    resolver: Rc<Resolver>,
    tables: RefCell<HashMap<String, Rc<RouteTable>>>,
}

impl RouteTables {
    pub fn new(config: Rc<dyn ConfigView>, registry: Rc<SessionRegistry>, resolver: Rc<Resolver>) -> Rc<Self> {
        Rc::new(RouteTables {
            config,
            registry,
            resolver,
            tables: RefCell::new(HashMap::new()),
        })
    }

    /// The `RouteTable` for `local_domain`, creating it on first use.
    pub fn route_table(self: &Rc<Self>, local_domain: &str) -> Rc<RouteTable> {
        if let Some(table) = self.tables.borrow().get(local_domain) {
            return table.clone();
        }
        let table = RouteTable::new(
            local_domain.to_string(),
            self.config.clone(),
            self.registry.clone(),
            self.resolver.clone(),
        );
        self.tables
            .borrow_mut()
            .insert(local_domain.to_string(), table.clone());
        table
    }

    /// Shortcut for `route_table(local).route(remote)`, matching the
    /// original's `RouteTable::route(local, remote)` two-level lookup
    /// helper.
    pub fn route(self: &Rc<Self>, local_domain: &str, remote_domain: &str) -> Rc<Route> {
        self.route_table(local_domain).route(remote_domain)
    }

    pub fn config(&self) -> &Rc<dyn ConfigView> {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;

    fn tables() -> Rc<RouteTables> {
        let config: Rc<dyn ConfigView> = Rc::new(StaticConfig::new());
        let registry = SessionRegistry::new();
        let resolver = Rc::new(Resolver::new(Default::default(), Default::default(), false));
        RouteTables::new(config, registry, resolver)
    }

    #[test]
    fn route_is_a_singleton_per_local_remote_pair() {
        let tables = tables();
        let r1 = tables.route("a.example", "b.example");
        let r2 = tables.route("a.example", "b.example");
        assert!(Rc::ptr_eq(&r1, &r2));

        let r3 = tables.route("a.example", "c.example");
        assert!(!Rc::ptr_eq(&r1, &r3));
    }

    #[test]
    fn route_table_is_a_singleton_per_local_domain() {
        let tables = tables();
        let t1 = tables.route_table("a.example");
        let t2 = tables.route_table("a.example");
        assert!(Rc::ptr_eq(&t1, &t2));
    }

    #[test]
    fn routes_for_different_local_domains_are_independent() {
        let tables = tables();
        let r1 = tables.route("a.example", "remote.example");
        let r2 = tables.route("other.example", "remote.example");
        assert!(!Rc::ptr_eq(&r1, &r2));
        assert_eq!(r1.local_domain(), "a.example");
        assert_eq!(r2.local_domain(), "other.example");
    }
}
