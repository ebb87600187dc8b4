//! Route and action registries layered over the segment trie.
//!
//! Routes are stored one per addressed node under the keys `:` (single
//! parameter), `*` (catch-all) and the literal for static segments. Actions
//! are stored in ordered sets under the same kind of tree, and lookup
//! investigates every branch that can match the request path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

use crate::error::Error;
use crate::request::Target;
use crate::route::{Params, Pattern, PatternError, Route, Segment};
use crate::trie::Trie;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("route collision at {0}")]
    Collision(String),

    #[error("ambiguous pattern {0}: {1}")]
    Ambiguous(String, &'static str),
}

/// A successful route lookup.
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: Params,
}

#[derive(Default)]
pub struct RouteRegistry {
    trie: Trie<Route>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        RouteRegistry { trie: Trie::new() }
    }

    /// Register a route. Fails on position collisions and on patterns that
    /// would make lookups ambiguous: parameter and catch-all subtrees are
    /// exclusive with each other and with static siblings, and a catch-all
    /// child excludes a route at its parent (the catch-all also matches the
    /// parent path itself).
    pub fn add(&self, route: Route) -> Result<(), RegistryError> {
        let raw = route.pattern().raw().to_string();
        let result = self.trie.write(|cursor| {
            let segments: Vec<Segment> = route.pattern().segments().to_vec();
            for seg in &segments {
                match seg {
                    Segment::Static(s) => {
                        if cursor.has_child(":") || cursor.has_child("*") {
                            return Err(RegistryError::Ambiguous(
                                raw.clone(),
                                "static segment next to a parameter or catch-all",
                            ));
                        }
                        cursor.next_or_create(s);
                    }
                    Segment::Param(_) => {
                        if cursor.has_child_matching(|k| k != ":") {
                            return Err(RegistryError::Ambiguous(
                                raw.clone(),
                                "parameter next to a static or catch-all sibling",
                            ));
                        }
                        cursor.next_or_create(":");
                    }
                    Segment::CatchAll(_) => {
                        if cursor.has_child_matching(|k| k != "*") {
                            return Err(RegistryError::Ambiguous(
                                raw.clone(),
                                "catch-all next to other siblings",
                            ));
                        }
                        if cursor.value().is_some() {
                            return Err(RegistryError::Collision(raw.clone()));
                        }
                        cursor.next_or_create("*");
                    }
                }
            }
            if cursor.has_child("*") {
                return Err(RegistryError::Collision(raw.clone()));
            }
            cursor
                .set_if_absent(route)
                .map(|_| ())
                .map_err(|_| RegistryError::Collision(raw.clone()))
        });
        if result.is_err() {
            // drop any nodes the failed walk created
            self.trie.prune();
        }
        result
    }

    /// Remove the route registered under exactly this pattern.
    pub fn remove(&self, pattern: &str) -> Result<Option<Arc<Route>>, PatternError> {
        let pattern = Pattern::parse(pattern)?;
        let keys: Vec<&str> = pattern.segments().iter().map(Segment::key).collect();
        Ok(self.trie.clear(&keys))
    }

    /// Look the request path up. At each level a static child is preferred
    /// over `:`, which is preferred over `*`; a `*` child terminates the
    /// walk and binds the remaining segments.
    pub fn lookup(&self, target: &Target) -> Result<RouteMatch, Error> {
        let decoded = target.decoded_segments();
        let not_found = || Error::NoRouteFound(target.path().to_string());

        let mut cursor = self.trie.read();
        let mut terminal: Option<Arc<Route>> = None;
        for seg in decoded {
            if let Some(c) = cursor.next(seg) {
                cursor = c;
            } else if let Some(c) = cursor.next(":") {
                cursor = c;
            } else if let Some(c) = cursor.next("*") {
                terminal = c.value();
                break;
            } else {
                return Err(not_found());
            }
        }
        let route = match terminal {
            Some(r) => r,
            None => match cursor.value() {
                Some(r) => r,
                // a trailing catch-all also matches its parent path
                None => cursor
                    .next("*")
                    .and_then(|c| c.value())
                    .ok_or_else(not_found)?,
            },
        };
        let params = route
            .pattern()
            .bind(target.raw_segments(), target.decoded_segments());
        Ok(RouteMatch { route, params })
    }
}

/// Sort direction for collected actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOrder {
    /// Ascending position key, then insertion order. Outermost first.
    Before,
    /// Descending position key, then insertion order. Innermost last.
    After,
}

struct ActionEntry<A: ?Sized> {
    seq: u64,
    pattern: Pattern,
    action: Arc<A>,
}

struct ActionSet<A: ?Sized> {
    entries: RwLock<Vec<ActionEntry<A>>>,
}

impl<A: ?Sized> ActionSet<A> {
    fn new() -> Self {
        ActionSet {
            entries: RwLock::new(Vec::new()),
        }
    }
}

/// An action resolved for one request, with its own parameter binding.
pub struct ResolvedAction<A: ?Sized> {
    pub action: Arc<A>,
    pub params: Params,
}

/// Before- or after-action registry. Unlike routes, many actions can occupy
/// one position and patterns of different kinds may coexist anywhere.
pub struct ActionRegistry<A: ?Sized> {
    trie: Trie<ActionSet<A>>,
    seq: AtomicU64,
    order: ActionOrder,
}

impl<A: ?Sized + Send + Sync> ActionRegistry<A> {
    pub fn new(order: ActionOrder) -> Self {
        ActionRegistry {
            trie: Trie::new(),
            seq: AtomicU64::new(0),
            order,
        }
    }

    pub fn add(&self, pattern: &str, action: Arc<A>) -> Result<(), PatternError> {
        let pattern = Pattern::parse(pattern)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.trie.write(|cursor| {
            for seg in pattern.segments() {
                cursor.next_or_create(seg.key());
            }
            let set = cursor.get_or_insert_with(ActionSet::new);
            set.entries.write().push(ActionEntry {
                seq,
                pattern,
                action,
            });
        });
        Ok(())
    }

    /// Collect every action whose pattern matches the request path.
    ///
    /// Traversal keeps a frontier of candidate nodes per segment (static and
    /// `:` children); catch-all children of frontier nodes match
    /// immediately. The result is ordered by this registry's [`ActionOrder`].
    pub fn lookup(&self, target: &Target) -> Vec<ResolvedAction<A>> {
        let decoded = target.decoded_segments();
        let mut hits: Vec<(String, u64, Pattern, Arc<A>)> = Vec::new();

        let collect = |key: &str, set: &Arc<ActionSet<A>>, hits: &mut Vec<_>| {
            for e in set.entries.read().iter() {
                hits.push((key.to_string(), e.seq, e.pattern.clone(), e.action.clone()));
            }
        };

        let mut frontier = vec![(String::new(), self.trie.read())];
        if let Some(c) = frontier[0].1.next("*")
            && let Some(set) = c.value()
        {
            collect("/*", &set, &mut hits);
        }
        for seg in decoded {
            let mut advanced = Vec::new();
            for (key, node) in &frontier {
                if let Some(c) = node.next(seg) {
                    advanced.push((format!("{key}/{seg}"), c));
                }
                if let Some(c) = node.next(":") {
                    advanced.push((format!("{key}/:"), c));
                }
            }
            for (key, node) in &advanced {
                if let Some(c) = node.next("*")
                    && let Some(set) = c.value()
                {
                    collect(&format!("{key}/*"), &set, &mut hits);
                }
            }
            frontier = advanced;
        }
        for (key, node) in &frontier {
            if let Some(set) = node.value() {
                let key = if key.is_empty() { "/" } else { key.as_str() };
                collect(key, &set, &mut hits);
            }
        }

        match self.order {
            ActionOrder::Before => hits.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1))),
            ActionOrder::After => hits.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1))),
        }

        hits.into_iter()
            .map(|(_, _, pattern, action)| ResolvedAction {
                params: pattern.bind(target.raw_segments(), target.decoded_segments()),
                action,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::request::Request;
    use crate::response::Response;
    use crate::route::Method;

    fn handler() -> impl crate::route::Handler {
        |_: &mut Request, _: &Params| -> Result<Response> { Ok(Response::new(200)) }
    }

    fn target(path: &str) -> Target {
        Target::parse(path)
    }

    fn route(pattern: &str) -> Route {
        Route::new(pattern).unwrap().on(Method::Get, handler())
    }

    #[test]
    fn static_lookup() {
        let r = RouteRegistry::new();
        r.add(route("/hello/world")).unwrap();
        assert!(r.lookup(&target("/hello/world")).is_ok());
        assert!(matches!(
            r.lookup(&target("/hello")),
            Err(Error::NoRouteFound(_))
        ));
    }

    #[test]
    fn param_lookup_binds_both_forms() {
        let r = RouteRegistry::new();
        r.add(route("/users/:id")).unwrap();
        let m = r.lookup(&target("/users/a%20b")).unwrap();
        assert_eq!(m.params.get("id"), Some("a b"));
        assert_eq!(m.params.get_raw("id"), Some("a%20b"));
    }

    #[test]
    fn catch_all_binds_remainder_and_parent() {
        let r = RouteRegistry::new();
        r.add(route("/assets/*path")).unwrap();
        let m = r.lookup(&target("/assets/js/app.js")).unwrap();
        assert_eq!(m.params.get("path"), Some("js/app.js"));
        let m = r.lookup(&target("/assets")).unwrap();
        assert_eq!(m.params.get("path"), Some("/"));
    }

    #[test]
    fn two_routes_cannot_share_a_position() {
        let r = RouteRegistry::new();
        r.add(route("/a/b")).unwrap();
        assert!(matches!(
            r.add(route("/a/b")),
            Err(RegistryError::Collision(_))
        ));
    }

    #[test]
    fn param_and_static_siblings_are_exclusive() {
        let r = RouteRegistry::new();
        r.add(route("/items/list")).unwrap();
        assert!(matches!(
            r.add(route("/items/:id")),
            Err(RegistryError::Ambiguous(..))
        ));
    }

    #[test]
    fn catch_all_excludes_route_at_parent() {
        let r = RouteRegistry::new();
        r.add(route("/files")).unwrap();
        assert!(matches!(
            r.add(route("/files/*rest")),
            Err(RegistryError::Collision(_))
        ));

        let r = RouteRegistry::new();
        r.add(route("/files/*rest")).unwrap();
        assert!(matches!(
            r.add(route("/files")),
            Err(RegistryError::Collision(_))
        ));
    }

    #[test]
    fn failed_add_leaves_registry_intact() {
        let r = RouteRegistry::new();
        r.add(route("/files/*rest")).unwrap();
        assert!(r.add(route("/files")).is_err());
        let m = r.lookup(&target("/files/x")).unwrap();
        assert_eq!(m.params.get("rest"), Some("x"));
    }

    #[test]
    fn removal_unregisters() {
        let r = RouteRegistry::new();
        r.add(route("/gone/soon")).unwrap();
        assert!(r.remove("/gone/soon").unwrap().is_some());
        assert!(r.lookup(&target("/gone/soon")).is_err());
        // position is free again
        r.add(route("/gone/soon")).unwrap();
    }

    #[test]
    fn lookup_prefers_static_then_param_then_catch_all() {
        // the registries forbid mixing at one position, so exercise the
        // priority walk over three separate trees
        let statics = RouteRegistry::new();
        statics.add(route("/v/x")).unwrap();
        assert!(statics.lookup(&target("/v/x")).is_ok());

        let params = RouteRegistry::new();
        params.add(route("/v/:p")).unwrap();
        let m = params.lookup(&target("/v/x")).unwrap();
        assert_eq!(m.params.get("p"), Some("x"));

        let wild = RouteRegistry::new();
        wild.add(route("/v/*rest")).unwrap();
        let m = wild.lookup(&target("/v/x")).unwrap();
        assert_eq!(m.params.get("rest"), Some("x"));
    }

    type Probe = dyn Fn() -> &'static str + Send + Sync;

    fn action_registry(order: ActionOrder) -> ActionRegistry<Probe> {
        ActionRegistry::new(order)
    }

    #[test]
    fn before_actions_sort_outermost_first() {
        let reg = action_registry(ActionOrder::Before);
        reg.add("/api/:v/users", Arc::new(|| "inner")).unwrap();
        reg.add("/*all", Arc::new(|| "outer")).unwrap();
        reg.add("/api/*rest", Arc::new(|| "mid")).unwrap();
        let got: Vec<_> = reg
            .lookup(&target("/api/v1/users"))
            .iter()
            .map(|r| (r.action)())
            .collect();
        assert_eq!(got, vec!["outer", "mid", "inner"]);
    }

    #[test]
    fn after_actions_sort_innermost_last() {
        let reg = action_registry(ActionOrder::After);
        reg.add("/api/:v/users", Arc::new(|| "inner")).unwrap();
        reg.add("/*all", Arc::new(|| "outer")).unwrap();
        let got: Vec<_> = reg
            .lookup(&target("/api/v1/users"))
            .iter()
            .map(|r| (r.action)())
            .collect();
        assert_eq!(got, vec!["inner", "outer"]);
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let reg = action_registry(ActionOrder::Before);
        reg.add("/x", Arc::new(|| "first")).unwrap();
        reg.add("/x", Arc::new(|| "second")).unwrap();
        let got: Vec<_> = reg
            .lookup(&target("/x"))
            .iter()
            .map(|r| (r.action)())
            .collect();
        assert_eq!(got, vec!["first", "second"]);
    }

    #[test]
    fn actions_bind_their_own_params() {
        let reg = action_registry(ActionOrder::Before);
        reg.add("/files/*rest", Arc::new(|| "a")).unwrap();
        let resolved = reg.lookup(&target("/files/a/b"));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].params.get("rest"), Some("a/b"));
    }

    #[test]
    fn catch_all_action_fires_on_parent_path() {
        let reg = action_registry(ActionOrder::Before);
        reg.add("/files/*rest", Arc::new(|| "a")).unwrap();
        let resolved = reg.lookup(&target("/files"));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].params.get("rest"), Some("/"));
    }
}
