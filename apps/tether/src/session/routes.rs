//! Per-identifier route lifecycle bookkeeping.
//!
//! A route is one tracked visual-link id together with its dedup stamp
//! and the host UI entry representing it. The table holds at most one
//! route per id and a single table-wide "last seen" (id, stamp) slot
//! used to suppress re-delivered remote requests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::{RouteListUi, UiHandle};

/// Wire encoding of "abort everything".
pub const ABORT_ALL_ID: &str = "";
pub const ABORT_ALL_STAMP: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Active,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub stamp: i64,
    pub state: RouteState,
    pub ui: UiHandle,
}

#[derive(Default)]
struct TableInner {
    routes: HashMap<String, Route>,
    last: Option<(String, i64)>,
}

pub struct RouteTable {
    inner: Mutex<TableInner>,
    ui: Arc<dyn RouteListUi>,
}

impl RouteTable {
    pub fn new(ui: Arc<dyn RouteListUi>) -> Self {
        RouteTable {
            inner: Mutex::new(TableInner::default()),
            ui,
        }
    }

    /// Create or refresh the route for `id`. Refreshing overwrites the
    /// stamp and reactivates the route without creating a duplicate
    /// entry or a second UI item. The (id, stamp) pair becomes the
    /// most-recently-seen one.
    pub fn upsert(&self, id: &str, stamp: i64) -> Route {
        let mut inner = self.inner.lock();
        inner.last = Some((id.to_string(), stamp));
        if let Some(route) = inner.routes.get_mut(id) {
            route.stamp = stamp;
            route.state = RouteState::Active;
            return route.clone();
        }
        let route = Route {
            id: id.to_string(),
            stamp,
            state: RouteState::Active,
            ui: self.ui.insert(id, stamp),
        };
        inner.routes.insert(id.to_string(), route.clone());
        route
    }

    /// True when the pair matches the single most-recently-seen
    /// (id, stamp) — table-wide, not per-route; only the latest request
    /// is deduplicated.
    pub fn is_duplicate(&self, id: &str, stamp: i64) -> bool {
        self.inner
            .lock()
            .last
            .as_ref()
            .is_some_and(|(last_id, last_stamp)| last_id == id && *last_stamp == stamp)
    }

    /// Record a remotely-issued pair as seen without creating a route.
    pub fn remember(&self, id: &str, stamp: i64) {
        self.inner.lock().last = Some((id.to_string(), stamp));
    }

    /// Remove one route, releasing its UI entry. Resets the dedup slot
    /// so a re-request for the same pair is honored again.
    pub fn remove(&self, id: &str) -> Option<Route> {
        let mut inner = self.inner.lock();
        inner.last = None;
        let mut route = inner.routes.remove(id)?;
        drop(inner);
        self.ui.remove(route.ui);
        route.state = RouteState::Aborted;
        Some(route)
    }

    /// Remove every route. Used both for abort-all and for channel
    /// teardown; the caller decides whether a wire ABORT accompanies
    /// it.
    pub fn clear(&self) -> Vec<Route> {
        let mut inner = self.inner.lock();
        inner.last = None;
        let routes: Vec<Route> = inner.routes.drain().map(|(_, r)| r).collect();
        drop(inner);
        let mut cleared = Vec::with_capacity(routes.len());
        for mut route in routes {
            self.ui.remove(route.ui);
            route.state = RouteState::Aborted;
            cleared.push(route);
        }
        cleared
    }

    /// Snapshot of active (id, stamp) pairs, for reroute/update sweeps.
    pub fn active(&self) -> Vec<(String, i64)> {
        self.inner
            .lock()
            .routes
            .values()
            .map(|route| (route.id.clone(), route.stamp))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().routes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingUi {
        next: AtomicU64,
        inserted: Mutex<Vec<String>>,
        removed: Mutex<Vec<UiHandle>>,
    }

    impl RouteListUi for CountingUi {
        fn insert(&self, id: &str, _stamp: i64) -> UiHandle {
            self.inserted.lock().push(id.to_string());
            UiHandle(self.next.fetch_add(1, Ordering::Relaxed))
        }
        fn remove(&self, handle: UiHandle) {
            self.removed.lock().push(handle);
        }
        fn set_routing_options(&self, _routing: &crate::host::RoutingInfo) {}
    }

    fn table() -> (RouteTable, Arc<CountingUi>) {
        let ui = Arc::new(CountingUi::default());
        (RouteTable::new(ui.clone()), ui)
    }

    #[test]
    fn upsert_refreshes_without_duplicating() {
        let (table, ui) = table();
        let first = table.upsert("golgi", 100);
        let second = table.upsert("golgi", 200);
        assert_eq!(table.len(), 1);
        assert_eq!(second.stamp, 200);
        assert_eq!(first.ui, second.ui);
        assert_eq!(ui.inserted.lock().len(), 1);
    }

    #[test]
    fn dedup_tracks_only_the_latest_pair() {
        let (table, _ui) = table();
        table.upsert("a", 1);
        assert!(table.is_duplicate("a", 1));
        table.upsert("a", 2);
        assert!(!table.is_duplicate("a", 1));
        assert!(table.is_duplicate("a", 2));
        // A different route taking the slot evicts the previous pair.
        table.upsert("b", 7);
        assert!(!table.is_duplicate("a", 2));
    }

    #[test]
    fn remove_releases_ui_and_resets_dedup() {
        let (table, ui) = table();
        let route = table.upsert("a", 1);
        let removed = table.remove("a").unwrap();
        assert_eq!(removed.state, RouteState::Aborted);
        assert!(!table.contains("a"));
        assert!(!table.is_duplicate("a", 1));
        assert_eq!(ui.removed.lock().as_slice(), &[route.ui]);
        assert!(table.remove("a").is_none());
    }

    #[test]
    fn clear_empties_the_table() {
        let (table, ui) = table();
        table.upsert("a", 1);
        table.upsert("b", 2);
        let cleared = table.clear();
        assert_eq!(cleared.len(), 2);
        assert!(table.is_empty());
        assert_eq!(ui.removed.lock().len(), 2);
    }

    #[test]
    fn reaborted_id_can_be_recreated() {
        let (table, _ui) = table();
        table.upsert("a", 1);
        table.clear();
        let route = table.upsert("a", 5);
        assert_eq!(route.state, RouteState::Active);
        assert_eq!(table.len(), 1);
    }
}
