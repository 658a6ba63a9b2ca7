//! Two-way preference sync with the routing daemon.
//!
//! Inbound GET-FOUND answers land in the host preference store (and,
//! for the router inventory, in the routing menu). Outbound changes are
//! debounced per key so a dragged slider settles into a single SET.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::host::{PreferenceStore, RouteListUi, RoutingInfo};
use crate::protocol::{ConfigValueType, WireMessage};
use crate::session::channel::SessionChannel;
use crate::session::pacing::Debouncer;

/// Quiet window before a locally-changed value is pushed to the daemon.
pub const PREF_SET_DEBOUNCE: Duration = Duration::from_millis(400);

/// Daemon key carrying the router inventory.
pub const ROUTING_KEY: &str = "/routing";

/// Routing parameters fetched at registration, with their wire types.
pub const PREFETCH_KEYS: &[(&str, ConfigValueType)] = &[
    ("CPURouting:SegmentLength", ConfigValueType::Integer),
    ("CPURouting:NumIterations", ConfigValueType::Integer),
    ("CPURouting:NumSteps", ConfigValueType::Integer),
    ("CPURouting:NumSimplify", ConfigValueType::Integer),
    ("CPURouting:NumLinear", ConfigValueType::Integer),
    ("CPURouting:StepSize", ConfigValueType::Float),
    ("CPURouting:SpringConstant", ConfigValueType::Float),
    ("CPURouting:AngleCompatWeight", ConfigValueType::Float),
    (ROUTING_KEY, ConfigValueType::String),
];

/// GET messages for every prefetched key, sent right after REGISTER.
pub fn prefetch_requests() -> Vec<WireMessage> {
    PREFETCH_KEYS
        .iter()
        .map(|(key, value_type)| WireMessage::Get {
            id: (*key).to_string(),
            value_type: Some(*value_type),
            size: None,
            src: None,
            req_id: None,
            sections_src: None,
            sections_dest: None,
        })
        .collect()
}

fn value_type_of(val: &Value) -> ConfigValueType {
    match val {
        Value::Bool(_) => ConfigValueType::Bool,
        Value::Number(n) if n.is_i64() || n.is_u64() => ConfigValueType::Integer,
        Value::Number(_) => ConfigValueType::Float,
        _ => ConfigValueType::String,
    }
}

/// Outbound leg of the bridge; the control channel in production.
pub trait SettingSink: Send + Sync {
    fn push_setting(&self, msg: WireMessage);
}

impl SettingSink for SessionChannel {
    fn push_setting(&self, msg: WireMessage) {
        // A user changed a setting on purpose; bring the channel up if
        // it is down.
        self.send_opportunistic(&msg, true);
    }
}

pub struct PreferencesBridge {
    sink: Arc<dyn SettingSink>,
    store: Arc<dyn PreferenceStore>,
    ui: Arc<dyn RouteListUi>,
    window: Duration,
    debouncers: Mutex<HashMap<String, Arc<Debouncer>>>,
}

impl PreferencesBridge {
    pub fn new(
        sink: Arc<dyn SettingSink>,
        store: Arc<dyn PreferenceStore>,
        ui: Arc<dyn RouteListUi>,
    ) -> Self {
        Self::with_window(sink, store, ui, PREF_SET_DEBOUNCE)
    }

    pub fn with_window(
        sink: Arc<dyn SettingSink>,
        store: Arc<dyn PreferenceStore>,
        ui: Arc<dyn RouteListUi>,
        window: Duration,
    ) -> Self {
        PreferencesBridge {
            sink,
            store,
            ui,
            window,
            debouncers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a daemon answer. The router inventory additionally feeds
    /// the routing menu.
    pub fn apply_found(&self, id: &str, val: Value) {
        if id == ROUTING_KEY {
            self.ui.set_routing_options(&RoutingInfo::from_value(&val));
        }
        self.store.set(id, val);
    }

    /// Store a local change and schedule its SET. Repeated changes to
    /// the same key within the window collapse into one message; other
    /// keys debounce independently.
    pub fn set_local(&self, key: &str, val: Value) {
        self.store.set(key, val.clone());
        let debouncer = Arc::clone(
            self.debouncers
                .lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Debouncer::new(self.window))),
        );
        let sink = Arc::clone(&self.sink);
        let msg = WireMessage::Set {
            id: key.to_string(),
            val: val.clone(),
            value_type: Some(value_type_of(&val)),
        };
        debouncer.call(move || sink.push_setting(msg));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<WireMessage>>,
    }

    impl SettingSink for RecordingSink {
        fn push_setting(&self, msg: WireMessage) {
            self.sent.lock().push(msg);
        }
    }

    #[derive(Default)]
    struct MapStore {
        values: Mutex<HashMap<String, Value>>,
    }

    impl PreferenceStore for MapStore {
        fn get(&self, key: &str) -> Option<Value> {
            self.values.lock().get(key).cloned()
        }
        fn set(&self, key: &str, val: Value) {
            self.values.lock().insert(key.to_string(), val);
        }
    }

    #[derive(Default)]
    struct MenuSpy {
        routing: Mutex<Option<RoutingInfo>>,
    }

    impl RouteListUi for MenuSpy {
        fn insert(&self, _id: &str, _stamp: i64) -> crate::host::UiHandle {
            crate::host::UiHandle(0)
        }
        fn remove(&self, _handle: crate::host::UiHandle) {}
        fn set_routing_options(&self, routing: &RoutingInfo) {
            *self.routing.lock() = Some(routing.clone());
        }
    }

    fn bridge() -> (PreferencesBridge, Arc<RecordingSink>, Arc<MapStore>, Arc<MenuSpy>) {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MapStore::default());
        let ui = Arc::new(MenuSpy::default());
        (
            PreferencesBridge::new(sink.clone(), store.clone(), ui.clone()),
            sink,
            store,
            ui,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_changes_collapse_into_one_set() {
        let (bridge, sink, store, _ui) = bridge();

        for step in 1..=5 {
            bridge.set_local("CPURouting:NumSteps", json!(step * 10));
            sleep(Duration::from_millis(50)).await;
        }
        sleep(Duration::from_millis(500)).await;

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            WireMessage::Set { id, val, value_type } => {
                assert_eq!(id, "CPURouting:NumSteps");
                assert_eq!(val, &json!(50));
                assert_eq!(*value_type, Some(ConfigValueType::Integer));
            }
            other => panic!("unexpected message {other:?}"),
        }
        // The store always holds the newest value, sent or not.
        assert_eq!(store.get("CPURouting:NumSteps"), Some(json!(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_debounce_independently() {
        let (bridge, sink, _store, _ui) = bridge();

        bridge.set_local("CPURouting:StepSize", json!(0.5));
        bridge.set_local("CPURouting:NumSteps", json!(9));
        // An awaited sleep lets the paused clock step through the
        // spawned debounce timers in order.
        sleep(Duration::from_millis(500)).await;

        assert_eq!(sink.sent.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn float_values_carry_the_float_type() {
        let (bridge, sink, _store, _ui) = bridge();
        bridge.set_local("CPURouting:SpringConstant", json!(0.25));
        sleep(Duration::from_millis(500)).await;

        let sent = sink.sent.lock();
        match &sent[0] {
            WireMessage::Set { value_type, .. } => {
                assert_eq!(*value_type, Some(ConfigValueType::Float))
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn routing_answer_feeds_the_menu() {
        let (bridge, _sink, store, ui) = bridge();
        bridge.apply_found(
            ROUTING_KEY,
            json!({"available": [["cpu", true]], "active": "cpu"}),
        );
        let routing = ui.routing.lock().clone().unwrap();
        assert_eq!(routing.active.as_deref(), Some("cpu"));
        assert!(store.get(ROUTING_KEY).is_some());
    }

    #[test]
    fn prefetch_covers_every_routing_key() {
        let requests = prefetch_requests();
        assert_eq!(requests.len(), PREFETCH_KEYS.len());
        assert!(requests.iter().all(|msg| matches!(
            msg,
            WireMessage::Get { req_id: None, src: None, .. }
        )));
    }
}
