//! Headless diagnostic client.
//!
//! Connects to a running routing daemon with stubbed window
//! collaborators, registers, and logs everything the daemon sends.
//! Useful for checking daemon reachability and watching protocol
//! traffic without a real host window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

use tether_client_core::host::{
    CaptureError, DocumentSearch, HostEvent, HostWindow, MapArea, PreferenceStore, RouteListUi,
    RoutingInfo, StatusObserver, TileCapture, UiHandle,
};
use tether_client_core::protocol::SourceRect;
use tether_client_core::session::channel::{ChannelLabel, ChannelState, TungsteniteConnector};
use tether_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use tether_client_core::tiles::CaptureBand;
use tether_client_core::{Config, HostBindings, Session};

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Diagnostic client for the tether routing daemon")]
struct Cli {
    /// Links endpoint override.
    #[arg(long, env = "TETHER_LINKS_URL")]
    links_url: Option<Url>,
    /// Control endpoint override.
    #[arg(long, env = "TETHER_CONTROL_URL")]
    control_url: Option<Url>,
    /// Name announced in REGISTER.
    #[arg(long, env = "TETHER_CLIENT_NAME")]
    name: Option<String>,
    /// Register by document title instead of the window anchor point.
    #[arg(long)]
    match_title: bool,
    /// Report this link id right after registering.
    #[arg(long)]
    report: Option<String>,
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

struct HeadlessWindow {
    scroll: Mutex<(f64, f64)>,
}

impl HostWindow for HeadlessWindow {
    fn device_pixel_ratio(&self) -> f64 {
        1.0
    }
    fn inner_screen_origin(&self) -> (f64, f64) {
        (0.0, 0.0)
    }
    fn window_screen_pos(&self) -> (f64, f64) {
        (0.0, 0.0)
    }
    fn inner_size(&self) -> (f64, f64) {
        (1280.0, 800.0)
    }
    fn scroll_pos(&self) -> (f64, f64) {
        *self.scroll.lock()
    }
    fn scroll_extent(&self) -> (f64, f64) {
        (1280.0, 800.0)
    }
    fn scroll_to(&self, x: f64, y: f64) {
        info!(x, y, "daemon scrolled the window");
        *self.scroll.lock() = (x, y);
    }
    fn scroll_element_to(&self, xpath: &str, x: f64, y: f64) {
        info!(xpath, x, y, "daemon scrolled an element");
    }
    fn navigate(&self, uri: &str) {
        info!(uri, "daemon requested navigation");
    }
    fn open_window(&self, url: &str, view: Option<[i32; 2]>, _data: Value) {
        info!(url, ?view, "daemon requested a new window");
    }
}

struct HeadlessDocument;

impl DocumentSearch for HeadlessDocument {
    fn title(&self) -> String {
        "tether diagnostic".into()
    }
    fn text_ranges(&self, _pattern: &regex::Regex) -> Vec<tether_client_core::geometry::CssRect> {
        Vec::new()
    }
    fn map_areas(&self, _id: &str) -> Vec<MapArea> {
        Vec::new()
    }
}

struct NoCapture;

impl TileCapture for NoCapture {
    fn capture(
        &self,
        _size: [u32; 2],
        _region: SourceRect,
        _request_id: u8,
        _bands: Option<&[CaptureBand]>,
    ) -> Result<Bytes, CaptureError> {
        Err(CaptureError::Unavailable("headless client".into()))
    }
}

#[derive(Default)]
struct LoggingUi {
    next: std::sync::atomic::AtomicU64,
}

impl RouteListUi for LoggingUi {
    fn insert(&self, id: &str, stamp: i64) -> UiHandle {
        info!(id, stamp, "route added");
        UiHandle(
            self.next
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }
    fn remove(&self, handle: UiHandle) {
        info!(handle = handle.0, "route removed");
    }
    fn set_routing_options(&self, routing: &RoutingInfo) {
        info!(?routing, "router inventory");
    }
}

#[derive(Default)]
struct MemoryPrefs {
    values: Mutex<HashMap<String, Value>>,
}

impl PreferenceStore for MemoryPrefs {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }
    fn set(&self, key: &str, val: Value) {
        info!(key, %val, "preference updated");
        self.values.lock().insert(key.to_string(), val);
    }
}

struct LoggingStatus;

impl StatusObserver for LoggingStatus {
    fn channel_status(&self, channel: ChannelLabel, state: ChannelState) {
        info!(channel = channel.as_str(), ?state, "channel status");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let mut config = Config::from_env()?;
    if let Some(url) = cli.links_url {
        config.links_url = url;
    }
    if let Some(url) = cli.control_url {
        config.control_url = url;
    }
    if let Some(name) = cli.name {
        config.client_name = name;
    }
    if cli.match_title {
        config.match_by_title = true;
    }

    info!(
        links = %config.links_url,
        control = %config.control_url,
        "connecting to routing daemon"
    );

    let bindings = HostBindings {
        window: Arc::new(HeadlessWindow {
            scroll: Mutex::new((0.0, 0.0)),
        }),
        search: Arc::new(HeadlessDocument),
        capture: Arc::new(NoCapture),
        ui: Arc::new(LoggingUi::default()),
        prefs: Arc::new(MemoryPrefs::default()),
        status: Arc::new(LoggingStatus),
    };
    let session = Session::new(config, Arc::new(TungsteniteConnector), bindings, None);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    if let Some(id) = cli.report {
        events_tx
            .send(HostEvent::LinkSelected { id })
            .context("session event channel closed")?;
    }

    tokio::select! {
        _ = session.run(events_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}
