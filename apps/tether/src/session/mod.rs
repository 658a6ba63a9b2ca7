//! Session orchestration: one window's life with the routing daemon.
//!
//! A session owns both daemon channels, the route table, and the
//! delivery machinery, and drives everything from a single loop that
//! merges channel signals with host events. All protocol dispatch goes
//! through one typed match; no handler is registered dynamically.

pub mod channel;
pub mod pacing;
pub mod routes;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::geometry::{self, normalize_selection, BoundingBox, Reference, Transform};
use crate::host::{
    DocumentSearch, HostEvent, HostWindow, PreferenceStore, RouteListUi, StatusObserver,
    TileCapture,
};
use crate::prefs::{self, PreferencesBridge};
use crate::protocol::{
    frame_tile, Quad, SourceRect, SyncBody, WireMessage, TILE_TYPE_PREVIEW,
};
use crate::scroll::ScrollAnimator;
use crate::tiles::{SectionRemap, TileDispatcher, TileRequest};

use channel::{ChannelLabel, ChannelSignal, ChannelState, SessionChannel, SocketConnector};
use pacing::{Debouncer, Throttle};
use routes::{RouteTable, ABORT_ALL_ID, ABORT_ALL_STAMP};

/// Preference key overriding the replace-on-report behavior at runtime.
pub const REPLACE_ROUTE_PREF: &str = "replaceRoute";

/// Wire id of the inbound tile request GET.
const PREVIEW_TILE_ID: &str = "preview-tile";
/// Wire id of the inbound remote-scroll SET.
const SCROLL_Y_ID: &str = "scroll-y";

/// Host-side collaborators a session is wired to.
#[derive(Clone)]
pub struct HostBindings {
    pub window: Arc<dyn HostWindow>,
    pub search: Arc<dyn DocumentSearch>,
    pub capture: Arc<dyn TileCapture>,
    pub ui: Arc<dyn RouteListUi>,
    pub prefs: Arc<dyn PreferenceStore>,
    pub status: Arc<dyn StatusObserver>,
}

struct SessionInner {
    config: Config,
    links: SessionChannel,
    control: SessionChannel,
    routes: RouteTable,
    tiles: TileDispatcher,
    scroller: ScrollAnimator,
    prefs: PreferencesBridge,
    window: Arc<dyn HostWindow>,
    search: Arc<dyn DocumentSearch>,
    capture: Arc<dyn TileCapture>,
    status: Arc<dyn StatusObserver>,
    /// Identity of this tab, echoed in SYNC to break mirror loops.
    tab_id: String,
    /// Tab id of the window this one was opened from, when any. Only
    /// such windows follow cross-window SYNC.
    src_id: Option<String>,
    reroute: Debouncer,
    scroll_sync: Throttle,
    /// Last URI announced over SYNC, to suppress same-page repeats.
    last_uri: Mutex<Option<String>>,
}

/// One window's connection to the daemon.
pub struct Session {
    inner: Arc<SessionInner>,
    signals: mpsc::UnboundedReceiver<ChannelSignal>,
}

impl Session {
    pub fn new(
        config: Config,
        connector: Arc<dyn SocketConnector>,
        bindings: HostBindings,
        src_id: Option<String>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let links = SessionChannel::new(
            ChannelLabel::Links,
            config.links_url.clone(),
            Arc::clone(&connector),
            signal_tx.clone(),
        );
        let control = SessionChannel::new(
            ChannelLabel::Control,
            config.control_url.clone(),
            connector,
            signal_tx,
        );
        let tiles = TileDispatcher::new(Arc::clone(&bindings.capture), Arc::new(links.clone()));
        let prefs = PreferencesBridge::new(
            Arc::new(control.clone()),
            Arc::clone(&bindings.prefs),
            Arc::clone(&bindings.ui),
        );
        let inner = Arc::new(SessionInner {
            links,
            control,
            routes: RouteTable::new(Arc::clone(&bindings.ui)),
            tiles,
            scroller: ScrollAnimator::new(Arc::clone(&bindings.window)),
            prefs,
            window: bindings.window,
            search: bindings.search,
            capture: bindings.capture,
            status: bindings.status,
            tab_id: Uuid::new_v4().to_string(),
            src_id,
            reroute: Debouncer::new(config.reroute_debounce),
            scroll_sync: Throttle::new(config.scroll_throttle),
            last_uri: Mutex::new(None),
            config,
        });
        Session {
            inner,
            signals: signal_rx,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    /// Connect the links channel and announce this window. The
    /// REGISTER and the preference prefetch are queued during the
    /// handshake and flush in order on open.
    pub fn register(&self) {
        self.inner.register();
    }

    /// Report a user selection as a new visual link.
    pub fn report_selection(&self, raw: &str) {
        Arc::clone(&self.inner).report_selection(raw);
    }

    pub fn abort(&self, id: &str) {
        self.inner.abort(id);
    }

    pub fn abort_all(&self) {
        self.inner.abort_all(true);
    }

    /// Drive the session until both input streams end.
    pub async fn run(mut self, mut host_events: mpsc::UnboundedReceiver<HostEvent>) {
        self.inner.register();
        loop {
            tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.inner.apply_signal(signal),
                    None => break,
                },
                event = host_events.recv() => match event {
                    Some(event) => Arc::clone(&self.inner).apply_host_event(event),
                    None => break,
                },
            }
        }
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

/// Seconds elapsed since local midnight, the stamp format the daemon
/// uses to order locally initiated links.
fn local_stamp() -> i64 {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    (i64::from(now.hour()) * 60 + i64::from(now.minute())) * 60 + i64::from(now.second())
}

impl SessionInner {
    fn register(&self) {
        self.links.connect();
        // The daemon identifies a window either by its document title
        // or by an on-screen anchor point, never both.
        let (title, pos) = if self.config.match_by_title {
            (Some(self.search.title()), None)
        } else {
            let (win_x, win_y) = self.window.window_screen_pos();
            let (width, height) = self.window.inner_size();
            (None, Some([win_x + width / 2.0, win_y + height / 2.0]))
        };
        let register = WireMessage::Register {
            name: Some(self.config.client_name.clone()),
            pid: Some(std::process::id()),
            title,
            cmds: Some(vec!["open-url".into(), "scroll".into()]),
            viewport: Some(geometry::viewport(&*self.window, Reference::Relative)),
            pos,
            src_id: self.src_id.clone(),
        };
        self.links.send(&register);
        for get in prefs::prefetch_requests() {
            self.links.send(&get);
        }
    }

    fn apply_signal(self: &Arc<Self>, signal: ChannelSignal) {
        match signal {
            ChannelSignal::State(label, state) => {
                self.status.channel_status(label, state);
                if label == ChannelLabel::Links
                    && matches!(state, ChannelState::Closed | ChannelState::Error)
                {
                    // The daemon forgets us on disconnect; drop local
                    // route state without sending ABORTs into the void.
                    let cleared = self.routes.clear();
                    if !cleared.is_empty() {
                        tracing::info!(count = cleared.len(), "links channel down, routes cleared");
                    }
                }
            }
            ChannelSignal::Message(label, msg) => self.dispatch(label, msg),
        }
    }

    fn dispatch(self: &Arc<Self>, label: ChannelLabel, msg: WireMessage) {
        match msg {
            WireMessage::Request { id, stamp } => self.handle_request(&id, stamp),
            WireMessage::Abort { id, stamp } => self.handle_abort(&id, stamp),
            WireMessage::GetFound { id, val } => self.prefs.apply_found(&id, val),
            WireMessage::Get {
                id,
                size,
                src,
                req_id,
                sections_src,
                sections_dest,
                ..
            } if id == PREVIEW_TILE_ID => {
                self.handle_tile_request(size, src, req_id, sections_src, sections_dest)
            }
            WireMessage::Set { id, val, .. } if id == SCROLL_Y_ID => {
                if let Some(target) = val.as_f64() {
                    self.scroller.scroll_to_y(target);
                }
            }
            // Settings pushed by the daemon land in the local store.
            WireMessage::Set { id, val, .. } => self.prefs.apply_found(&id, val),
            WireMessage::Get { id, .. } => match self.prefs.get(&id) {
                Some(val) => {
                    self.channel_for(label)
                        .send(&WireMessage::GetFound { id, val });
                }
                None => tracing::debug!(id, "no local value for get"),
            },
            WireMessage::Cmd {
                cmd,
                url,
                view,
                extra,
            } => self.handle_cmd(&cmd, url, view, extra),
            WireMessage::Sync { body } => self.handle_sync(body),
            other => {
                tracing::trace!(
                    channel = label.as_str(),
                    task = ?other,
                    "ignoring unhandled message"
                );
            }
        }
    }

    fn apply_host_event(self: Arc<Self>, event: HostEvent) {
        match event {
            HostEvent::PageLoaded => self.schedule_reroute(),
            HostEvent::Scrolled => {
                let inner = Arc::clone(&self);
                self.scroll_sync.call(move || inner.send_scroll_sync(None));
                self.schedule_reroute();
            }
            HostEvent::ElementScrolled { xpath, pos } => {
                let inner = Arc::clone(&self);
                self.scroll_sync
                    .call(move || inner.send_scroll_sync(Some((xpath, pos))));
            }
            HostEvent::Resized => self.resize(),
            HostEvent::LocationChanged { uri } => {
                {
                    let mut last = self.last_uri.lock();
                    if last.as_deref() == Some(uri.as_str()) {
                        return;
                    }
                    *last = Some(uri.clone());
                }
                let sync = WireMessage::Sync {
                    body: SyncBody::Uri {
                        uri,
                        tab_id: self.tab_id.clone(),
                    },
                };
                self.control.send_opportunistic(&sync, false);
            }
            HostEvent::LinkSelected { id } => self.report_selection(&id),
            HostEvent::Drag {
                screen_pos,
                url,
                elements_scroll,
            } => self.handle_drag(screen_pos, url, elements_scroll),
        }
    }

    fn handle_request(&self, id: &str, stamp: i64) {
        if self.routes.is_duplicate(id, stamp) {
            tracing::debug!(id, stamp, "suppressing re-delivered request");
            return;
        }
        self.routes.remember(id, stamp);
        match self.link_regions(id) {
            Ok(regions) => {
                self.links.send(&WireMessage::Found {
                    id: id.to_string(),
                    stamp,
                    title: self.search.title(),
                    scroll_region: geometry::scroll_region(&*self.window).to_wire(),
                    regions,
                });
                self.routes.upsert(id, stamp);
            }
            Err(err) => {
                tracing::warn!(id, %err, "cannot resolve requested link");
            }
        }
    }

    fn handle_abort(&self, id: &str, stamp: i64) {
        if id == ABORT_ALL_ID && stamp == ABORT_ALL_STAMP {
            self.routes.clear();
            return;
        }
        // Remote abort: tear down locally, never echo an ABORT back.
        self.routes.remove(id);
    }

    fn handle_cmd(
        &self,
        cmd: &str,
        url: Option<String>,
        view: Option<[i32; 2]>,
        extra: serde_json::Map<String, Value>,
    ) {
        match (cmd, url) {
            ("open-url", Some(url)) => {
                self.window.open_window(&url, view, Value::Object(extra));
            }
            _ => {
                tracing::debug!(cmd, "ignoring unsupported command");
            }
        }
    }

    fn handle_sync(&self, body: SyncBody) {
        // Only the window this one was opened out of may steer it; any
        // other sender is ignored.
        let sender = match &body {
            SyncBody::Scroll { tab_id, .. } | SyncBody::Uri { tab_id, .. } => tab_id.as_str(),
        };
        if self.src_id.as_deref() != Some(sender) {
            return;
        }
        match body {
            SyncBody::Scroll {
                pos,
                pos_rel,
                xpath,
                ..
            } => {
                if let Some(xpath) = xpath {
                    // Element offsets ride the wire unnegated.
                    self.window.scroll_element_to(&xpath, pos[0], pos[1]);
                    return;
                }
                let (view_w, view_h) = self.window.inner_size();
                let (extent_w, extent_h) = self.window.scroll_extent();
                // Fractions are preferred: documents of different
                // lengths still land on the matching relative spot.
                // Document offsets arrive negated on both encodings.
                let target_x = match pos_rel {
                    Some(rel) if extent_w - view_w > 1.0 => -rel[0] * (extent_w - view_w),
                    _ => -pos[0],
                };
                let target_y = match pos_rel {
                    Some(rel) if extent_h - view_h > 1.0 => -rel[1] * (extent_h - view_h),
                    _ => -pos[1],
                };
                self.window.scroll_to(target_x, target_y);
            }
            SyncBody::Uri { uri, .. } => {
                self.window.navigate(&uri);
            }
        }
    }

    fn handle_tile_request(
        &self,
        size: Option<[u32; 2]>,
        src: Option<SourceRect>,
        req_id: Option<u8>,
        sections_src: Option<Vec<[f64; 2]>>,
        sections_dest: Option<Vec<[f64; 2]>>,
    ) {
        let (Some(size), Some(region), Some(request_id)) = (size, src, req_id) else {
            tracing::warn!("tile request missing size, src or req_id");
            return;
        };
        let remap = match (sections_src, sections_dest) {
            (Some(src), Some(dest)) if src.len() == dest.len() => {
                Some(SectionRemap { src, dest })
            }
            _ => None,
        };
        self.tiles.enqueue(TileRequest {
            size,
            region,
            request_id,
            remap,
        });
    }

    fn handle_drag(
        &self,
        screen_pos: [i32; 2],
        url: String,
        elements_scroll: serde_json::Map<String, Value>,
    ) {
        let (scroll_x, scroll_y) = self.window.scroll_pos();
        let drag = WireMessage::Drag {
            url,
            scroll: [-scroll_x, -scroll_y],
            elements_scroll,
            view: geometry::viewport(&*self.window, Reference::Absolute),
            tab_id: self.tab_id.clone(),
            screen_pos,
        };
        // A drag is a deliberate cross-window gesture: bring the
        // control channel up if it is not.
        self.control.send_opportunistic(&drag, true);

        // Follow with a full-window preview so the daemon can render
        // the drop target immediately.
        let scale = self.window.device_pixel_ratio();
        let (width, height) = self.window.inner_size();
        let size = [(width * scale).round() as u32, (height * scale).round() as u32];
        let region = SourceRect {
            x: scroll_x,
            y: scroll_y,
            width,
            height,
        };
        match self.capture.capture(size, region, 0, None) {
            Ok(pixels) => {
                self.control
                    .send_binary_opportunistic(frame_tile(TILE_TYPE_PREVIEW, 0, &pixels), true);
            }
            Err(err) => {
                tracing::warn!(%err, "drag preview capture failed");
            }
        }
    }

    fn report_selection(self: Arc<Self>, raw: &str) {
        let id = normalize_selection(raw);
        if id.is_empty() {
            return;
        }
        let replace = self
            .prefs
            .get(REPLACE_ROUTE_PREF)
            .and_then(|v| v.as_bool())
            .unwrap_or(self.config.replace_route);
        if replace {
            self.abort_all(true);
        }
        match self.link_regions(&id) {
            Ok(regions) => {
                let stamp = local_stamp();
                self.links.send(&WireMessage::Initiate {
                    id: id.clone(),
                    stamp,
                    title: self.search.title(),
                    scroll_region: geometry::scroll_region(&*self.window).to_wire(),
                    regions,
                });
                self.routes.upsert(&id, stamp);
                self.send_scroll_sync(None);
            }
            Err(err) => {
                tracing::warn!(id, %err, "cannot build link report");
            }
        }
    }

    fn channel_for(&self, label: ChannelLabel) -> &SessionChannel {
        match label {
            ChannelLabel::Links => &self.links,
            ChannelLabel::Control => &self.control,
        }
    }

    fn abort(&self, id: &str) {
        if let Some(route) = self.routes.remove(id) {
            self.links.send(&WireMessage::Abort {
                id: route.id,
                stamp: route.stamp,
            });
        }
    }

    fn abort_all(&self, notify: bool) {
        if notify {
            self.links.send(&WireMessage::Abort {
                id: ABORT_ALL_ID.to_string(),
                stamp: ABORT_ALL_STAMP,
            });
        }
        self.routes.clear();
    }

    fn resize(self: Arc<Self>) {
        self.links.send(&WireMessage::Resize {
            viewport: geometry::viewport(&*self.window, Reference::Absolute),
        });
        self.schedule_reroute();
    }

    /// Re-send geometry for every active route after the layout has
    /// settled.
    fn schedule_reroute(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.reroute.call(move || inner.push_updates());
    }

    fn push_updates(&self) {
        let scroll_region = geometry::scroll_region(&*self.window).to_wire();
        for (id, stamp) in self.routes.active() {
            match self.link_regions(&id) {
                Ok(regions) => {
                    self.links.send(&WireMessage::Update {
                        id,
                        stamp,
                        scroll_region,
                        regions,
                    });
                }
                Err(err) => {
                    tracing::warn!(id, %err, "skipping update for unresolvable link");
                }
            }
        }
    }

    fn link_regions(&self, id: &str) -> Result<Option<Vec<Quad>>, geometry::GeometryError> {
        let transform = Transform::capture(&*self.window);
        let boxes =
            geometry::search_document(&*self.search, id, &*self.window, &transform)?;
        let regions: Vec<Quad> = boxes.iter().map(BoundingBox::to_wire).collect();
        Ok(if regions.is_empty() {
            None
        } else {
            Some(regions)
        })
    }

    fn send_scroll_sync(&self, element: Option<(String, [f64; 2])>) {
        let body = match element {
            // Element offsets are carried as-is; only the document
            // scroll position is negated on the wire.
            Some((xpath, pos)) => SyncBody::Scroll {
                pos,
                pos_rel: None,
                xpath: Some(xpath),
                tab_id: self.tab_id.clone(),
            },
            None => {
                let region = geometry::scroll_region(&*self.window);
                let viewport = geometry::viewport(&*self.window, Reference::Relative);
                SyncBody::Scroll {
                    pos: [region.x, region.y],
                    pos_rel: Some(region.fractions(viewport)),
                    xpath: None,
                    tab_id: self.tab_id.clone(),
                }
            }
        };
        let sync = WireMessage::Sync { body };
        self.links.send(&sync);
        self.control.send_opportunistic(&sync, false);
    }
}
