//! Collaborator seams owned by the embedding host.
//!
//! The client core never touches a real window, document, or screen
//! buffer; everything host-specific arrives through these traits. Tests
//! drive the session with mock implementations the same way the host
//! integration does with real ones.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::geometry::{CssRect, ElementBox};
use crate::protocol::SourceRect;
use crate::session::channel::{ChannelLabel, ChannelState};
use crate::tiles::CaptureBand;

/// Window metrics and actions of the hosting window.
///
/// Metrics are re-queried on every use; the device pixel ratio in
/// particular changes when the window moves to a different-density
/// display.
pub trait HostWindow: Send + Sync {
    /// CSS-pixel to device-pixel scale factor.
    fn device_pixel_ratio(&self) -> f64;
    /// Screen position of the inner content area, in CSS pixels.
    fn inner_screen_origin(&self) -> (f64, f64);
    /// Screen position of the window itself.
    fn window_screen_pos(&self) -> (f64, f64);
    /// Size of the visible content area, in CSS pixels.
    fn inner_size(&self) -> (f64, f64);
    /// Current document scroll position.
    fn scroll_pos(&self) -> (f64, f64);
    /// Total scrollable extents of the document.
    fn scroll_extent(&self) -> (f64, f64);

    fn scroll_to(&self, x: f64, y: f64);
    /// Scroll the element addressed by `xpath` (element-level sync).
    fn scroll_element_to(&self, xpath: &str, x: f64, y: f64);
    fn navigate(&self, uri: &str);
    /// Open a new window, forwarding `data` as hidden content data.
    fn open_window(&self, url: &str, view: Option<[i32; 2]>, data: Value);
}

/// Document query mechanism: text-range and image-map area lookups.
///
/// The provider owns the document tree; the geometry pipeline hands it
/// a prepared pattern and transforms whatever rectangles come back.
pub trait DocumentSearch: Send + Sync {
    fn title(&self) -> String;
    /// Client rectangles of every pattern match, in CSS pixels relative
    /// to the viewport. A match spanning a wrap boundary contributes
    /// one rectangle per line fragment.
    fn text_ranges(&self, pattern: &regex::Regex) -> Vec<CssRect>;
    /// Image-map `area` elements whose title contains `id`, paired with
    /// the image element each map belongs to.
    fn map_areas(&self, id: &str) -> Vec<MapArea>;
}

/// An image-map area hit: the raw coords attribute plus the owning
/// image element, when one precedes the map.
#[derive(Debug, Clone)]
pub struct MapArea {
    pub coords: String,
    pub image: Option<ElementBox>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture region unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Opaque raster capture of a window region.
pub trait TileCapture: Send + Sync {
    /// Render `region` at `size` output pixels and return raw RGBA
    /// rows. `bands` stitches a scrolling capture from disjoint
    /// vertical slices; `None` captures the region contiguously.
    fn capture(
        &self,
        size: [u32; 2],
        region: SourceRect,
        request_id: u8,
        bands: Option<&[CaptureBand]>,
    ) -> Result<Bytes, CaptureError>;
}

/// Handle to one route's menu/list entry, owned by the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UiHandle(pub u64);

/// Host UI bridge for the per-route list and the routing menu.
pub trait RouteListUi: Send + Sync {
    fn insert(&self, id: &str, stamp: i64) -> UiHandle;
    fn remove(&self, handle: UiHandle);
    fn set_routing_options(&self, routing: &RoutingInfo);
}

/// Router inventory delivered by the daemon under `/routing`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingInfo {
    /// (name, usable) pairs; routers unable to route are listed but
    /// not selectable.
    pub available: Vec<(String, bool)>,
    pub active: Option<String>,
}

impl RoutingInfo {
    pub fn from_value(val: &Value) -> Self {
        let available = val["available"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let name = entry.get(0)?.as_str()?.to_string();
                        let valid = entry.get(1).and_then(Value::as_bool).unwrap_or(false);
                        Some((name, valid))
                    })
                    .collect()
            })
            .unwrap_or_default();
        RoutingInfo {
            available,
            active: val["active"].as_str().map(str::to_string),
        }
    }
}

/// Local preference storage keyed by string name.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, val: Value);
}

/// Observer of channel status transitions (status icon in the host UI).
pub trait StatusObserver: Send + Sync {
    fn channel_status(&self, channel: ChannelLabel, state: ChannelState);
}

/// No-op observer for embeddings without a status surface.
#[derive(Debug, Default)]
pub struct NullStatusObserver;

impl StatusObserver for NullStatusObserver {
    fn channel_status(&self, _channel: ChannelLabel, _state: ChannelState) {}
}

/// Host events feeding the session loop.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A page finished loading in the tracked tab.
    PageLoaded,
    /// Document-level scroll.
    Scrolled,
    /// Scroll inside a scrollable element.
    ElementScrolled { xpath: String, pos: [f64; 2] },
    Resized,
    LocationChanged { uri: String },
    /// The user asked to link the given selection id.
    LinkSelected { id: String },
    /// Drag-out of the current tab toward another window, carrying the
    /// document state the receiving side restores.
    Drag {
        screen_pos: [i32; 2],
        url: String,
        /// Per-element scroll offsets keyed by xpath.
        elements_scroll: serde_json::Map<String, Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routing_info_parses_available_pairs() {
        let info = RoutingInfo::from_value(&json!({
            "available": [["cpu", true], ["gpu", false], ["dijkstra", true]],
            "active": "cpu"
        }));
        assert_eq!(info.available.len(), 3);
        assert_eq!(info.available[1], ("gpu".to_string(), false));
        assert_eq!(info.active.as_deref(), Some("cpu"));
    }

    #[test]
    fn routing_info_tolerates_missing_fields() {
        let info = RoutingInfo::from_value(&json!({}));
        assert!(info.available.is_empty());
        assert!(info.active.is_none());
    }
}
