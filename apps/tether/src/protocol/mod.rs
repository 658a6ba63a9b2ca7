//! Wire model for the routing daemon protocol.
//!
//! Every structured message carries a `task` discriminator and is
//! exchanged as JSON text on a `VLP` WebSocket. Preview tiles travel as
//! binary frames: a type byte, the request id byte, then raw RGBA rows
//! at the requested output size.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Subprotocol requested during the WebSocket handshake.
pub const WIRE_SUBPROTOCOL: &str = "VLP";

/// Type tag of a preview tile binary frame.
pub const TILE_TYPE_PREVIEW: u8 = 0;

/// Window viewport as `[x, y, width, height]` in device pixels.
pub type Viewport = [i32; 4];

/// Scroll region as `[x, y, width, height]`: negative scroll offset of
/// the visible area plus the total scrollable extents, in CSS pixels.
pub type ScrollRegionWire = [f64; 4];

/// One region quadrilateral: four corners, clockwise from top-left, in
/// device pixels offset by the window's screen position.
pub type Quad = [[i32; 2]; 4];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed wire message: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Remote config value type accompanying GET/SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigValueType {
    String,
    Integer,
    Float,
    Bool,
}

/// Structured protocol message, discriminated by `task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum WireMessage {
    /// Announce presence and the window anchor point.
    Register {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Commands this client accepts from the daemon.
        #[serde(skip_serializing_if = "Option::is_none")]
        cmds: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        viewport: Option<Viewport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pos: Option<[f64; 2]>,
        #[serde(rename = "src-id", skip_serializing_if = "Option::is_none")]
        src_id: Option<String>,
    },
    /// Read a named remote value. Inbound GETs for `preview-tile`
    /// additionally carry the tile request parameters.
    Get {
        id: String,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        value_type: Option<ConfigValueType>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<[u32; 2]>,
        #[serde(skip_serializing_if = "Option::is_none")]
        src: Option<SourceRect>,
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sections_src: Option<Vec<[f64; 2]>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sections_dest: Option<Vec<[f64; 2]>>,
    },
    /// Write a named remote or local value.
    Set {
        id: String,
        val: Value,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        value_type: Option<ConfigValueType>,
    },
    /// Response to GET.
    GetFound { id: String, val: Value },
    /// Daemon asks this side to resolve and highlight an id.
    Request { id: String, stamp: i64 },
    /// Locally triggered link report.
    Initiate {
        id: String,
        stamp: i64,
        title: String,
        #[serde(rename = "scroll-region")]
        scroll_region: ScrollRegionWire,
        #[serde(skip_serializing_if = "Option::is_none")]
        regions: Option<Vec<Quad>>,
    },
    /// Link report answering a REQUEST.
    Found {
        id: String,
        stamp: i64,
        title: String,
        #[serde(rename = "scroll-region")]
        scroll_region: ScrollRegionWire,
        #[serde(skip_serializing_if = "Option::is_none")]
        regions: Option<Vec<Quad>>,
    },
    /// Cancel one route; `id = ""` with `stamp = -1` aborts everything.
    Abort { id: String, stamp: i64 },
    /// Re-sent geometry after a layout-affecting change.
    Update {
        id: String,
        stamp: i64,
        #[serde(rename = "scroll-region")]
        scroll_region: ScrollRegionWire,
        #[serde(skip_serializing_if = "Option::is_none")]
        regions: Option<Vec<Quad>>,
    },
    /// Cross-window scroll/navigation mirroring.
    Sync {
        #[serde(flatten)]
        body: SyncBody,
    },
    /// Window size or position changed.
    Resize { viewport: Viewport },
    /// Daemon-initiated command, currently only `open-url`.
    Cmd {
        cmd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        view: Option<[i32; 2]>,
        /// Hidden content data relayed verbatim into the new window.
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    },
    /// Drag-initiated handshake on the control channel.
    Drag {
        url: String,
        scroll: [f64; 2],
        #[serde(rename = "elements-scroll")]
        elements_scroll: serde_json::Map<String, Value>,
        view: Viewport,
        #[serde(rename = "tab-id")]
        tab_id: String,
        #[serde(rename = "screenPos")]
        screen_pos: [i32; 2],
    },
}

/// SYNC payload, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SyncBody {
    Scroll {
        pos: [f64; 2],
        #[serde(rename = "pos-rel", skip_serializing_if = "Option::is_none")]
        pos_rel: Option<[f64; 2]>,
        #[serde(skip_serializing_if = "Option::is_none")]
        xpath: Option<String>,
        #[serde(rename = "tab-id")]
        tab_id: String,
    },
    Uri {
        uri: String,
        #[serde(rename = "tab-id")]
        tab_id: String,
    },
}

/// Capture source rectangle of a tile request, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Outbound payload: structured messages as text, tiles as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Binary(Bytes),
}

impl Outgoing {
    pub fn message(msg: &WireMessage) -> Result<Self, ProtocolError> {
        Ok(Outgoing::Text(serde_json::to_string(msg)?))
    }
}

pub fn parse_message(raw: &str) -> Result<WireMessage, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

/// Frame a captured tile for transmission.
pub fn frame_tile(type_tag: u8, request_id: u8, pixels: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(pixels.len() + 2);
    buf.put_u8(type_tag);
    buf.put_u8(request_id);
    buf.put_slice(pixels);
    buf.freeze()
}
