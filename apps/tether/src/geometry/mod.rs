//! Coordinate pipeline from host-reported positions to wire regions.
//!
//! Everything sent to the daemon is in device pixels offset by the
//! window's screen position; nothing leaves this module in
//! document-relative CSS pixels. The scale factor is re-read on every
//! capture because it changes when the window moves between displays.

use regex::Regex;
use thiserror::Error;

use crate::host::{DocumentSearch, HostWindow};
use crate::protocol::{Quad, ScrollRegionWire, Viewport};

/// Rectangles thinner than this (in CSS pixels) are layout noise, not
/// real text fragments.
const MIN_TEXT_RECT: f64 = 2.0;

/// Minimum side length of an image-map area box.
const MIN_AREA_SIDE: f64 = 10.0;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("invalid match pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// A client rectangle in CSS pixels, viewport-relative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CssRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl CssRect {
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}

/// An element's position as its offset-parent chain plus its size,
/// the information needed to locate it document-relative without
/// holding a document reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementBox {
    /// (offsetLeft, offsetTop) contributions, element first, root last.
    pub offset_chain: Vec<(f64, f64)>,
    /// (offsetWidth, offsetHeight).
    pub offset_size: (f64, f64),
}

/// Ordered quadrilateral in device pixel space, clockwise from
/// top-left, optionally tagged as outside the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub corners: Quad,
    pub outside: bool,
}

impl BoundingBox {
    fn axis_aligned(l: i32, t: i32, r: i32, b: i32, outside: bool) -> Self {
        BoundingBox {
            corners: [[l, t], [r, t], [r, b], [l, b]],
            outside,
        }
    }

    pub fn to_wire(&self) -> Quad {
        self.corners
    }
}

/// Scale plus screen offset applied to every outgoing coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub scale: f64,
    pub offset: [f64; 2],
}

impl Transform {
    /// Capture the current scale and inner-content screen origin. Not
    /// cached: the ratio changes across displays.
    pub fn capture(win: &dyn HostWindow) -> Self {
        let scale = win.device_pixel_ratio();
        let (ox, oy) = win.inner_screen_origin();
        Transform {
            scale,
            offset: [ox * scale, oy * scale],
        }
    }

    fn map_x(&self, x: f64) -> i32 {
        (self.offset[0] + self.scale * x).round() as i32
    }

    fn map_y(&self, y: f64) -> i32 {
        (self.offset[1] + self.scale * y).round() as i32
    }
}

/// Which origin viewport coordinates are expressed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Relative to the window's own origin.
    Relative,
    /// Offset by the window's screen position.
    Absolute,
}

/// Visible content area as `[x, y, width, height]`.
pub fn viewport(win: &dyn HostWindow, reference: Reference) -> Viewport {
    let transform = Transform::capture(win);
    let scale = transform.scale;
    let (inner_x, inner_y) = win.inner_screen_origin();
    let (screen_x, screen_y) = win.window_screen_pos();
    let (width, height) = win.inner_size();

    let mut vp = [
        ((inner_x - screen_x) * scale).round() as i32,
        ((inner_y - screen_y) * scale).round() as i32,
        (width * scale).round() as i32,
        (height * scale).round() as i32,
    ];
    if reference == Reference::Absolute {
        vp[0] += screen_x.round() as i32;
        vp[1] += screen_y.round() as i32;
    }
    vp
}

/// Negative scroll offset of the viewport plus total scrollable
/// extents, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScrollRegion {
    pub fn to_wire(&self) -> ScrollRegionWire {
        [self.x, self.y, self.width, self.height]
    }

    /// Scroll position as a fraction of the scrollable range per axis.
    /// An extent no larger than the viewport yields 0, never a division
    /// by zero.
    pub fn fractions(&self, viewport: Viewport) -> [f64; 2] {
        let mut rel = [0.0, 0.0];
        let scroll_w = self.width - f64::from(viewport[2]);
        if scroll_w > 1.0 {
            rel[0] = self.x / scroll_w;
        }
        let scroll_h = self.height - f64::from(viewport[3]);
        if scroll_h > 1.0 {
            rel[1] = self.y / scroll_h;
        }
        rel
    }
}

pub fn scroll_region(win: &dyn HostWindow) -> ScrollRegion {
    let (sx, sy) = win.scroll_pos();
    let (sw, sh) = win.scroll_extent();
    ScrollRegion {
        x: -sx,
        y: -sy,
        width: sw,
        height: sh,
    }
}

/// Build the case-insensitive match pattern for a link id.
///
/// Runs of whitespace, hyphens, underscores and dots are one
/// equivalence class, so "foo bar" matches "foo-bar", "foo_bar" and
/// "foo.bar".
pub fn text_query(id: &str) -> Result<Regex, GeometryError> {
    let parts: Vec<String> = id
        .split(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | '.'))
        .filter(|part| !part.is_empty())
        .map(regex::escape)
        .collect();
    let pattern = format!("(?i){}", parts.join(r"[\s\-._]+"));
    Regex::new(&pattern).map_err(|source| GeometryError::InvalidPattern {
        pattern,
        source,
    })
}

/// Normalize a user selection into a link id: collapse whitespace runs
/// and lowercase.
pub fn normalize_selection(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_space = false;
    for c in raw.trim().chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            in_space = false;
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Device-space boxes of every text match for `id` in the document.
pub fn find_text_matches(
    search: &dyn DocumentSearch,
    id: &str,
    transform: &Transform,
) -> Result<Vec<BoundingBox>, GeometryError> {
    let pattern = text_query(id)?;
    let boxes = search
        .text_ranges(&pattern)
        .into_iter()
        .filter(|rect| rect.width() > MIN_TEXT_RECT && rect.height() > MIN_TEXT_RECT)
        .map(|rect| {
            // 1px margin on left/right/top; the original leaves the
            // bottom edge unpadded.
            BoundingBox::axis_aligned(
                transform.map_x(rect.left - 1.0),
                transform.map_y(rect.top - 1.0),
                transform.map_x(rect.right + 1.0),
                transform.map_y(rect.bottom),
                false,
            )
        })
        .collect();
    Ok(boxes)
}

/// Axis-aligned box decoded from an image-map `coords` attribute, in
/// CSS pixels relative to the owning image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Decode an area's coordinate list per shape.
///
/// Three numbers are a circle, decoded with the radius as the box side
/// length (not the diameter) — a quirk every deployed client shares,
/// kept for compatibility. Four numbers are a rectangle `x1,y1,x2,y2`;
/// more are a polygon reduced to its bounding box. Boxes are enlarged
/// to at least 10×10.
pub fn decode_area_coords(coords: &str) -> Option<AreaRect> {
    let nums: Vec<f64> = coords
        .split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .collect();

    let (x, y, mut w, mut h) = match nums.len() {
        0..=2 => return None,
        3 => (nums[0], nums[1], nums[2], nums[2]),
        4 => (nums[0], nums[1], nums[2] - nums[0], nums[3] - nums[1]),
        _ => {
            let (mut min_x, mut min_y) = (nums[0], nums[1]);
            let (mut max_x, mut max_y) = (nums[0], nums[1]);
            for pair in nums[2..].chunks_exact(2) {
                min_x = min_x.min(pair[0]);
                max_x = max_x.max(pair[0]);
                min_y = min_y.min(pair[1]);
                max_y = max_y.max(pair[1]);
            }
            (min_x, min_y, max_x - min_x, max_y - min_y)
        }
    };

    w = w.max(MIN_AREA_SIDE);
    h = h.max(MIN_AREA_SIDE);
    Some(AreaRect {
        x,
        y,
        width: w,
        height: h,
    })
}

/// Document-relative CSS position of an element, accumulated over its
/// offset-parent chain and corrected for the current scroll offset.
/// `None` for zero-sized elements.
fn element_css_origin(element: &ElementBox, win: &dyn HostWindow) -> Option<(f64, f64, f64, f64)> {
    let (w, h) = element.offset_size;
    if w == 0.0 || h == 0.0 {
        return None;
    }
    let (scroll_x, scroll_y) = win.scroll_pos();
    // Seed at -1 and pad the size, matching the original's outline
    // fudge so boxes visually wrap the element border.
    let (mut left, mut top) = (-1.0, -1.0);
    for (dx, dy) in &element.offset_chain {
        left += dx;
        top += dy;
    }
    Some((left - scroll_x, top - scroll_y, w + 2.0, h + 1.0))
}

/// Device-space box of an element, or `None` when it has no extent.
pub fn bounding_box_of(
    element: &ElementBox,
    win: &dyn HostWindow,
    transform: &Transform,
) -> Option<BoundingBox> {
    let (x, y, w, h) = element_css_origin(element, win)?;
    let (view_w, view_h) = win.inner_size();
    let outside = x + 0.5 * w < 0.0
        || x + 0.5 * w > view_w
        || y + 0.5 * h < 0.0
        || y + 0.5 * h > view_h;
    Some(BoundingBox::axis_aligned(
        transform.map_x(x),
        transform.map_y(y),
        transform.map_x(x + w),
        transform.map_y(y + h),
        outside,
    ))
}

/// Device-space boxes of every image-map area whose title matches `id`.
pub fn find_area_matches(
    search: &dyn DocumentSearch,
    id: &str,
    win: &dyn HostWindow,
    transform: &Transform,
) -> Vec<BoundingBox> {
    search
        .map_areas(id)
        .into_iter()
        .filter_map(|area| {
            let rect = decode_area_coords(&area.coords)?;
            let image = area.image?;
            let (img_x, img_y, _, _) = element_css_origin(&image, win)?;
            let x = img_x + rect.x;
            let y = img_y + rect.y;
            Some(BoundingBox::axis_aligned(
                transform.map_x(x),
                transform.map_y(y),
                transform.map_x(x + rect.width),
                transform.map_y(y + rect.height),
                false,
            ))
        })
        .collect()
}

/// Text and area matches combined: the full region set reported for a
/// link id.
pub fn search_document(
    search: &dyn DocumentSearch,
    id: &str,
    win: &dyn HostWindow,
    transform: &Transform,
) -> Result<Vec<BoundingBox>, GeometryError> {
    let mut boxes = find_text_matches(search, id, transform)?;
    boxes.extend(find_area_matches(search, id, win, transform));
    Ok(boxes)
}
