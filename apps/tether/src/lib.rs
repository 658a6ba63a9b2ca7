//! Client core for the tether visual-link routing daemon.
//!
//! The daemon draws links across application windows; this crate is the
//! window side of that conversation. It keeps two WebSocket channels to
//! the daemon, resolves link ids to on-screen regions, tracks the
//! resulting routes, streams preview tiles, and mirrors scrolling and
//! navigation between related windows. Everything host-specific (the
//! actual window, document, and screen buffer) is injected through the
//! traits in [`host`].

pub mod config;
pub mod geometry;
pub mod host;
pub mod prefs;
pub mod protocol;
pub mod scroll;
pub mod session;
pub mod telemetry;
pub mod tiles;

pub use config::Config;
pub use session::{HostBindings, Session};
