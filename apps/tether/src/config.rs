//! Client configuration with environment overrides.

use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Primary links endpoint of the routing daemon.
pub const DEFAULT_LINKS_URL: &str = "ws://localhost:4487";
/// Secondary control endpoint (drag handshakes, settings, sync).
pub const DEFAULT_CONTROL_URL: &str = "ws://localhost:24803";

pub const DEFAULT_CLIENT_NAME: &str = "tether";

/// Quiet window after a layout-affecting change before geometry is
/// recomputed and re-sent.
pub const REROUTE_DEBOUNCE: Duration = Duration::from_millis(500);
/// Minimum spacing between outbound scroll sync messages.
pub const SCROLL_THROTTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {value}: {source}")]
    InvalidUrl {
        var: &'static str,
        value: String,
        source: url::ParseError,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub links_url: Url,
    pub control_url: Url,
    /// Name announced in REGISTER.
    pub client_name: String,
    /// Register by document title instead of the window anchor point.
    pub match_by_title: bool,
    /// Abort existing routes before reporting a newly selected one.
    pub replace_route: bool,
    pub reroute_debounce: Duration,
    pub scroll_throttle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            links_url: Url::parse(DEFAULT_LINKS_URL).expect("default links endpoint is valid"),
            control_url: Url::parse(DEFAULT_CONTROL_URL).expect("default control endpoint is valid"),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            match_by_title: false,
            replace_route: false,
            reroute_debounce: REROUTE_DEBOUNCE,
            scroll_throttle: SCROLL_THROTTLE,
        }
    }
}

impl Config {
    /// Defaults overlaid with `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(url) = env_url("TETHER_LINKS_URL")? {
            config.links_url = url;
        }
        if let Some(url) = env_url("TETHER_CONTROL_URL")? {
            config.control_url = url;
        }
        if let Ok(name) = env::var("TETHER_CLIENT_NAME") {
            if !name.trim().is_empty() {
                config.client_name = name.trim().to_string();
            }
        }
        if let Some(flag) = env_truthy("TETHER_MATCH_TITLE") {
            config.match_by_title = flag;
        }
        if let Some(flag) = env_truthy("TETHER_REPLACE_ROUTE") {
            config.replace_route = flag;
        }
        Ok(config)
    }
}

fn env_url(var: &'static str) -> Result<Option<Url>, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            let value = value.trim();
            Url::parse(value)
                .map(Some)
                .map_err(|source| ConfigError::InvalidUrl {
                    var,
                    value: value.to_string(),
                    source,
                })
        }
        _ => Ok(None),
    }
}

fn env_truthy(var: &str) -> Option<bool> {
    let value = env::var(var).ok()?;
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }
    Some(matches!(normalized.as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_local_daemon() {
        let config = Config::default();
        assert_eq!(config.links_url.as_str(), "ws://localhost:4487/");
        assert_eq!(config.control_url.as_str(), "ws://localhost:24803/");
        assert!(!config.match_by_title);
        assert!(!config.replace_route);
    }

    #[test]
    fn truthy_parsing() {
        std::env::set_var("TETHER_TEST_TRUTHY", "YES");
        assert_eq!(env_truthy("TETHER_TEST_TRUTHY"), Some(true));
        std::env::set_var("TETHER_TEST_TRUTHY", "0");
        assert_eq!(env_truthy("TETHER_TEST_TRUTHY"), Some(false));
        std::env::remove_var("TETHER_TEST_TRUTHY");
        assert_eq!(env_truthy("TETHER_TEST_TRUTHY"), None);
    }
}
