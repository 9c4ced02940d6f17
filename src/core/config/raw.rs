//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `Settings` struct.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape: serde target before resolution.
#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub node: RawNode,
    #[serde(default)]
    pub http: RawHttp,
    #[serde(default)]
    pub overlay: RawOverlay,
}

#[derive(Deserialize)]
pub(super) struct RawNode {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
}

impl Default for RawNode {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            identity_file: None,
        }
    }
}

// ── Transports ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawHttp {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for RawHttp {
    fn default() -> Self {
        Self { bind: default_http_bind() }
    }
}

#[derive(Deserialize)]
pub(super) struct RawOverlay {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_overlay_listen")]
    pub listen: Vec<String>,
}

impl Default for RawOverlay {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_overlay_listen(),
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

pub(super) fn default_overlay_listen() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/0".to_string()]
}
