//! Settings loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `P2PNODE_LOG_LEVEL`, `P2PNODE_IDENTITY_FILE` and
//! `P2PNODE_HTTP_BIND` env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

use super::raw::RawConfig;
use super::types::*;

/// File name of the identity keypair, relative to the user's home directory.
pub const IDENTITY_FILE_NAME: &str = ".p2pnode-private";

/// Env-provided overrides, captured once so tests can pass them explicitly.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub log_level: Option<String>,
    pub identity_file: Option<String>,
    pub http_bind: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("P2PNODE_LOG_LEVEL").ok(),
            identity_file: env::var("P2PNODE_IDENTITY_FILE").ok(),
            http_bind: env::var("P2PNODE_HTTP_BIND").ok(),
        }
    }
}

/// Deep-merge two TOML values.
/// Tables are merged recursively; the overlay only needs to specify keys that
/// differ from the base. For every other type (string, integer, array, …)
/// the overlay value replaces the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return the
/// fully merged `toml::Value`. `visited` carries canonicalized paths already
/// seen in this chain so circular references are caught early.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load settings from the given path, or `config/default.toml` when present,
/// then apply env-var overrides.  With neither, built-in defaults apply.
pub fn load(config_path: Option<&str>) -> Result<Settings, AppError> {
    let overrides = EnvOverrides::from_env();

    if let Some(path) = config_path {
        return load_from(Path::new(path), &overrides);
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(default_path, &overrides)
    } else {
        Ok(resolve(RawConfig::default(), &overrides))
    }
}

/// Internal loader: accepts an explicit path and explicit overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(path: &Path, overrides: &EnvOverrides) -> Result<Settings, AppError> {
    let merged_val = load_raw_merged(path, &mut HashSet::new())?;

    let parsed: RawConfig = Deserialize::deserialize(merged_val).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;

    Ok(resolve(parsed, overrides))
}

fn resolve(parsed: RawConfig, overrides: &EnvOverrides) -> Settings {
    let identity_file = overrides
        .identity_file
        .as_deref()
        .or(parsed.node.identity_file.as_deref())
        .map(expand_home)
        .unwrap_or_else(default_identity_file);

    Settings {
        log_level: overrides
            .log_level
            .clone()
            .unwrap_or(parsed.node.log_level),
        log_file: parsed.node.log_file.as_deref().map(expand_home),
        identity_file,
        http: HttpSettings {
            bind: overrides.http_bind.clone().unwrap_or(parsed.http.bind),
        },
        overlay: OverlaySettings {
            enabled: parsed.overlay.enabled,
            listen: parsed.overlay.listen,
        },
    }
}

/// `~/.p2pnode-private`, or the bare file name when no home directory is known.
pub fn default_identity_file() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(IDENTITY_FILE_NAME),
        None => PathBuf::from(IDENTITY_FILE_NAME),
    }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
