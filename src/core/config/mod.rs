//! Configuration: runtime settings and the immutable node snapshot.
//!
//! # Module layout
//!
//! - **types**: Public structs: `Settings` (runtime knobs) and `NodeConfig`
//!   (the snapshot every component reads).
//! - **raw**: Raw TOML deserialization types; kept private.
//! - **load**: Settings loading: `merge_toml`, `load_raw_merged`, `load`,
//!   `load_from`, `expand_home`.
//! - **assemble**: Pure construction of `NodeConfig` from the node key and
//!   the CLI flags.

mod assemble;
mod load;
mod raw;
mod types;

pub use assemble::{KEY_ID, SERVER_NAME, assemble};
pub use load::{EnvOverrides, IDENTITY_FILE_NAME, default_identity_file, expand_home, load, load_from};
pub use types::*;

#[cfg(test)]
impl Settings {
    /// Loopback-only settings for unit tests: ephemeral port, no overlay.
    pub fn test_default(identity_file: &std::path::Path) -> Self {
        Self {
            log_level: "info".into(),
            log_file: None,
            identity_file: identity_file.to_path_buf(),
            http: HttpSettings {
                bind: "127.0.0.1:0".into(),
            },
            overlay: OverlaySettings {
                enabled: false,
                listen: vec![],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const MINIMAL_TOML: &str = r#"
[node]
log_level = "debug"
identity_file = "/tmp/node-key"

[http]
bind = "127.0.0.1:9090"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn no_env() -> EnvOverrides {
        EnvOverrides::default()
    }

    #[test]
    fn parse_basic_settings() {
        let f = write_toml(MINIMAL_TOML);
        let s = load_from(f.path(), &no_env()).unwrap();
        assert_eq!(s.log_level, "debug");
        assert_eq!(s.identity_file, std::path::PathBuf::from("/tmp/node-key"));
        assert_eq!(s.http.bind, "127.0.0.1:9090");
        assert!(s.overlay.enabled);
        assert_eq!(s.overlay.listen, vec!["/ip4/0.0.0.0/tcp/0".to_string()]);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let f = write_toml("");
        let s = load_from(f.path(), &no_env()).unwrap();
        assert_eq!(s.log_level, "info");
        assert_eq!(s.http.bind, "0.0.0.0:8080");
        assert!(s.identity_file.ends_with(IDENTITY_FILE_NAME));
        assert!(s.log_file.is_none());
    }

    #[test]
    fn env_overrides_win() {
        let f = write_toml(MINIMAL_TOML);
        let overrides = EnvOverrides {
            log_level: Some("trace".into()),
            identity_file: Some("/var/lib/node/key".into()),
            http_bind: Some("127.0.0.1:1".into()),
        };
        let s = load_from(f.path(), &overrides).unwrap();
        assert_eq!(s.log_level, "trace");
        assert_eq!(s.identity_file, std::path::PathBuf::from("/var/lib/node/key"));
        assert_eq!(s.http.bind, "127.0.0.1:1");
    }

    #[test]
    fn overlay_can_be_disabled() {
        let f = write_toml("[overlay]\nenabled = false\nlisten = []\n");
        let s = load_from(f.path(), &no_env()).unwrap();
        assert!(!s.overlay.enabled);
        assert!(s.overlay.listen.is_empty());
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.p2pnode-private");
        assert!(expanded.starts_with(&home));
    }

    #[test]
    fn absolute_path_unchanged() {
        let p = expand_home("/absolute/path");
        assert_eq!(p, std::path::PathBuf::from("/absolute/path"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(std::path::Path::new("/nonexistent/config.toml"), &no_env());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn invalid_field_type_errors() {
        let f = write_toml("[overlay]\nenabled = \"sometimes\"\n");
        assert!(load_from(f.path(), &no_env()).is_err());
    }

    fn write_named(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn overlay_file_keeps_base_fields() {
        let dir = TempDir::new().unwrap();
        write_named(&dir, "base.toml", MINIMAL_TOML);
        let top = "[meta]\nbase = \"base.toml\"\n\n[node]\nlog_level = \"warn\"\n";
        let top_path = write_named(&dir, "top.toml", top);
        let s = load_from(&top_path, &no_env()).unwrap();
        assert_eq!(s.log_level, "warn");
        assert_eq!(s.http.bind, "127.0.0.1:9090");
    }

    #[test]
    fn cycle_detection() {
        let dir = TempDir::new().unwrap();
        let self_path = dir.path().join("self.toml");
        let content = format!("[meta]\nbase = \"{}\"\n\n{MINIMAL_TOML}", self_path.display());
        std::fs::write(&self_path, content).unwrap();
        let msg = load_from(&self_path, &no_env()).unwrap_err().to_string();
        assert!(msg.contains("circular"));
    }
}
