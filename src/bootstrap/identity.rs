//! Node identity: ed25519 keypair load-or-create.
//!
//! The identity file holds the raw 64-byte keypair: the 32-byte signing seed
//! followed by the 32-byte verifying key.  It is written once with mode 0600
//! and never rewritten.
//!
//! Startup never fails because of the identity file:
//!
//! - missing → generate, try to persist; a failed write only warns.
//! - unreadable or corrupt → warn and run with an ephemeral keypair; the
//!   file on disk is left untouched.
//!
//! `node_id` is the first 8 hex characters of `SHA256(verifying_key_bytes)`.

use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use ed25519_dalek::{KEYPAIR_LENGTH, SigningKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// How the keypair in a [`LoadedIdentity`] came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Read back from an intact identity file.
    Loaded,
    /// No file existed; a new keypair was generated.
    Generated { persisted: bool },
    /// The file existed but could not be used; this keypair lives in memory only.
    Ephemeral { reason: String },
}

/// Result of [`load_or_create`].
#[derive(Debug, Clone)]
pub struct LoadedIdentity {
    pub signing_key: SigningKey,
    pub origin: IdentityOrigin,
}

impl LoadedIdentity {
    /// `true` when this start did not reuse a stored keypair.
    pub fn was_generated(&self) -> bool {
        !matches!(self.origin, IdentityOrigin::Loaded)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> String {
        compute_node_id(&self.public_key_bytes())
    }
}

/// Load the keypair stored at `path`, or create one.
pub fn load_or_create(path: &Path) -> LoadedIdentity {
    if !path.exists() {
        let signing_key = generate_keypair();
        let persisted = match save_keypair(path, &signing_key) {
            Ok(()) => {
                info!(path = %path.display(), "generated new node identity");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), "couldn't write private key to file: {e}; continuing with in-memory identity");
                false
            }
        };
        return LoadedIdentity {
            signing_key,
            origin: IdentityOrigin::Generated { persisted },
        };
    }

    match load_keypair(path) {
        Ok(signing_key) => LoadedIdentity {
            signing_key,
            origin: IdentityOrigin::Loaded,
        },
        Err(reason) => {
            warn!(path = %path.display(), %reason, "couldn't read private key from file; using ephemeral identity");
            LoadedIdentity {
                signing_key: generate_keypair(),
                origin: IdentityOrigin::Ephemeral { reason },
            }
        }
    }
}

/// Derive `node_id`: first 8 hex chars of `SHA256(verifying_key_bytes)`.
pub fn compute_node_id(verifying_key_bytes: &[u8; 32]) -> String {
    let digest = Sha256::digest(verifying_key_bytes);
    hex::encode(digest)[..8].to_string()
}

// ── internals ────────────────────────────────────────────────────────────────

fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Write the 64-byte keypair with owner-only permissions.
fn save_keypair(path: &Path, signing_key: &SigningKey) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(&signing_key.to_keypair_bytes())?;
    file.sync_all()
}

/// Read and validate the keypair.  The error string is the warning reason.
fn load_keypair(path: &Path) -> Result<SigningKey, String> {
    let bytes = fs::read(path).map_err(|e| format!("cannot read identity file: {e}"))?;
    let keypair: [u8; KEYPAIR_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("identity file is {} bytes, expected {KEYPAIR_LENGTH}", bytes.len()))?;
    SigningKey::from_keypair_bytes(&keypair)
        .map_err(|e| format!("identity file is not a valid ed25519 keypair: {e}"))
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn compute_node_id_is_8_hex_chars() {
        let id = compute_node_id(&generate_keypair().verifying_key().to_bytes());
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn missing_file_generates_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.key");

        let identity = load_or_create(&path);

        assert_eq!(identity.origin, IdentityOrigin::Generated { persisted: true });
        assert!(identity.was_generated());
        assert_eq!(fs::read(&path).unwrap().len(), KEYPAIR_LENGTH);
    }

    #[test]
    fn intact_file_reproduces_identity() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.key");

        let first = load_or_create(&path);
        let second = load_or_create(&path);
        let third = load_or_create(&path);

        assert_eq!(second.origin, IdentityOrigin::Loaded);
        assert!(!second.was_generated());
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
        assert_eq!(second.public_key_bytes(), third.public_key_bytes());
        assert_eq!(first.node_id(), third.node_id());
    }

    #[test]
    fn truncated_file_falls_back_to_ephemeral() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.key");
        fs::write(&path, b"not a key").unwrap();

        let identity = load_or_create(&path);

        match &identity.origin {
            IdentityOrigin::Ephemeral { reason } => assert!(reason.contains("expected 64")),
            other => panic!("expected ephemeral identity, got {other:?}"),
        }
        assert!(identity.was_generated());
        // Corrupt data is never overwritten.
        assert_eq!(fs::read(&path).unwrap(), b"not a key");
    }

    #[test]
    fn mismatched_public_half_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.key");
        let mut bytes = generate_keypair().to_keypair_bytes();
        bytes[32..].copy_from_slice(&generate_keypair().verifying_key().to_bytes());
        fs::write(&path, bytes).unwrap();

        let identity = load_or_create(&path);

        assert!(matches!(identity.origin, IdentityOrigin::Ephemeral { .. }));
    }

    #[test]
    fn ephemeral_identities_differ_between_starts() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.key");
        fs::write(&path, [0u8; 10]).unwrap();

        let a = load_or_create(&path);
        let b = load_or_create(&path);
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn unwritable_location_continues_in_memory() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing-dir").join("node.key");

        let identity = load_or_create(&path);

        assert_eq!(identity.origin, IdentityOrigin::Generated { persisted: false });
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn secret_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.key");
        load_or_create(&path);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
