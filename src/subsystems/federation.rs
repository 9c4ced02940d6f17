//! Outbound federation client and the key-verification ring.
//!
//! [`FederationClient`] signs JSON with the node key and talks to remote
//! servers over `reqwest`.  [`KeyRing`] verifies signed JSON from any server,
//! resolving verify keys through the [`ServerKeyDb`] cache first and the
//! client second.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ed25519_dalek::{Signature, Signer as _, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{NodeConfig, NodeIdentity};
use crate::error::AppError;
use crate::subsystems::storage::ServerKeyDb;

/// Key responses stay valid this long after they are generated.
const KEY_VALIDITY_MS: i64 = 24 * 60 * 60 * 1000;

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyKey {
    pub key: String,
}

/// Body of `GET /_matrix/key/v2/server`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerKeys {
    pub server_name: String,
    pub verify_keys: BTreeMap<String, VerifyKey>,
    pub valid_until_ts: i64,
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

/// Bytes covered by a signature: the object without `signatures`/`unsigned`,
/// serialised with sorted keys.
pub fn signable_bytes(value: &Value) -> Vec<u8> {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.remove("signatures");
        map.remove("unsigned");
    }
    serde_json::to_vec(&value).unwrap_or_default()
}

/// The object a federation request signature covers.
pub fn request_json(method: &str, uri: &str, origin: &str, destination: &str, content: Option<&Value>) -> Value {
    let mut request = json!({
        "method": method,
        "uri": uri,
        "origin": origin,
        "destination": destination,
    });
    if let Some(content) = content {
        request["content"] = content.clone();
    }
    request
}

/// Parsed `Authorization: X-Matrix origin=…,key="…",sig="…"` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMatrixAuth {
    pub origin: String,
    pub key_id: String,
    pub sig: String,
}

impl XMatrixAuth {
    pub fn parse(header: &str) -> Option<Self> {
        let params = header.strip_prefix("X-Matrix ")?;
        let (mut origin, mut key_id, mut sig) = (None, None, None);
        for param in params.split(',') {
            let (name, value) = param.trim().split_once('=')?;
            let value = value.trim_matches('"').to_string();
            match name {
                "origin" => origin = Some(value),
                "key" => key_id = Some(value),
                "sig" => sig = Some(value),
                _ => {}
            }
        }
        Some(Self {
            origin: origin?,
            key_id: key_id?,
            sig: sig?,
        })
    }
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD.decode(s.trim_end_matches('=')).ok()
}

// ── FederationClient ─────────────────────────────────────────────────────────

pub struct FederationClient {
    identity: NodeIdentity,
    http: reqwest::Client,
}

impl FederationClient {
    pub fn new(config: &NodeConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("p2pnode/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Assembly(format!("federation client: {e}")))?;
        Ok(Self {
            identity: config.identity.clone(),
            http,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.identity.server_name
    }

    pub fn key_id(&self) -> &str {
        &self.identity.key_id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    /// Sign `value` and insert the signature under
    /// `signatures.{server_name}.{key_id}`.
    pub fn sign_json(&self, value: &mut Value) {
        let signature = self.identity.signing_key().sign(&signable_bytes(value));
        let encoded = STANDARD_NO_PAD.encode(signature.to_bytes());
        if let Value::Object(map) = value {
            let signatures = map
                .entry("signatures")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(by_server) = signatures {
                let entry = by_server
                    .entry(self.server_name().to_string())
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Value::Object(by_key) = entry {
                    by_key.insert(self.key_id().to_string(), Value::String(encoded));
                }
            }
        }
    }

    /// `Authorization` header value for a federation request to `destination`.
    pub fn sign_request(&self, method: &str, uri: &str, destination: &str, content: Option<&Value>) -> String {
        let request = request_json(method, uri, self.server_name(), destination, content);
        let signature = self.identity.signing_key().sign(&signable_bytes(&request));
        format!(
            "X-Matrix origin={},key=\"{}\",sig=\"{}\"",
            self.server_name(),
            self.key_id(),
            STANDARD_NO_PAD.encode(signature.to_bytes())
        )
    }

    /// This node's own signed key response.
    pub fn own_server_keys(&self) -> Value {
        let mut verify_keys = BTreeMap::new();
        verify_keys.insert(
            self.key_id().to_string(),
            VerifyKey {
                key: self.identity.public_key_base64(),
            },
        );
        let keys = ServerKeys {
            server_name: self.server_name().to_string(),
            verify_keys,
            valid_until_ts: chrono::Utc::now().timestamp_millis() + KEY_VALIDITY_MS,
            signatures: BTreeMap::new(),
        };
        let mut value = serde_json::to_value(keys).unwrap_or(Value::Null);
        self.sign_json(&mut value);
        value
    }

    /// Fetch a remote server's published keys and return the ones that
    /// survive [`validate_server_keys`].
    pub async fn fetch_server_keys(&self, server_name: &str) -> Result<BTreeMap<String, [u8; 32]>, VerifyError> {
        validate_server_name(server_name)?;
        let url = format!("https://{server_name}/_matrix/key/v2/server");
        debug!(%url, "fetching server keys");
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VerifyError::Fetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| VerifyError::Fetch(e.to_string()))?;
        validate_server_keys(server_name, &body, chrono::Utc::now().timestamp_millis())
    }
}

/// Reject origins that would change the key URL's authority or path.
pub fn validate_server_name(server_name: &str) -> Result<(), VerifyError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']');
    if server_name.is_empty() || !server_name.chars().all(allowed) {
        return Err(VerifyError::InvalidServerName(server_name.to_string()));
    }
    Ok(())
}

/// Check a key response for `server_name` and decode its verify keys.
///
/// The response must name `server_name`, still be valid at `now_ms`, and be
/// signed by at least one of its own keys; every such signature must verify.
pub fn validate_server_keys(
    server_name: &str,
    body: &Value,
    now_ms: i64,
) -> Result<BTreeMap<String, [u8; 32]>, VerifyError> {
    let keys: ServerKeys =
        serde_json::from_value(body.clone()).map_err(|e| VerifyError::Fetch(format!("malformed key response: {e}")))?;
    if keys.server_name != server_name {
        return Err(VerifyError::Fetch(format!(
            "asked {server_name} for keys, got keys for {}",
            keys.server_name
        )));
    }
    if keys.valid_until_ts <= now_ms {
        return Err(VerifyError::Expired {
            server_name: server_name.to_string(),
            valid_until_ts: keys.valid_until_ts,
        });
    }

    let decoded: BTreeMap<String, [u8; 32]> = keys
        .verify_keys
        .iter()
        .filter_map(|(id, vk)| {
            let bytes = decode_base64(&vk.key).and_then(|b| <[u8; 32]>::try_from(b).ok())?;
            Some((id.clone(), bytes))
        })
        .collect();

    let message = signable_bytes(body);
    let mut verified = 0;
    for (key_id, sig) in keys.signatures.get(server_name).into_iter().flatten() {
        let Some(key) = decoded.get(key_id) else {
            continue;
        };
        let bad = || VerifyError::BadSignature {
            server_name: server_name.to_string(),
            key_id: key_id.clone(),
        };
        let sig_bytes = decode_base64(sig).ok_or_else(bad)?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| bad())?;
        let verifying = VerifyingKey::from_bytes(key).map_err(|_| bad())?;
        verifying.verify(&message, &signature).map_err(|_| bad())?;
        verified += 1;
    }
    if verified == 0 {
        return Err(VerifyError::MissingSignature(server_name.to_string()));
    }
    Ok(decoded)
}

// ── KeyRing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum VerifyError {
    #[error("no signature from {0}")]
    MissingSignature(String),
    #[error("unknown key {key_id} for {server_name}")]
    UnknownKey { server_name: String, key_id: String },
    #[error("bad signature from {server_name} with {key_id}")]
    BadSignature { server_name: String, key_id: String },
    #[error("key fetch failed: {0}")]
    Fetch(String),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("keys for {server_name} expired at {valid_until_ts}")]
    Expired { server_name: String, valid_until_ts: i64 },
}

pub struct KeyRing {
    key_db: Arc<ServerKeyDb>,
    client: Arc<FederationClient>,
}

impl KeyRing {
    /// Build the ring and seed it with this node's own key.
    pub async fn new(key_db: Arc<ServerKeyDb>, client: Arc<FederationClient>) -> Self {
        key_db
            .store_key(client.server_name(), client.key_id(), client.public_key_bytes())
            .await;
        info!(server_name = client.server_name(), key_id = client.key_id(), "key ring ready");
        Self { key_db, client }
    }

    /// Verify that `value` carries a valid signature from `server_name`.
    pub async fn verify_json(&self, server_name: &str, value: &Value) -> Result<(), VerifyError> {
        let signatures = value
            .get("signatures")
            .and_then(|s| s.get(server_name))
            .and_then(Value::as_object)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| VerifyError::MissingSignature(server_name.to_string()))?;

        let message = signable_bytes(value);
        for (key_id, sig) in signatures {
            let key = self.resolve_key(server_name, key_id).await?;
            let bad = || VerifyError::BadSignature {
                server_name: server_name.to_string(),
                key_id: key_id.clone(),
            };
            let sig_bytes = sig.as_str().and_then(decode_base64).ok_or_else(bad)?;
            let signature = Signature::from_slice(&sig_bytes).map_err(|_| bad())?;
            let verifying = VerifyingKey::from_bytes(&key).map_err(|_| bad())?;
            verifying.verify(&message, &signature).map_err(|_| bad())?;
        }
        Ok(())
    }

    /// Authenticate an incoming federation request; returns the origin.
    pub async fn verify_request(
        &self,
        auth: &XMatrixAuth,
        method: &str,
        uri: &str,
        content: Option<&Value>,
    ) -> Result<String, VerifyError> {
        let mut request = request_json(method, uri, &auth.origin, self.client.server_name(), content);
        let mut by_key = serde_json::Map::new();
        by_key.insert(auth.key_id.clone(), Value::String(auth.sig.clone()));
        let mut by_server = serde_json::Map::new();
        by_server.insert(auth.origin.clone(), Value::Object(by_key));
        request["signatures"] = Value::Object(by_server);
        self.verify_json(&auth.origin, &request).await?;
        Ok(auth.origin.clone())
    }

    async fn resolve_key(&self, server_name: &str, key_id: &str) -> Result<[u8; 32], VerifyError> {
        if let Some(key) = self.key_db.fetch_key(server_name, key_id).await {
            return Ok(key);
        }
        if server_name == self.client.server_name() {
            return Err(VerifyError::UnknownKey {
                server_name: server_name.to_string(),
                key_id: key_id.to_string(),
            });
        }

        let fetched = self.client.fetch_server_keys(server_name).await?;
        for (id, bytes) in fetched {
            self.key_db.store_key(server_name, &id, bytes).await;
        }
        self.key_db
            .fetch_key(server_name, key_id)
            .await
            .ok_or_else(|| VerifyError::UnknownKey {
                server_name: server_name.to_string(),
                key_id: key_id.to_string(),
            })
    }
}
