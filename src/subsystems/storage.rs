//! Shared datastores: accounts, devices, server keys.
//!
//! Each store is opened from its [`DataSource`].  Opening validates the
//! descriptor and fails for anything undialable; the records themselves are
//! held in memory behind a `tokio::sync::RwLock`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::{DataSource, DataSourceParts, NodeConfig};
use crate::error::AppError;

/// An opened datastore connection.
#[derive(Debug, Clone)]
pub struct Datastore {
    pub component: &'static str,
    pub source: DataSource,
    pub parts: DataSourceParts,
}

/// Open the datastore for `component`.  Fails when the descriptor is invalid.
pub fn open(component: &'static str, source: &DataSource) -> Result<Datastore, AppError> {
    let parts = source
        .parts()
        .map_err(|e| AppError::Datastore(format!("{component}: {e}")))?;
    debug!(component, database = %parts.database, port = parts.port, "datastore opened");
    Ok(Datastore {
        component,
        source: source.clone(),
        parts,
    })
}

// ── Accounts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub localpart: String,
    pub user_id: String,
}

pub struct AccountsDb {
    store: Datastore,
    server_name: String,
    accounts: RwLock<HashMap<String, Account>>,
}

impl AccountsDb {
    pub fn open(config: &NodeConfig) -> Result<Self, AppError> {
        Ok(Self {
            store: open("accounts", &config.database.account)?,
            server_name: config.server_name().to_string(),
            accounts: RwLock::new(HashMap::new()),
        })
    }

    pub fn datastore(&self) -> &Datastore {
        &self.store
    }

    /// Create an account; fails when the localpart is taken or invalid.
    pub async fn create_account(&self, localpart: &str) -> Result<Account, AppError> {
        if localpart.is_empty()
            || !localpart
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._=-/".contains(c))
        {
            return Err(AppError::Datastore(format!("invalid localpart: {localpart:?}")));
        }
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(localpart) {
            return Err(AppError::Datastore(format!("localpart in use: {localpart}")));
        }
        let account = Account {
            localpart: localpart.to_string(),
            user_id: format!("@{localpart}:{}", self.server_name),
        };
        accounts.insert(localpart.to_string(), account.clone());
        Ok(account)
    }

    pub async fn account_by_localpart(&self, localpart: &str) -> Option<Account> {
        self.accounts.read().await.get(localpart).cloned()
    }

    /// Look up by full user id; only local users can exist here.
    pub async fn account_by_user_id(&self, user_id: &str) -> Option<Account> {
        let localpart = user_id
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.server_name))?;
        self.account_by_localpart(localpart).await
    }
}

// ── Devices ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub access_token: String,
}

pub struct DeviceDb {
    store: Datastore,
    by_token: RwLock<HashMap<String, Device>>,
}

impl DeviceDb {
    pub fn open(config: &NodeConfig) -> Result<Self, AppError> {
        Ok(Self {
            store: open("devices", &config.database.device)?,
            by_token: RwLock::new(HashMap::new()),
        })
    }

    pub fn datastore(&self) -> &Datastore {
        &self.store
    }

    /// Register a new device with a fresh access token.
    pub async fn create_device(&self, user_id: &str) -> Device {
        let device = Device {
            device_id: Uuid::new_v4().simple().to_string()[..10].to_uppercase(),
            user_id: user_id.to_string(),
            access_token: Uuid::new_v4().simple().to_string(),
        };
        self.by_token
            .write()
            .await
            .insert(device.access_token.clone(), device.clone());
        device
    }

    pub async fn device_by_token(&self, access_token: &str) -> Option<Device> {
        self.by_token.read().await.get(access_token).cloned()
    }
}

// ── Server keys ──────────────────────────────────────────────────────────────

/// Cache of remote servers' verify keys, keyed by `(server_name, key_id)`.
pub struct ServerKeyDb {
    store: Datastore,
    keys: RwLock<HashMap<(String, String), [u8; 32]>>,
}

impl ServerKeyDb {
    pub fn open(config: &NodeConfig) -> Result<Self, AppError> {
        Ok(Self {
            store: open("serverkeys", &config.database.server_key)?,
            keys: RwLock::new(HashMap::new()),
        })
    }

    pub fn datastore(&self) -> &Datastore {
        &self.store
    }

    pub async fn store_key(&self, server_name: &str, key_id: &str, key: [u8; 32]) {
        self.keys
            .write()
            .await
            .insert((server_name.to_string(), key_id.to_string()), key);
    }

    pub async fn fetch_key(&self, server_name: &str, key_id: &str) -> Option<[u8; 32]> {
        self.keys
            .read()
            .await
            .get(&(server_name.to_string(), key_id.to_string()))
            .copied()
    }
}

// ── Setup ────────────────────────────────────────────────────────────────────

/// The three stores every later component shares.
pub struct SharedStores {
    pub accounts: Arc<AccountsDb>,
    pub devices: Arc<DeviceDb>,
    pub server_keys: Arc<ServerKeyDb>,
}

pub fn open_shared(config: &NodeConfig) -> Result<SharedStores, AppError> {
    Ok(SharedStores {
        accounts: Arc::new(AccountsDb::open(config)?),
        devices: Arc::new(DeviceDb::open(config)?),
        server_keys: Arc::new(ServerKeyDb::open(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeFlags, assemble};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn config(port: u16) -> NodeConfig {
        assemble(SigningKey::generate(&mut OsRng), NodeFlags { db_port: port })
    }

    #[test]
    fn open_fails_on_undialable_port() {
        let err = open_shared(&config(0)).err().unwrap();
        assert!(err.to_string().contains("accounts"));
    }

    #[test]
    fn open_keeps_descriptor() {
        let stores = open_shared(&config(5555)).unwrap();
        assert_eq!(stores.devices.datastore().parts.port, 5555);
        assert_eq!(stores.server_keys.datastore().parts.database, "p2pnode_serverkey");
    }

    #[tokio::test]
    async fn accounts_are_unique_per_localpart() {
        let db = AccountsDb::open(&config(5432)).unwrap();
        let alice = db.create_account("alice").await.unwrap();
        assert_eq!(alice.user_id, "@alice:p2p");
        assert!(db.create_account("alice").await.is_err());
        assert!(db.create_account("Bad Name").await.is_err());
        assert_eq!(db.account_by_user_id("@alice:p2p").await, Some(alice));
        assert!(db.account_by_user_id("@alice:elsewhere").await.is_none());
    }

    #[tokio::test]
    async fn devices_resolve_by_token() {
        let db = DeviceDb::open(&config(5432)).unwrap();
        let device = db.create_device("@alice:p2p").await;
        assert_eq!(db.device_by_token(&device.access_token).await, Some(device));
        assert!(db.device_by_token("nope").await.is_none());
    }

    #[tokio::test]
    async fn server_keys_round_trip() {
        let db = ServerKeyDb::open(&config(5432)).unwrap();
        db.store_key("remote", "ed25519:a", [7; 32]).await;
        assert_eq!(db.fetch_key("remote", "ed25519:a").await, Some([7; 32]));
        assert_eq!(db.fetch_key("remote", "ed25519:b").await, None);
    }
}
