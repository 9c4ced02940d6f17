//! Application-service query API.
//!
//! Answers "does this alias / user exist?" on behalf of registered
//! application services.  No services are registered on a p2p node, so the
//! answers come from the local stores only.

use std::sync::Arc;

use tracing::debug;

use crate::config::NodeConfig;
use crate::error::AppError;
use crate::subsystems::federation::FederationClient;
use crate::subsystems::roomserver::{RoomAliasApi, RoomQueryApi};
use crate::subsystems::storage::{self, AccountsDb, Datastore, DeviceDb};
use crate::subsystems::transactions::TransactionCache;

pub struct AppServiceQueryApi {
    pub datastore: Datastore,
    pub accounts: Arc<AccountsDb>,
    pub devices: Arc<DeviceDb>,
    pub federation: Arc<FederationClient>,
    pub alias: Arc<RoomAliasApi>,
    pub query: Arc<RoomQueryApi>,
    pub transactions: TransactionCache,
}

impl AppServiceQueryApi {
    pub async fn room_alias_exists(&self, alias: &str) -> bool {
        let exists = self.alias.room_id_for_alias(alias).await.is_some();
        debug!(alias, exists, "appservice alias query");
        exists
    }

    pub async fn user_id_exists(&self, user_id: &str) -> bool {
        self.accounts.account_by_user_id(user_id).await.is_some()
    }
}

pub(crate) struct AppServiceDeps {
    pub accounts: Arc<AccountsDb>,
    pub devices: Arc<DeviceDb>,
    pub federation: Arc<FederationClient>,
    pub alias: Arc<RoomAliasApi>,
    pub query: Arc<RoomQueryApi>,
}

pub(crate) fn setup(config: &NodeConfig, deps: AppServiceDeps) -> Result<Arc<AppServiceQueryApi>, AppError> {
    Ok(Arc::new(AppServiceQueryApi {
        datastore: storage::open("appservice", &config.database.app_service)?,
        accounts: deps.accounts,
        devices: deps.devices,
        federation: deps.federation,
        alias: deps.alias,
        query: deps.query,
        transactions: TransactionCache::default(),
    }))
}
