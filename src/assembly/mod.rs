//! Component graph assembly.
//!
//! [`assemble`] walks the [`plan::STEPS`] in order, building each component
//! from the handles earlier steps produced and mounting API surfaces on the
//! [`ApiMux`].  Nothing listens until assembly has finished; the first failing
//! step aborts the whole thing.

pub mod plan;

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Router;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::AppError;
use crate::subsystems::api::{self, ApiMux};
use crate::subsystems::appservice::{self, AppServiceDeps, AppServiceQueryApi};
use crate::subsystems::federation::{FederationClient, KeyRing};
use crate::subsystems::fedsender::{self, FederationSender};
use crate::subsystems::roomserver::{self, RoomAliasApi, RoomInputApi, RoomQueryApi};
use crate::subsystems::storage::{self, AccountsDb, DeviceDb, ServerKeyDb};
use crate::subsystems::topic::TopicRegistry;
use crate::subsystems::typing::{self, TypingInputApi};
use crate::subsystems::transactions::TransactionCache;

pub use plan::{ComponentId, ConstructionPlan, PlanTracker};

/// What every component is built on.
pub struct Base {
    pub config: Arc<NodeConfig>,
    pub topics: TopicRegistry,
    pub shutdown: CancellationToken,
    pub mux: ApiMux,
}

impl Base {
    pub fn new(config: Arc<NodeConfig>, shutdown: CancellationToken) -> Self {
        let topics = TopicRegistry::new(config.database.event_log.clone());
        Self {
            config,
            topics,
            shutdown,
            mux: ApiMux::new(),
        }
    }
}

/// The assembled node, ready to be exposed.
pub struct ServingSurface {
    pub router: Router,
    pub assembled: Vec<ComponentId>,
}

/// Every long-lived handle produced during assembly.
pub struct Graph {
    pub accounts: Arc<AccountsDb>,
    pub devices: Arc<DeviceDb>,
    pub server_keys: Arc<ServerKeyDb>,
    pub federation: Arc<FederationClient>,
    pub key_ring: Arc<KeyRing>,
    pub alias: Arc<RoomAliasApi>,
    pub input: Arc<RoomInputApi>,
    pub query: Arc<RoomQueryApi>,
    pub typing: Arc<TypingInputApi>,
    pub appservice: Arc<AppServiceQueryApi>,
    pub federation_sender: Arc<FederationSender>,
    pub topics: TopicRegistry,
    mux: ApiMux,
    assembled: Vec<ComponentId>,
}

impl Graph {
    pub fn assembled(&self) -> &[ComponentId] {
        &self.assembled
    }

    pub fn into_surface(self) -> ServingSurface {
        ServingSurface {
            router: self.mux.into_router(),
            assembled: self.assembled,
        }
    }
}

/// Build the component graph and return the routes it serves.
pub async fn assemble(base: Base) -> Result<ServingSurface, AppError> {
    Ok(assemble_graph(base).await?.into_surface())
}

/// Build the component graph, keeping every handle.
pub async fn assemble_graph(base: Base) -> Result<Graph, AppError> {
    let Base {
        config,
        topics,
        shutdown,
        mut mux,
    } = base;
    let plan = ConstructionPlan::standard().map_err(|e| AppError::Assembly(e.to_string()))?;
    let mut tracker = PlanTracker::new(plan);
    let cfg = config.as_ref();

    let stores = tracker
        .step(ComponentId::SharedStores, async { storage::open_shared(cfg) })
        .await?;

    let (federation, key_ring) = tracker
        .step(ComponentId::Federation, async {
            let client = Arc::new(FederationClient::new(cfg)?);
            let ring = Arc::new(KeyRing::new(stores.server_keys.clone(), client.clone()).await);
            Ok((client, ring))
        })
        .await?;

    let rooms = tracker
        .step(ComponentId::RoomServer, roomserver::setup(cfg, &topics))
        .await?;

    let typing = tracker
        .step(ComponentId::TypingServer, async { Ok(typing::setup(cfg, &topics).await) })
        .await?;

    let appservice = tracker
        .step(ComponentId::AppService, async {
            appservice::setup(
                cfg,
                AppServiceDeps {
                    accounts: stores.accounts.clone(),
                    devices: stores.devices.clone(),
                    federation: federation.clone(),
                    alias: rooms.alias.clone(),
                    query: rooms.query.clone(),
                },
            )
        })
        .await?;

    let federation_sender = tracker
        .step(
            ComponentId::FederationSender,
            fedsender::setup(cfg, federation.clone(), rooms.query.clone(), &topics, shutdown.clone()),
        )
        .await?;

    tracker
        .step(ComponentId::ClientApi, async {
            let client_api = api::client::ClientApi {
                devices: stores.devices.clone(),
                accounts: stores.accounts.clone(),
                federation: federation.clone(),
                key_ring: key_ring.clone(),
                alias: rooms.alias.clone(),
                input: rooms.input.clone(),
                query: rooms.query.clone(),
                typing: typing.clone(),
                appservice: appservice.clone(),
                transactions: TransactionCache::default(),
                federation_sender: federation_sender.clone(),
                user_updates: topics.topic(&cfg.topics.user_updates).await,
            };
            mux.mount("clientapi", api::client::routes(Arc::new(client_api)));
            Ok(())
        })
        .await?;

    tracker
        .step(ComponentId::FederationApi, async {
            let federation_api = api::federation::FederationApi {
                accounts: stores.accounts.clone(),
                devices: stores.devices.clone(),
                federation: federation.clone(),
                key_ring: key_ring.clone(),
                alias: rooms.alias.clone(),
                input: rooms.input.clone(),
                query: rooms.query.clone(),
                appservice: appservice.clone(),
                federation_sender: federation_sender.clone(),
            };
            mux.mount("federationapi", api::federation::routes(Arc::new(federation_api)));
            Ok(())
        })
        .await?;

    tracker
        .step(ComponentId::MediaApi, async {
            let media = api::media::MediaApi {
                datastore: storage::open("mediaapi", &cfg.database.media_api)?,
                devices: stores.devices.clone(),
            };
            mux.mount("mediaapi", api::media::routes(Arc::new(media)));
            Ok(())
        })
        .await?;

    tracker
        .step(ComponentId::PublicRoomsApi, async {
            let public_rooms = api::public_rooms::PublicRoomsApi {
                datastore: storage::open("publicroomsapi", &cfg.database.public_rooms_api)?,
                devices: stores.devices.clone(),
                query: rooms.query.clone(),
                published: RwLock::new(BTreeSet::new()),
            };
            mux.mount("publicroomsapi", api::public_rooms::routes(Arc::new(public_rooms)));
            Ok(())
        })
        .await?;

    tracker
        .step(ComponentId::SyncApi, async {
            let sync = api::sync::SyncApi {
                datastore: storage::open("syncapi", &cfg.database.sync_api)?,
                devices: stores.devices.clone(),
                accounts: stores.accounts.clone(),
                query: rooms.query.clone(),
                federation: federation.clone(),
                config: config.clone(),
                room_events: topics.topic(&cfg.topics.output_room_event).await,
            };
            mux.mount("syncapi", api::sync::routes(Arc::new(sync)));
            Ok(())
        })
        .await?;

    info!(
        components = tracker.assembled().len(),
        surfaces = ?mux.mounted(),
        "component graph assembled"
    );

    Ok(Graph {
        accounts: stores.accounts,
        devices: stores.devices,
        server_keys: stores.server_keys,
        federation,
        key_ring,
        alias: rooms.alias,
        input: rooms.input,
        query: rooms.query,
        typing,
        appservice,
        federation_sender,
        topics,
        mux,
        assembled: tracker.into_assembled(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{NodeFlags, assemble as assemble_config};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    /// A fully assembled node on the default flags.
    pub async fn assembled() -> (Router, Graph) {
        let config = Arc::new(assemble_config(SigningKey::generate(&mut OsRng), NodeFlags::default()));
        let mut graph = assemble_graph(Base::new(config, CancellationToken::new()))
            .await
            .unwrap();
        let router = std::mem::take(&mut graph.mux).into_router();
        (router, graph)
    }

    pub async fn assembled_router() -> Router {
        assembled().await.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeFlags, assemble as assemble_config};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn base(port: u16) -> Base {
        let config = assemble_config(SigningKey::generate(&mut OsRng), NodeFlags { db_port: port });
        Base::new(Arc::new(config), CancellationToken::new())
    }

    #[tokio::test]
    async fn assembles_all_components_in_plan_order() {
        let surface = assemble(base(5432)).await.unwrap();
        assert_eq!(surface.assembled, ConstructionPlan::standard().unwrap().order());
        assert_eq!(surface.assembled.len(), 11);
    }

    #[tokio::test]
    async fn undialable_datastore_aborts_assembly() {
        let err = assemble(base(0)).await.err().unwrap();
        assert!(matches!(err, AppError::Assembly(ref m) if m.contains("shared-stores")));
    }

    #[tokio::test]
    async fn graph_mounts_every_surface() {
        let graph = assemble_graph(base(5432)).await.unwrap();
        assert_eq!(
            graph.mux.mounted(),
            &["clientapi", "federationapi", "mediaapi", "publicroomsapi", "syncapi"]
        );
        assert_eq!(graph.topics.names().await, vec!["roomserverOutput", "typingServerOutput", "userUpdates"]);
    }
}
