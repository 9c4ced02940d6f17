//! End-to-end startup: identity → config → component graph → clearnet listener.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use p2pnode::assembly::{self, Base, ComponentId};
use p2pnode::bootstrap::identity::{self, IdentityOrigin};
use p2pnode::config::{self, NodeFlags};
use p2pnode::supervisor::readiness::{ListenerState, ReadinessRegistry};
use p2pnode::supervisor::{self, Task};
use p2pnode::transport::{self, HttpListener, exporter};

// ── helpers ──────────────────────────────────────────────────────────────────

async fn bound_addr(registry: &ReadinessRegistry, id: &str) -> String {
    assert!(registry.wait_ready().await, "listeners failed: {:?}", registry.snapshot().await);
    registry
        .snapshot()
        .await
        .into_iter()
        .find_map(|s| match s.state {
            ListenerState::Bound { addr } if s.id == id => Some(addr),
            _ => None,
        })
        .expect("listener bound")
}

// ── tests ────────────────────────────────────────────────────────────────────

#[test]
fn identity_is_stable_across_restarts() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node-key");

    let first = identity::load_or_create(&path);
    assert_eq!(first.origin, IdentityOrigin::Generated { persisted: true });

    let second = identity::load_or_create(&path);
    assert_eq!(second.origin, IdentityOrigin::Loaded);
    assert_eq!(first.public_key_bytes(), second.public_key_bytes());
}

#[test]
fn db_port_flag_reaches_every_descriptor() {
    let dir = TempDir::new().unwrap();
    let key = identity::load_or_create(&dir.path().join("node-key")).signing_key;
    let cfg = config::assemble(key, NodeFlags { db_port: 5555 });

    for (name, source) in cfg.database.all() {
        let parts = source.parts().unwrap();
        assert_eq!(parts.port, 5555, "{name}");
        assert_eq!(parts.host, "localhost", "{name}");
    }
    assert_eq!(cfg.server_name(), "p2p");
}

#[tokio::test]
async fn node_serves_metrics_and_api_over_clearnet() {
    let metrics = exporter::install();
    let dir = TempDir::new().unwrap();
    let loaded = identity::load_or_create(&dir.path().join("node-key"));
    let cfg = Arc::new(config::assemble(loaded.signing_key, NodeFlags::default()));
    let shutdown = CancellationToken::new();

    let surface = assembly::assemble(Base::new(cfg, shutdown.clone())).await.unwrap();
    assert_eq!(
        surface.assembled,
        vec![
            ComponentId::SharedStores,
            ComponentId::Federation,
            ComponentId::RoomServer,
            ComponentId::TypingServer,
            ComponentId::AppService,
            ComponentId::FederationSender,
            ComponentId::ClientApi,
            ComponentId::FederationApi,
            ComponentId::MediaApi,
            ComponentId::PublicRoomsApi,
            ComponentId::SyncApi,
        ]
    );

    let router = transport::build_routes(surface.router, metrics);
    let registry = ReadinessRegistry::new();
    let tasks: Vec<Box<dyn Task>> = vec![Box::new(HttpListener::new(
        "127.0.0.1:0",
        router,
        registry.reporter("http", true).await,
    ))];
    let node = tokio::spawn(supervisor::run(tasks, shutdown.clone(), registry.clone()));

    let addr = bound_addr(&registry, "http").await;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .header("Origin", "https://example.org")
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);
    assert!(metrics.headers().get("access-control-allow-origin").is_none());
    let text = metrics.text().await.unwrap();
    assert!(text.contains("p2pnode_components_assembled_total"), "{text}");

    let versions = client
        .get(format!("http://{addr}/_matrix/client/versions"))
        .header("Origin", "https://example.org")
        .send()
        .await
        .unwrap();
    assert_eq!(versions.status(), 200);
    assert_eq!(versions.headers()["access-control-allow-origin"], "*");
    let body: serde_json::Value = versions.json().await.unwrap();
    assert!(body["versions"].as_array().is_some_and(|v| !v.is_empty()));

    shutdown.cancel();
    assert!(node.await.unwrap().is_ok());
}

#[tokio::test]
async fn undialable_db_port_starts_no_listener() {
    let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
    let cfg = Arc::new(config::assemble(key, NodeFlags { db_port: 0 }));
    let err = assembly::assemble(Base::new(cfg, CancellationToken::new()))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().starts_with("assembly error"));
}
