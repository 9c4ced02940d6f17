//! libp2p overlay host.
//!
//! The swarm runs TCP + noise + yamux with the node's own ed25519 key, so the
//! peer id is derived from the same identity that signs federation traffic.
//! Inbound streams are handed out by `libp2p-stream` per protocol name.
//!
//! The swarm itself must be polled to make progress; [`SwarmListener`] drives
//! it alongside the HTTP server for the `/matrix` protocol.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use ed25519_dalek::SigningKey;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm, identity, noise, tcp, yamux};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::overlay::{IncomingStream, OverlayHost, serve_overlay};
use crate::config::OverlaySettings;
use crate::error::AppError;
use crate::supervisor::readiness::ReadinessReporter;
use crate::supervisor::{Task, TaskFuture};

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Convert the node's signing key into a libp2p identity.
pub fn keypair_from_signing_key(key: &SigningKey) -> Result<identity::Keypair, AppError> {
    let mut bytes = key.to_keypair_bytes();
    let keypair = identity::ed25519::Keypair::try_from_bytes(&mut bytes)
        .map_err(|e| AppError::Overlay(format!("invalid overlay key: {e}")))?;
    Ok(identity::Keypair::from(keypair))
}

/// Handle to a running libp2p swarm.
pub struct SwarmHost {
    peer_id: PeerId,
    control: libp2p_stream::Control,
}

/// Owns the swarm; see [`SwarmDriver::drive`].
pub struct SwarmDriver {
    swarm: Swarm<libp2p_stream::Behaviour>,
}

impl SwarmHost {
    /// Build the swarm and start listening on every configured multiaddr.
    pub fn start(key: &SigningKey, settings: &OverlaySettings) -> Result<(Self, SwarmDriver), AppError> {
        let keypair = keypair_from_signing_key(key)?;
        let peer_id = keypair.public().to_peer_id();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
            .map_err(|e| AppError::Overlay(format!("failed to configure TCP transport: {e}")))?
            .with_behaviour(|_| libp2p_stream::Behaviour::new())
            .map_err(|e| AppError::Overlay(format!("failed to build behaviour: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        for addr in &settings.listen {
            let multiaddr: Multiaddr = addr
                .parse()
                .map_err(|e| AppError::Overlay(format!("invalid listen address {addr}: {e}")))?;
            swarm
                .listen_on(multiaddr)
                .map_err(|e| AppError::Overlay(format!("cannot listen on {addr}: {e}")))?;
        }

        let control = swarm.behaviour().new_control();
        info!(%peer_id, "overlay host started");
        Ok((Self { peer_id, control }, SwarmDriver { swarm }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl OverlayHost for SwarmHost {
    fn local_id(&self) -> String {
        format!("/p2p/{}", self.peer_id)
    }

    fn accept(&self, protocol: &str) -> Result<BoxStream<'static, IncomingStream>, AppError> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| AppError::Overlay(format!("invalid protocol {protocol}: {e}")))?;
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|e| AppError::Overlay(format!("cannot accept {protocol}: {e}")))?;
        Ok(incoming
            .map(|(peer, stream)| IncomingStream {
                peer: peer.to_string(),
                stream: Box::new(stream.compat()),
            })
            .boxed())
    }
}

impl SwarmDriver {
    /// Poll the swarm until `shutdown` is cancelled or a listener dies.
    pub async fn drive(self, shutdown: CancellationToken) -> Result<(), AppError> {
        let mut swarm = self.swarm;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "overlay listening");
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        debug!(%peer_id, "overlay peer connected");
                    }
                    SwarmEvent::ConnectionClosed { peer_id, .. } => {
                        debug!(%peer_id, "overlay peer disconnected");
                    }
                    SwarmEvent::ListenerError { error, .. } => {
                        warn!("overlay listener error: {error}");
                    }
                    SwarmEvent::ListenerClosed { reason: Err(e), .. } => {
                        return Err(AppError::Overlay(format!("overlay listener closed: {e}")));
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }
}

// ── SwarmListener ─────────────────────────────────────────────────────────────

/// Supervised overlay listener backed by a libp2p swarm.
///
/// The swarm is built and bound inside [`Task::run`], so a bad listen address
/// or a taken port surfaces as this task's failure while the other listeners
/// are already running.
pub struct SwarmListener {
    key: SigningKey,
    settings: OverlaySettings,
    router: Router,
    readiness: ReadinessReporter,
}

impl SwarmListener {
    pub fn new(key: SigningKey, settings: OverlaySettings, router: Router, readiness: ReadinessReporter) -> Self {
        Self {
            key,
            settings,
            router,
            readiness,
        }
    }
}

impl Task for SwarmListener {
    fn id(&self) -> &str {
        "overlay"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> TaskFuture {
        let Self {
            key,
            settings,
            router,
            readiness,
        } = *self;
        Box::pin(async move {
            let (host, driver) = match SwarmHost::start(&key, &settings) {
                Ok(started) => started,
                Err(e) => {
                    readiness.set_failed(e.to_string()).await;
                    return Err(e);
                }
            };
            let host: Arc<dyn OverlayHost> = Arc::new(host);
            tokio::try_join!(
                driver.drive(shutdown.clone()),
                serve_overlay(host, router, readiness, shutdown),
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn peer_id_follows_signing_key() {
        let key = SigningKey::generate(&mut OsRng);
        let a = keypair_from_signing_key(&key).unwrap().public().to_peer_id();
        let b = keypair_from_signing_key(&key).unwrap().public().to_peer_id();
        assert_eq!(a, b);

        let other = SigningKey::generate(&mut OsRng);
        assert_ne!(a, keypair_from_signing_key(&other).unwrap().public().to_peer_id());
    }

    #[tokio::test]
    async fn matrix_protocol_accepted_once() {
        let key = SigningKey::generate(&mut OsRng);
        let settings = OverlaySettings {
            enabled: true,
            listen: vec!["/ip4/127.0.0.1/tcp/0".into()],
        };
        let (host, _driver) = SwarmHost::start(&key, &settings).unwrap();
        assert!(host.local_id().starts_with("/p2p/12D3Koo"));
        let _incoming = host.accept(super::super::overlay::MATRIX_PROTOCOL).unwrap();
        assert!(host.accept(super::super::overlay::MATRIX_PROTOCOL).is_err());
    }

    #[tokio::test]
    async fn bad_listen_address_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let settings = OverlaySettings {
            enabled: true,
            listen: vec!["not-a-multiaddr".into()],
        };
        assert!(matches!(SwarmHost::start(&key, &settings), Err(AppError::Overlay(_))));
    }
}
