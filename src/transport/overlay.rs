//! Overlay exposure: HTTP/1.1 over peer-to-peer streams.
//!
//! An [`OverlayHost`] hands out inbound streams for a protocol name.
//! [`OverlayListener`] accepts every stream on [`MATRIX_PROTOCOL`] and serves
//! the node's router over it with `axum::serve`, one HTTP connection per
//! stream.
//!
//! [`MemoryOverlay`] is an in-process host: peers "dial" it and get one end of
//! a duplex pipe.  The libp2p host lives in [`super::swarm`].

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::serve::Listener;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AppError;
use crate::supervisor::readiness::ReadinessReporter;
use crate::supervisor::{Task, TaskFuture};

/// Protocol name the API is served on.
pub const MATRIX_PROTOCOL: &str = "/matrix";

/// Any bidirectional byte stream an overlay can produce.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> OverlayStream for T {}

/// One accepted inbound stream.
pub struct IncomingStream {
    /// Remote peer, in the host's own notation.
    pub peer: String,
    pub stream: Box<dyn OverlayStream>,
}

/// A peer-to-peer host able to accept streams by protocol name.
pub trait OverlayHost: Send + Sync + 'static {
    /// This host's identity as other peers see it.
    fn local_id(&self) -> String;

    /// Start accepting streams for `protocol`.  A protocol can be accepted once.
    fn accept(&self, protocol: &str) -> Result<BoxStream<'static, IncomingStream>, AppError>;
}

// ── OverlayListener ───────────────────────────────────────────────────────────

pub struct OverlayListener {
    host: Arc<dyn OverlayHost>,
    router: Router,
    readiness: ReadinessReporter,
}

impl OverlayListener {
    pub fn new(host: Arc<dyn OverlayHost>, router: Router, readiness: ReadinessReporter) -> Self {
        Self {
            host,
            router,
            readiness,
        }
    }
}

impl Task for OverlayListener {
    fn id(&self) -> &str {
        "overlay"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> TaskFuture {
        Box::pin(serve_overlay(self.host, self.router, self.readiness, shutdown))
    }
}

/// Serve `router` on every `/matrix` stream `host` accepts until shutdown.
pub(crate) async fn serve_overlay(
    host: Arc<dyn OverlayHost>,
    router: Router,
    readiness: ReadinessReporter,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let incoming = match host.accept(MATRIX_PROTOCOL) {
        Ok(incoming) => incoming,
        Err(e) => {
            readiness.set_failed(e.to_string()).await;
            return Err(e);
        }
    };
    let local = format!("{}{MATRIX_PROTOCOL}", host.local_id());
    let closed = CancellationToken::new();
    let acceptor = StreamAcceptor {
        incoming,
        local: local.clone(),
        closed: closed.clone(),
    };
    readiness.set_bound(local.clone()).await;
    info!(addr = %local, "overlay listener serving");

    let server = async {
        axum::serve(acceptor, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    };
    tokio::select! {
        result = server => {
            result.map_err(|e| AppError::Overlay(format!("overlay server error: {e}")))?;
        }
        _ = closed.cancelled() => {
            readiness.set_failed("overlay stream source closed").await;
            return Err(AppError::Overlay(format!("{local}: stream source closed")));
        }
    }

    info!(addr = %local, "overlay listener shut down");
    Ok(())
}

/// Adapts an overlay stream source to axum's listener interface.
///
/// Each accepted stream carries one HTTP/1.1 connection.  When the source
/// ends, `closed` is cancelled and `accept` never resolves again.
struct StreamAcceptor {
    incoming: BoxStream<'static, IncomingStream>,
    local: String,
    closed: CancellationToken,
}

impl Listener for StreamAcceptor {
    type Io = Box<dyn OverlayStream>;
    type Addr = String;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.next().await {
            Some(incoming) => {
                metrics::counter!("p2pnode_overlay_streams_total").increment(1);
                debug!(peer = %incoming.peer, "overlay stream accepted");
                (incoming.stream, incoming.peer)
            }
            None => {
                self.closed.cancel();
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local.clone())
    }
}

// ── MemoryOverlay ─────────────────────────────────────────────────────────────

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-process overlay host.  Clone to share between the listener and dialers.
#[derive(Clone)]
pub struct MemoryOverlay {
    id: String,
    protocols: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<IncomingStream>>>>,
}

impl MemoryOverlay {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocols: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a stream to this host on `protocol`, as peer `from`.
    pub fn dial(&self, from: &str, protocol: &str) -> Result<DuplexStream, AppError> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let protocols = self
            .protocols
            .lock()
            .map_err(|_| AppError::Overlay("memory overlay lock poisoned".into()))?;
        let tx = protocols
            .get(protocol)
            .ok_or_else(|| AppError::Overlay(format!("{} does not accept {protocol}", self.id)))?;
        tx.send(IncomingStream {
            peer: from.to_string(),
            stream: Box::new(remote),
        })
        .map_err(|_| AppError::Overlay(format!("{} stopped accepting {protocol}", self.id)))?;
        Ok(local)
    }
}

impl OverlayHost for MemoryOverlay {
    fn local_id(&self) -> String {
        self.id.clone()
    }

    fn accept(&self, protocol: &str) -> Result<BoxStream<'static, IncomingStream>, AppError> {
        let mut protocols = self
            .protocols
            .lock()
            .map_err(|_| AppError::Overlay("memory overlay lock poisoned".into()))?;
        if protocols.contains_key(protocol) {
            return Err(AppError::Overlay(format!("{protocol} is already being accepted")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        protocols.insert(protocol.to_string(), tx);
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|s| (s, rx))
        })
        .boxed())
    }
}
