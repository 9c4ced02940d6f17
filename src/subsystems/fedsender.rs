//! Federation sender: fans room events out to remote servers.
//!
//! A background task follows the room output topic.  For every event it
//! works out which remote servers have joined members in the room and queues
//! the event for each of them.  The task stops when the lifecycle token is
//! cancelled.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::AppError;
use crate::subsystems::federation::FederationClient;
use crate::subsystems::roomserver::{RoomEvent, RoomQueryApi};
use crate::subsystems::storage::{self, Datastore};
use crate::subsystems::topic::{Record, Topic, TopicRegistry};

const READ_BATCH: usize = 64;

/// Events held per destination before the oldest are dropped.
pub const MAX_PENDING_PER_DESTINATION: usize = 1024;

/// Event ids waiting to be sent to one remote server, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationQueue {
    pending: VecDeque<String>,
}

impl DestinationQueue {
    /// Append `event_id`, evicting the oldest entry once `cap` is reached.
    /// Returns the evicted id.
    pub fn push(&mut self, event_id: String, cap: usize) -> Option<String> {
        let evicted = if self.pending.len() >= cap {
            self.pending.pop_front()
        } else {
            None
        };
        self.pending.push_back(event_id);
        evicted
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.pending.iter()
    }
}

pub struct FederationSender {
    pub datastore: Datastore,
    client: Arc<FederationClient>,
    query: Arc<RoomQueryApi>,
    queues: RwLock<HashMap<String, DestinationQueue>>,
    next_offset: RwLock<u64>,
}

impl FederationSender {
    /// Remote servers with a joined member in `room_id`.
    pub async fn destinations_for(&self, room_id: &str) -> BTreeSet<String> {
        self.query
            .joined_members(room_id)
            .await
            .iter()
            .filter_map(|user| user.split_once(':').map(|(_, server)| server.to_string()))
            .filter(|server| server != self.client.server_name())
            .collect()
    }

    /// Event ids queued for `destination`.
    pub async fn pending(&self, destination: &str) -> Vec<String> {
        self.queues
            .read()
            .await
            .get(destination)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Offset of the next room output record this sender will process.
    pub async fn next_offset(&self) -> u64 {
        *self.next_offset.read().await
    }

    async fn process(&self, event: &RoomEvent) {
        // Events that arrived over federation are not echoed back.
        if event.origin() != Some(self.client.server_name()) {
            return;
        }
        let destinations = self.destinations_for(&event.room_id).await;
        if destinations.is_empty() {
            return;
        }
        let mut queues = self.queues.write().await;
        for destination in &destinations {
            let queue = queues.entry(destination.clone()).or_default();
            if let Some(dropped) = queue.push(event.event_id.clone(), MAX_PENDING_PER_DESTINATION) {
                warn!(%destination, event_id = %dropped, "federation queue full; dropping oldest event");
            }
        }
        debug!(event_id = %event.event_id, count = destinations.len(), "queued for federation");
    }

    /// Process every record from our offset to the end of the log.
    async fn catch_up(&self, topic: &Topic) {
        loop {
            let from = *self.next_offset.read().await;
            let batch = topic.read(from, READ_BATCH).await;
            if batch.is_empty() {
                return;
            }
            for record in &batch {
                match serde_json::from_value::<RoomEvent>(record.value.clone()) {
                    Ok(event) => self.process(&event).await,
                    Err(e) => warn!(offset = record.offset, "skipping malformed room event: {e}"),
                }
            }
            *self.next_offset.write().await = from + batch.len() as u64;
        }
    }

    async fn consume(
        self: Arc<Self>,
        topic: Topic,
        mut live: broadcast::Receiver<Arc<Record>>,
        shutdown: CancellationToken,
    ) {
        self.catch_up(&topic).await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = live.recv() => match received {
                    // The live record only signals new data; the log is the source of truth.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => self.catch_up(&topic).await,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("federation sender consumer stopped");
    }
}

pub(crate) async fn setup(
    config: &NodeConfig,
    client: Arc<FederationClient>,
    query: Arc<RoomQueryApi>,
    topics: &TopicRegistry,
    shutdown: CancellationToken,
) -> Result<Arc<FederationSender>, AppError> {
    let datastore = storage::open("federationsender", &config.database.federation_sender)?;
    let topic = topics.topic(&config.topics.output_room_event).await;
    let sender = Arc::new(FederationSender {
        datastore,
        client,
        query,
        queues: RwLock::new(HashMap::new()),
        next_offset: RwLock::new(0),
    });

    let live = topic.subscribe();
    tokio::spawn(sender.clone().consume(topic, live, shutdown));
    info!(topic = %config.topics.output_room_event, "federation sender consuming");
    Ok(sender)
}
